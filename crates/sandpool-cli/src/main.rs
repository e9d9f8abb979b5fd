//! # Sandpool CLI Entry Point
//!
//! Main binary for the sandpool dispatcher.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on :8080, starting up to 3 copies of ./worker on demand
//! sandpool serve --command ./worker
//!
//! # Pass arguments to the worker and keep one instance warm
//! sandpool serve -c node --arg server.js --prewarm 1 --max-instances 5
//!
//! # Inspect a running dispatcher (outputs raw JSON)
//! sandpool status http://127.0.0.1:8080
//! ```

use anyhow::{anyhow, Result};
use argh::FromArgs;
use sandpool_cli::status;
use sandpool_dispatcher::{
    strategy_by_name, HttpServer, ProcessConfig, ProcessRuntime, SandpoolConfig, Service,
    TracingHooks,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// Sandpool - load-balancing dispatcher over on-demand worker processes
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Status(StatusArgs),
}

/// Arguments for running the dispatcher.
///
/// Workers are started lazily on the first request that finds no ready
/// instance, and stopped again after sitting idle.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the dispatcher in front of a pool of worker processes
struct ServeArgs {
    /// address to bind the dispatcher's HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// program that runs one worker; it must serve HTTP on the port it is
    /// given through the port environment variable
    #[argh(option, short = 'c')]
    command: String,

    /// argument passed to the worker command (repeatable)
    #[argh(option, long = "arg")]
    args: Vec<String>,

    /// environment variable holding the worker's port
    #[argh(option, long = "port-env", default = "\"PORT\".into()")]
    port_env: String,

    /// path probed to decide whether a worker is healthy
    #[argh(option, long = "probe-path", default = "\"/status\".into()")]
    probe_path: String,

    /// maximum number of instances alive at once
    #[argh(option, short = 'm', long = "max-instances", default = "3")]
    max_instances: usize,

    /// idle time in seconds after which a worker is stopped
    #[argh(option, long = "idle-timeout", default = "300")]
    idle_timeout_secs: u64,

    /// seconds a new worker has to become ready
    #[argh(option, long = "startup-timeout", default = "30")]
    startup_timeout_secs: u64,

    /// seconds between background health probes
    #[argh(option, long = "probe-interval", default = "5")]
    probe_interval_secs: u64,

    /// timeout for each health probe in milliseconds
    #[argh(option, long = "probe-timeout", default = "2000")]
    probe_timeout_ms: u64,

    /// timeout for each forwarded request in seconds
    #[argh(option, long = "forward-timeout", default = "30")]
    forward_timeout_secs: u64,

    /// seconds to wait for in-flight requests before killing a worker
    #[argh(option, long = "force-kill-timeout", default = "10")]
    force_kill_timeout_secs: u64,

    /// seconds an unhealthy worker gets to recover before it is stopped
    #[argh(option, long = "unhealthy-grace", default = "15")]
    unhealthy_grace_secs: u64,

    /// consecutive failures before a worker is taken out of rotation
    #[argh(option, long = "failure-threshold", default = "3")]
    failure_threshold: u32,

    /// retries of a failed request on another ready worker
    #[argh(option, long = "max-retries", default = "1")]
    max_retries: usize,

    /// instance selection strategy: least-loaded or round-robin
    #[argh(option, long = "strategy", default = "\"least-loaded\".into()")]
    strategy: String,

    /// workers to start before accepting traffic
    #[argh(option, long = "prewarm", default = "0")]
    prewarm: usize,

    /// largest request body accepted, in bytes
    #[argh(option, long = "max-body-bytes", default = "16 * 1024 * 1024")]
    max_body_bytes: usize,

    /// start another worker once every ready one carries this many requests
    #[argh(option, long = "scale-out-threshold")]
    scale_out_threshold: Option<u32>,

    /// milliseconds a request may wait for capacity before getting a 503
    #[argh(option, long = "acquire-wait-ms", default = "0")]
    acquire_wait_ms: u64,
}

impl ServeArgs {
    fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            args: self.args.clone(),
            port_env: self.port_env.clone(),
            probe_path: self.probe_path.clone(),
            ..ProcessConfig::new(self.command.clone())
        }
    }

    fn sandpool_config(&self) -> SandpoolConfig {
        let mut config = SandpoolConfig::default();

        config.pool.max_concurrent = self.max_instances;
        config.pool.startup_deadline = Duration::from_secs(self.startup_timeout_secs);
        config.pool.readiness_probe_timeout = Duration::from_millis(self.probe_timeout_ms);
        config.pool.failure_threshold = self.failure_threshold;
        config.pool.force_kill_timeout = Duration::from_secs(self.force_kill_timeout_secs);
        config.pool.unhealthy_grace = Duration::from_secs(self.unhealthy_grace_secs);
        config.pool.scale_out_threshold = self.scale_out_threshold;

        config.health.interval = Duration::from_secs(self.probe_interval_secs);
        config.health.timeout = Duration::from_millis(self.probe_timeout_ms);
        config.health.failure_threshold = self.failure_threshold;

        config.reaper.idle_threshold = Duration::from_secs(self.idle_timeout_secs);

        config.dispatcher.forward_timeout = Duration::from_secs(self.forward_timeout_secs);
        config.dispatcher.max_retries = self.max_retries;
        config.dispatcher.acquire_wait = Duration::from_millis(self.acquire_wait_ms);

        config
    }
}

/// Arguments for inspecting a running dispatcher.
///
/// Prints one JSON object with every instance, its state, load and request
/// counts. Suitable for piping into `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// print a running dispatcher's instances as JSON
struct StatusArgs {
    /// address of the dispatcher, including the http:// prefix
    #[argh(positional)]
    server_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `status` output clean for piping
    if !matches!(cli.command, Commands::Status(_)) {
        // Default to INFO, RUST_LOG overrides
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Status(args) => status::run_status(&args.server_address).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow!("Invalid bind address {}: {}", args.bind, e))?;
    let strategy = strategy_by_name(&args.strategy).ok_or_else(|| {
        anyhow!(
            "Invalid strategy '{}': expected least-loaded or round-robin",
            args.strategy
        )
    })?;

    tracing::info!("Starting sandpool dispatcher");
    tracing::info!("Binding to: {}", addr);
    tracing::info!("Worker command: {} {:?}", args.command, args.args);

    let runtime = Arc::new(ProcessRuntime::new(args.process_config()));
    let service = Service::start_with(
        runtime,
        args.sandpool_config(),
        strategy,
        Arc::new(TracingHooks),
    )?;

    if args.prewarm > 0 {
        let started = service.pool().warm_up(args.prewarm).await?;
        tracing::info!("Pre-warmed {} instance(s)", started);
    }

    let server = HttpServer::with_body_limit(service.dispatcher().clone(), args.max_body_bytes);
    let served = server
        .run_until(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    service.shutdown().await;
    served?;
    Ok(())
}
