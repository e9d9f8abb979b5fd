//! Shared fixtures for the dispatcher integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use hyper::body::Bytes;
use sandpool_common::{
    ForwardRequest, ForwardResponse, InstanceId, ProbeStatus, Result, SandpoolError,
};
use sandpool_dispatcher::{
    HttpForwarder, InstancePool, InstanceState, LeastLoaded, LifecycleHooks, NoopHooks,
    PoolConfig, StopReason, WorkerRuntime,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Address the fake runtime hands out for `id`.
pub fn address_of(id: &InstanceId) -> String {
    format!("10.0.0.{}:8080", id.seq())
}

/// In-memory worker runtime with switchable failure modes.
///
/// Instances live at `10.0.0.<seq>:8080`; a successful forward answers
/// `200` with the instance address as the body.
#[derive(Default)]
pub struct FakeRuntime {
    start_delay: Mutex<Duration>,
    forward_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    fail_start: AtomicBool,
    never_ready: AtomicBool,
    exit_on_start: AtomicBool,
    unhealthy: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    refusing: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, StatusCode>>,
    started: Mutex<Vec<InstanceId>>,
    stopped: Mutex<Vec<InstanceId>>,
    forwarded: Mutex<Vec<(String, Method)>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn set_forward_delay(&self, delay: Duration) {
        *self.forward_delay.lock().unwrap() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Started workers never pass their readiness probe.
    pub fn never_ready(&self, never: bool) {
        self.never_ready.store(never, Ordering::SeqCst);
    }

    /// Started workers die before their first readiness check answers.
    pub fn exit_on_start(&self, exit: bool) {
        self.exit_on_start.store(exit, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, id: &InstanceId, unhealthy: bool) {
        let mut set = self.unhealthy.lock().unwrap();
        if unhealthy {
            set.insert(address_of(id));
        } else {
            set.remove(&address_of(id));
        }
    }

    /// Forwards to `id` fail after the request went out.
    pub fn set_failing(&self, id: &InstanceId, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(address_of(id));
        } else {
            set.remove(&address_of(id));
        }
    }

    /// Connections to `id` are refused.
    pub fn set_refusing(&self, id: &InstanceId) {
        self.refusing.lock().unwrap().insert(address_of(id));
    }

    pub fn set_status(&self, id: &InstanceId, status: StatusCode) {
        self.statuses.lock().unwrap().insert(address_of(id), status);
    }

    pub fn started(&self) -> Vec<InstanceId> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<InstanceId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn forwarded(&self) -> Vec<(String, Method)> {
        self.forwarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn start(&self, id: &InstanceId) -> Result<String> {
        let delay = *self.start_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandpoolError::Runtime("container image missing".to_string()));
        }
        self.started.lock().unwrap().push(id.clone());
        Ok(address_of(id))
    }

    async fn stop(&self, id: &InstanceId) -> Result<()> {
        self.stopped.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn health_check(&self, address: &str) -> ProbeStatus {
        let delay = *self.probe_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.exit_on_start.load(Ordering::SeqCst) {
            return ProbeStatus::Exited("exit status: 3".to_string());
        }
        if self.never_ready.load(Ordering::SeqCst) || self.unhealthy.lock().unwrap().contains(address) {
            ProbeStatus::Unhealthy("status 503 Service Unavailable".to_string())
        } else {
            ProbeStatus::Healthy
        }
    }

    async fn forward(&self, address: &str, request: ForwardRequest) -> Result<ForwardResponse> {
        self.forwarded
            .lock()
            .unwrap()
            .push((address.to_string(), request.method().clone()));

        let delay = *self.forward_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if self.refusing.lock().unwrap().contains(address) {
            return Err(SandpoolError::Connection(format!("connection refused ({})", address)));
        }
        if self.failing.lock().unwrap().contains(address) {
            return Err(SandpoolError::Transport(format!("connection reset by {}", address)));
        }

        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(StatusCode::OK);
        let mut response = Response::new(Body::from(address.to_string()));
        *response.status_mut() = status;
        Ok(response)
    }
}

/// Pool settings scaled down so tests run in milliseconds.
pub fn fast_pool_config(max_concurrent: usize) -> PoolConfig {
    PoolConfig {
        max_concurrent,
        startup_deadline: Duration::from_secs(1),
        readiness_poll_interval: Duration::from_millis(10),
        readiness_probe_timeout: Duration::from_millis(100),
        failure_threshold: 3,
        force_kill_timeout: Duration::from_millis(500),
        unhealthy_grace: Duration::from_secs(3600),
        scale_out_threshold: None,
    }
}

/// Polls `check` every 10ms until it holds, panicking after `limit`.
pub async fn eventually<F>(limit: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition still false after {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn pool_with(runtime: Arc<FakeRuntime>, config: PoolConfig) -> InstancePool {
    InstancePool::new(runtime, Arc::new(LeastLoaded), Arc::new(NoopHooks), config)
}

pub fn request(method: Method, path: &str) -> ForwardRequest {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Bytes::new())
        .unwrap()
}

pub async fn body_string(response: ForwardResponse) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Hooks that remember every event as a short string.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl LifecycleHooks for RecordingHooks {
    fn on_start(&self, id: &InstanceId) {
        self.events.lock().unwrap().push(format!("start {}", id));
    }

    fn on_stop(&self, id: &InstanceId, reason: StopReason) {
        self.events
            .lock()
            .unwrap()
            .push(format!("stop {} {:?}", id, reason));
    }

    fn on_error(&self, id: Option<&InstanceId>, error: &SandpoolError) {
        let id = id.map(|id| id.to_string()).unwrap_or_default();
        self.events
            .lock()
            .unwrap()
            .push(format!("error {} {}", id, error.kind().as_str()));
    }

    fn on_state_change(&self, id: &InstanceId, from: InstanceState, to: InstanceState) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {:?}->{:?}", id, from, to));
    }
}

/// Runtime whose workers are real axum servers on loopback ports.
///
/// Each worker answers `GET /status` with `ok`, `POST /convert` with the
/// size of the upload, and anything else with `<id> <METHOD> <path?query>`.
#[derive(Default)]
pub struct AxumRuntime {
    forwarder: HttpForwarder,
    servers: Mutex<HashMap<InstanceId, tokio::task::JoinHandle<()>>>,
}

impl AxumRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn running(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerRuntime for AxumRuntime {
    async fn start(&self, id: &InstanceId) -> Result<String> {
        use axum::{extract::Request as AxumRequest, routing::{get, post}, Router};

        let worker = id.to_string();
        let converter = worker.clone();
        let app = Router::new()
            .route("/status", get(|| async { "ok" }))
            .route(
                "/convert",
                post(move |body: Bytes| async move {
                    format!("{} converted {} bytes", converter, body.len())
                }),
            )
            .fallback(move |request: AxumRequest| async move {
                let target = request
                    .uri()
                    .path_and_query()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                format!("{} {} {}", worker, request.method(), target)
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        self.servers.lock().unwrap().insert(id.clone(), handle);
        Ok(address)
    }

    async fn stop(&self, id: &InstanceId) -> Result<()> {
        if let Some(handle) = self.servers.lock().unwrap().remove(id) {
            handle.abort();
        }
        Ok(())
    }

    async fn health_check(&self, address: &str) -> ProbeStatus {
        self.forwarder.probe(address).await
    }

    async fn forward(&self, address: &str, request: ForwardRequest) -> Result<ForwardResponse> {
        self.forwarder.forward(address, request).await
    }
}
