// Copyright 2025 Sandpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The assembled dispatcher service.
//!
//! A [`Service`] owns one pool, the dispatcher in front of it and the two
//! background tasks behind it. Nothing here is global: build one per
//! process (or per test) and shut it down when done.

use sandpool_common::{InstanceId, Result, SandpoolError};
use sandpool_metrics::DispatcherMetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::health_checker::{HealthCheckConfig, HealthChecker};
use crate::hooks::{LifecycleHooks, StopReason, TracingHooks};
use crate::instance::InstanceState;
use crate::pool::{InstancePool, PoolConfig};
use crate::reaper::{IdleReaper, ReaperConfig};
use crate::runtime::WorkerRuntime;
use crate::selection::{LeastLoaded, SelectionStrategy};

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct SandpoolConfig {
    pub pool: PoolConfig,
    pub health: HealthCheckConfig,
    pub reaper: ReaperConfig,
    pub dispatcher: DispatcherConfig,
}

fn non_zero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(SandpoolError::InvalidConfig(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

fn at_least_one(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(SandpoolError::InvalidConfig(format!("{} must be at least 1", name)));
    }
    Ok(())
}

impl SandpoolConfig {
    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        at_least_one("max_concurrent", self.pool.max_concurrent as u64)?;
        at_least_one("pool failure_threshold", self.pool.failure_threshold.into())?;
        at_least_one("health failure_threshold", self.health.failure_threshold.into())?;
        if let Some(threshold) = self.pool.scale_out_threshold {
            at_least_one("scale_out_threshold", threshold.into())?;
        }

        non_zero("startup_deadline", self.pool.startup_deadline)?;
        non_zero("readiness_poll_interval", self.pool.readiness_poll_interval)?;
        non_zero("readiness_probe_timeout", self.pool.readiness_probe_timeout)?;
        non_zero("health interval", self.health.interval)?;
        non_zero("health timeout", self.health.timeout)?;
        non_zero("reaper interval", self.reaper.interval)?;
        non_zero("idle_threshold", self.reaper.idle_threshold)?;
        non_zero("forward_timeout", self.dispatcher.forward_timeout)?;

        if self.dispatcher.backoff_multiplier < 1.0 {
            return Err(SandpoolError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forwards to the configured hooks and drops per-instance metrics once an
/// instance is gone.
struct MetricsHooks {
    inner: Arc<dyn LifecycleHooks>,
    metrics: Arc<DispatcherMetricsCollector>,
}

impl LifecycleHooks for MetricsHooks {
    fn on_start(&self, id: &InstanceId) {
        self.inner.on_start(id);
    }

    fn on_stop(&self, id: &InstanceId, reason: StopReason) {
        self.metrics.forget_instance(&id.to_string());
        self.inner.on_stop(id, reason);
    }

    fn on_error(&self, id: Option<&InstanceId>, error: &SandpoolError) {
        self.inner.on_error(id, error);
    }

    fn on_state_change(&self, id: &InstanceId, from: InstanceState, to: InstanceState) {
        self.inner.on_state_change(id, from, to);
    }
}

/// A running pool, its dispatcher and its background tasks.
pub struct Service {
    dispatcher: Arc<Dispatcher>,
    pool: InstancePool,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Starts a service with least-loaded selection and logging hooks.
    pub fn start(runtime: Arc<dyn WorkerRuntime>, config: SandpoolConfig) -> Result<Self> {
        Self::start_with(runtime, config, Arc::new(LeastLoaded), Arc::new(TracingHooks))
    }

    /// Starts a service with a custom selection strategy and hooks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with(
        runtime: Arc<dyn WorkerRuntime>,
        config: SandpoolConfig,
        strategy: Arc<dyn SelectionStrategy>,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(DispatcherMetricsCollector::new());
        let hooks = Arc::new(MetricsHooks {
            inner: hooks,
            metrics: metrics.clone(),
        });
        let pool = InstancePool::new(runtime, strategy, hooks, config.pool.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            metrics,
            config.dispatcher.clone(),
        ));

        let tasks = vec![
            HealthChecker::new(pool.clone(), config.health.clone()).spawn(),
            IdleReaper::new(pool.clone(), config.reaper.clone()).spawn(),
        ];

        info!(
            max_concurrent = config.pool.max_concurrent,
            idle_threshold_secs = config.reaper.idle_threshold.as_secs(),
            "Sandpool service started"
        );

        Ok(Self {
            dispatcher,
            pool,
            tasks,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Stops the background tasks, then every instance.
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pool.shutdown().await;
        info!("Sandpool service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
