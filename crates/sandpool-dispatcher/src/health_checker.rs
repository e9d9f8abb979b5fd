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

use futures::future::join_all;
use sandpool_common::{InstanceId, ProbeStatus, SandpoolError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::instance::InstanceState;
use crate::pool::InstancePool;

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed probes before an instance is marked unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(2000),
            failure_threshold: 3,
        }
    }
}

/// What to do with an instance after one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckUpdate {
    pub instance_id: InstanceId,
    pub status: ProbeStatus,
    pub consecutive_failures: u32,
    pub should_recover: bool,
    pub should_mark_unhealthy: bool,
}

impl HealthCheckUpdate {
    /// Decides the follow-up for a probe of an instance in `state` whose
    /// consecutive failure count, this probe included, is `failures`.
    pub fn from_probe(
        instance_id: InstanceId,
        state: InstanceState,
        status: ProbeStatus,
        failures: u32,
        threshold: u32,
    ) -> Self {
        let healthy = status.is_healthy();
        Self {
            instance_id,
            should_recover: healthy && state == InstanceState::Unhealthy,
            should_mark_unhealthy: !healthy
                && failures >= threshold
                && state == InstanceState::Ready,
            status,
            consecutive_failures: failures,
        }
    }
}

/// Probes instances and feeds the results back into the pool.
///
/// Runs every `interval`, and also whenever the pool reports an instance
/// that keeps failing requests. Never drains anything itself: instances it
/// marks unhealthy are torn down by the pool once their grace runs out.
pub struct HealthChecker {
    pool: InstancePool,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(pool: InstancePool, config: HealthCheckConfig) -> Self {
        Self { pool, config }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main health check loop
    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        // A slow round of probes pushes the next one back instead of bunching up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.check_all().await,
                _ = self.pool.recheck_signal().notified() => self.recheck_pending().await,
            }
        }
    }

    /// Probes every ready or unhealthy instance once.
    pub async fn check_all(&self) {
        let targets: Vec<(InstanceId, String)> = self
            .pool
            .snapshot()
            .into_iter()
            .filter(|instance| {
                matches!(
                    instance.state,
                    InstanceState::Ready | InstanceState::Unhealthy
                )
            })
            .filter_map(|instance| instance.address.map(|address| (instance.id, address)))
            .collect();

        self.probe_all(targets).await;
    }

    /// Probes the instances the pool flagged after repeated request failures.
    pub async fn recheck_pending(&self) {
        let targets: Vec<(InstanceId, String)> = self
            .pool
            .take_rechecks()
            .into_iter()
            .filter_map(|id| {
                let address = self.pool.get(&id)?.address?;
                Some((id, address))
            })
            .collect();
        if !targets.is_empty() {
            debug!(count = targets.len(), "Re-checking instances after request failures");
        }
        self.probe_all(targets).await;
    }

    // Check all targets in parallel
    async fn probe_all(&self, targets: Vec<(InstanceId, String)>) {
        let checks = targets.into_iter().map(|(id, address)| async move {
            let status = self.probe(&id, &address).await;
            (id, status)
        });

        for (id, status) in join_all(checks).await {
            if let Some(update) = self.process_probe_result(id, status) {
                self.apply_health_update(update);
            }
        }
    }

    async fn probe(&self, id: &InstanceId, address: &str) -> ProbeStatus {
        let check = self.pool.runtime().health_check(address);
        match tokio::time::timeout(self.config.timeout, check).await {
            Ok(status) => status,
            Err(_) => {
                let error = SandpoolError::ProbeTimeout {
                    instance_id: id.clone(),
                    timeout_ms: self.config.timeout.as_millis() as u64,
                };
                debug!("{}", error);
                ProbeStatus::Timeout
            }
        }
    }

    /// Records the probe in the pool. `None` if the instance is gone.
    fn process_probe_result(&self, id: InstanceId, status: ProbeStatus) -> Option<HealthCheckUpdate> {
        let failures = self.pool.record_probe(&id, &status)?;
        let state = self.pool.get(&id)?.state;
        Some(HealthCheckUpdate::from_probe(
            id,
            state,
            status,
            failures,
            self.config.failure_threshold,
        ))
    }

    fn apply_health_update(&self, update: HealthCheckUpdate) {
        if update.should_recover && self.pool.recover(&update.instance_id) {
            info!(
                instance = %update.instance_id,
                "Instance back in rotation after health check recovery"
            );
        }

        if update.should_mark_unhealthy && self.pool.mark_unhealthy(&update.instance_id) {
            let reason = match &update.status {
                ProbeStatus::Unhealthy(msg) => msg.as_str(),
                ProbeStatus::Timeout => "probe timed out",
                ProbeStatus::Exited(msg) => msg.as_str(),
                ProbeStatus::Healthy => "unknown error",
            };
            warn!(
                instance = %update.instance_id,
                "Instance disabled after {} consecutive health check failures: {}",
                update.consecutive_failures,
                reason
            );
        }
    }
}
