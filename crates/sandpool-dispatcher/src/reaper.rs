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

//! Idle instance eviction.

use futures::future::join_all;
use sandpool_common::InstanceId;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::instance::InstanceState;
use crate::pool::{InstancePool, Teardown};

/// Idle reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Ready instances with no traffic for longer than this are stopped.
    pub idle_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Background task that stops instances nobody has used for a while.
///
/// Never touches an instance with requests in flight, however stale its
/// last activity is.
pub struct IdleReaper {
    pool: InstancePool,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(pool: InstancePool, config: ReaperConfig) -> Self {
        Self { pool, config }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick fires immediately and there is nothing to reap yet
        interval.tick().await;

        loop {
            interval.tick().await;
            self.reap_once().await;
        }
    }

    /// Runs one reaping cycle and returns the ids it stopped.
    pub async fn reap_once(&self) -> Vec<InstanceId> {
        self.reap_at(Instant::now()).await
    }

    /// Runs one reaping cycle as if the clock read `now`.
    pub async fn reap_at(&self, now: Instant) -> Vec<InstanceId> {
        let threshold = self.config.idle_threshold;
        let idle: Vec<InstanceId> = self
            .pool
            .snapshot()
            .into_iter()
            .filter(|instance| {
                instance.state == InstanceState::Ready
                    && instance.concurrent_requests == 0
                    && instance.idle_for(now) > threshold
            })
            .map(|instance| instance.id)
            .collect();

        if idle.is_empty() {
            return Vec::new();
        }
        debug!(count = idle.len(), "Reaping idle instances");

        // The pool re-checks each condition atomically before draining
        let teardowns = idle
            .iter()
            .map(|id| self.pool.reap_idle(id, threshold, now));
        let results = join_all(teardowns).await;
        let mut reaped = Vec::new();
        for (id, result) in idle.into_iter().zip(results) {
            match result {
                Ok(Teardown::Drained) | Ok(Teardown::ForceKilled) => {
                    info!(instance = %id, "Stopped idle instance");
                    reaped.push(id);
                }
                Ok(_) => {}
                Err(e) => warn!(instance = %id, "Failed to stop idle instance: {}", e),
            }
        }
        reaped
    }
}
