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

use crate::snapshot::{InstanceMetrics, MetricsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Instant, SystemTime};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-instance counters.
#[derive(Debug, Default)]
struct InstanceStats {
    request_count: AtomicU64,
    failure_count: AtomicU64,
    last_request_ms: AtomicU64,
}

impl InstanceStats {
    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.last_request_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, instance_id: &str) -> InstanceMetrics {
        InstanceMetrics {
            instance_id: instance_id.to_string(),
            request_count: self.request_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            last_request_ms: self.last_request_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe metrics registry.
///
/// Global counters are plain atomics updated with `Relaxed` ordering; a
/// snapshot is a best-effort point-in-time view. The instance table sits
/// behind an `RwLock` that is only written when an instance first appears
/// or is forgotten, so the hot path takes a read lock at most.
///
/// Entries are removed explicitly with [`forget_instance`](Self::forget_instance)
/// when the pool stops an instance, which keeps the table bounded by the
/// pool's capacity.
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    retries: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
    instances: StdRwLock<HashMap<String, Arc<InstanceStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            instances: StdRwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Records a finished request and its latency.
    ///
    /// `rejected` requests count as failures too.
    pub fn record_request(&self, latency_us: u64, success: bool, rejected: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if rejected {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_instance_request(&self, instance_id: &str) {
        self.instance_stats(instance_id).record_request();
    }

    pub fn record_instance_failure(&self, instance_id: &str) {
        self.instance_stats(instance_id).record_failure();
    }

    /// Drops the counters of a stopped instance.
    pub fn forget_instance(&self, instance_id: &str) {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
    }

    fn instance_stats(&self, instance_id: &str) -> Arc<InstanceStats> {
        if let Some(stats) = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
        {
            return stats.clone();
        }

        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new(self.uptime_ms());
        snapshot.total_requests = self.total_requests.load(Ordering::Relaxed);
        snapshot.successful_requests = self.successful_requests.load(Ordering::Relaxed);
        snapshot.failed_requests = self.failed_requests.load(Ordering::Relaxed);
        snapshot.rejected_requests = self.rejected_requests.load(Ordering::Relaxed);
        snapshot.retries = self.retries.load(Ordering::Relaxed);
        snapshot.max_latency_us = self.max_latency_us.load(Ordering::Relaxed);
        snapshot.avg_latency_us = self
            .total_latency_us
            .load(Ordering::Relaxed)
            .checked_div(snapshot.total_requests)
            .unwrap_or(0);

        snapshot.instances = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot(id)))
            .collect();

        snapshot
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
