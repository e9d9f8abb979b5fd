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

use crate::registry::MetricsRegistry;
use crate::snapshot::{MetricsSnapshot, ServerInfo};
use std::sync::Arc;
use std::time::Instant;

/// How a dispatched request ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A response was relayed from an instance.
    Relayed,
    /// The request failed after an instance was selected.
    Failed,
    /// The pool had no capacity and the request was turned away.
    Rejected,
}

/// Metrics collector for the dispatcher.
///
/// Tracks caller-facing request statistics and how requests are spread over
/// worker instances.
///
/// # Example
///
/// ```rust
/// use sandpool_metrics::{DispatcherMetricsCollector, RequestOutcome};
/// use std::time::Instant;
///
/// let collector = DispatcherMetricsCollector::new();
/// let start = Instant::now();
/// collector.record_instance_request("instance-1");
/// collector.record_request(start, RequestOutcome::Relayed);
///
/// let snapshot = collector.snapshot();
/// assert_eq!(snapshot.total_requests, 1);
/// assert_eq!(snapshot.instances["instance-1"].request_count, 1);
/// ```
pub struct DispatcherMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl DispatcherMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Creates a collector over an existing registry.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn record_request(&self, start_time: Instant, outcome: RequestOutcome) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_request(
            latency_us,
            outcome == RequestOutcome::Relayed,
            outcome == RequestOutcome::Rejected,
        );
    }

    pub fn record_instance_request(&self, instance_id: &str) {
        self.registry.record_instance_request(instance_id);
    }

    pub fn record_instance_failure(&self, instance_id: &str) {
        self.registry.record_instance_failure(instance_id);
    }

    pub fn record_retry(&self) {
        self.registry.record_retry();
    }

    pub fn forget_instance(&self, instance_id: &str) {
        self.registry.forget_instance(instance_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(self.registry.uptime_ms())
    }
}

impl Default for DispatcherMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_outcomes() {
        let collector = DispatcherMetricsCollector::new();
        let start = Instant::now();
        collector.record_request(start, RequestOutcome::Relayed);
        collector.record_request(start, RequestOutcome::Failed);
        collector.record_request(start, RequestOutcome::Rejected);
        collector.record_retry();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 2);
        assert_eq!(snapshot.rejected_requests, 1);
        assert_eq!(snapshot.retries, 1);
    }

    #[test]
    fn test_shared_registry() {
        let registry = Arc::new(MetricsRegistry::new());
        let a = DispatcherMetricsCollector::with_registry(registry.clone());
        let b = DispatcherMetricsCollector::with_registry(registry);
        a.record_instance_request("instance-1");
        b.record_instance_request("instance-1");
        assert_eq!(a.snapshot().instances["instance-1"].request_count, 2);
    }

    #[test]
    fn test_server_info() {
        let collector = DispatcherMetricsCollector::new();
        let info = collector.server_info();
        assert_eq!(info.name, "sandpool");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = DispatcherMetricsCollector::new();
        collector.record_instance_request("instance-3");
        let value = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(value["instances"]["instance-3"]["request_count"], 1);
    }
}
