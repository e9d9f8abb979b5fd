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

//! Sandpool Metrics Collection
//!
//! Thread-safe request metrics for the sandpool dispatcher: caller-facing
//! request counts and latency, retries, capacity rejections, and the spread
//! of requests over worker instances.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: atomic counters plus a per-instance table
//! - [`DispatcherMetricsCollector`]: the dispatcher-facing recording API
//! - [`MetricsSnapshot`]: serializable point-in-time view, served by the
//!   admin endpoint
//!
//! # Usage Example
//!
//! ```rust
//! use sandpool_metrics::{DispatcherMetricsCollector, RequestOutcome};
//! use std::time::Instant;
//!
//! let collector = DispatcherMetricsCollector::new();
//! let start = Instant::now();
//! // ... forward a request ...
//! collector.record_request(start, RequestOutcome::Relayed);
//! println!("Total requests: {}", collector.snapshot().total_requests);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{DispatcherMetricsCollector, RequestOutcome};
pub use registry::MetricsRegistry;
pub use snapshot::{InstanceMetrics, MetricsSnapshot, ServerInfo};
