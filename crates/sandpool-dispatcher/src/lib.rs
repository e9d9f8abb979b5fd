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

//! Sandpool dispatcher.
//!
//! Routes inbound HTTP requests across a dynamically sized pool of worker
//! instances. Instances are started on demand up to a fixed ceiling, probed
//! for health, failed over when they misbehave and stopped when idle.
//!
//! The pieces, leaves first:
//!
//! - [`Instance`]: one worker and its lifecycle state
//! - [`InstancePool`]: owns the instances, enforces capacity, hands out leases
//! - [`HealthChecker`]: probes instances and feeds results to the pool
//! - [`IdleReaper`]: stops instances nobody has used for a while
//! - [`Dispatcher`]: leases an instance, forwards, relays, retries
//! - [`Service`]: all of the above, started and stopped together
//!
//! Workers themselves are created and reached through a [`WorkerRuntime`];
//! [`ProcessRuntime`] runs them as local child processes.

pub mod dispatcher;
pub mod forward;
pub mod health_checker;
pub mod hooks;
pub mod http_router;
pub mod http_server;
pub mod instance;
pub mod pool;
pub mod process;
pub mod reaper;
pub mod runtime;
pub mod selection;
pub mod service;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use forward::HttpForwarder;
pub use health_checker::{HealthCheckConfig, HealthCheckUpdate, HealthChecker};
pub use hooks::{LifecycleHooks, NoopHooks, StopReason, TracingHooks};
pub use http_router::{router, InstanceView, ADMIN_PREFIX, DEFAULT_MAX_BODY_BYTES};
pub use http_server::HttpServer;
pub use instance::{Instance, InstanceState, Outcome};
pub use pool::{InstancePool, Lease, PoolConfig, Teardown};
pub use process::{ProcessConfig, ProcessRuntime};
pub use reaper::{IdleReaper, ReaperConfig};
pub use runtime::WorkerRuntime;
pub use selection::{strategy_by_name, Candidate, LeastLoaded, RoundRobin, SelectionStrategy};
pub use service::{SandpoolConfig, Service};
