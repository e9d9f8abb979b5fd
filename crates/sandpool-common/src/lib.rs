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

//! Sandpool Common Types
//!
//! Shared error taxonomy and protocol types for the sandpool dispatcher.
//!
//! # Overview
//!
//! Sandpool fronts a pool of sandboxed, long-lived worker processes. Inbound
//! HTTP requests are routed to one of the pool's instances, which are started
//! on demand, health-checked, and shut down when idle. This crate holds the
//! pieces every other sandpool crate agrees on:
//!
//! - **Errors**: [`SandpoolError`] and its stable [`ErrorKind`]
//! - **Identity**: [`InstanceId`] for worker instances
//! - **Probes**: [`ProbeStatus`] as reported by the worker runtime
//! - **HTTP shapes**: [`ForwardRequest`] / [`ForwardResponse`], idempotency
//!   and hop-by-hop header rules, and the caller-facing error response
//!
//! # Example
//!
//! ```
//! use sandpool_common::{error_response, SandpoolError};
//!
//! let response = error_response(&SandpoolError::NoCapacity { max_concurrent: 3 });
//! assert_eq!(response.status(), 503);
//! ```

pub mod protocol;

pub use protocol::*;
