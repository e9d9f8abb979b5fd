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

//! The worker-runtime capability.
//!
//! The pool never creates or talks to worker processes itself. Everything
//! that touches a real sandbox goes through [`WorkerRuntime`], which keeps
//! the pool testable against in-memory fakes.

use async_trait::async_trait;
use sandpool_common::{ForwardRequest, ForwardResponse, InstanceId, ProbeStatus, Result};

/// Creates, probes, talks to and destroys worker instances.
///
/// Implementations must be cheap to share; the pool holds one behind an
/// `Arc` and calls it from many tasks at once.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Starts a worker for `id` and returns the address it will listen on.
    ///
    /// The pool probes the address until the worker is ready, so this may
    /// return as soon as the process has been launched.
    async fn start(&self, id: &InstanceId) -> Result<String>;

    /// Stops the worker for `id`. Stopping an unknown id succeeds.
    async fn stop(&self, id: &InstanceId) -> Result<()>;

    /// Lightweight reachability check. Callers bound it with their own timeout.
    ///
    /// Report [`ProbeStatus::Exited`] once the worker process is gone, so a
    /// startup in progress fails right away instead of at its deadline.
    async fn health_check(&self, address: &str) -> ProbeStatus;

    /// Sends `request` to the worker at `address`.
    ///
    /// Returns as soon as response headers arrive; the body streams.
    /// [`SandpoolError::Connection`](sandpool_common::SandpoolError::Connection)
    /// means the request never reached the worker.
    async fn forward(&self, address: &str, request: ForwardRequest) -> Result<ForwardResponse>;
}
