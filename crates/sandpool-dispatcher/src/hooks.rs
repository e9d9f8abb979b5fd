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

//! Lifecycle event hooks.
//!
//! The pool calls these at fixed transition points, always after its
//! bookkeeping lock has been released, so a hook may call back into the pool.

use sandpool_common::{InstanceId, SandpoolError};
use tracing::{debug, info, warn};

use crate::instance::InstanceState;

/// Why an instance was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Idle longer than the reaper threshold.
    Idle,
    /// Stayed unhealthy past the grace period.
    Unhealthy,
    /// Never became ready.
    StartupFailed,
    /// The pool is shutting down.
    Shutdown,
    /// Explicit `destroy` call.
    Requested,
}

/// Observer for instance lifecycle events. Every method defaults to a no-op.
pub trait LifecycleHooks: Send + Sync {
    /// The instance passed its readiness probe and is taking traffic.
    fn on_start(&self, _id: &InstanceId) {}

    /// The instance reached `Stopped` and left the pool.
    fn on_stop(&self, _id: &InstanceId, _reason: StopReason) {}

    /// Something went wrong with an instance or the runtime.
    fn on_error(&self, _id: Option<&InstanceId>, _error: &SandpoolError) {}

    fn on_state_change(&self, _id: &InstanceId, _from: InstanceState, _to: InstanceState) {}
}

/// Default hooks: log every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingHooks;

impl LifecycleHooks for TracingHooks {
    fn on_start(&self, id: &InstanceId) {
        info!(instance = %id, "Instance successfully started");
    }

    fn on_stop(&self, id: &InstanceId, reason: StopReason) {
        info!(instance = %id, ?reason, "Instance successfully shut down");
    }

    fn on_error(&self, id: Option<&InstanceId>, error: &SandpoolError) {
        match id {
            Some(id) => warn!(instance = %id, kind = error.kind().as_str(), "Instance error: {}", error),
            None => warn!(kind = error.kind().as_str(), "Instance error: {}", error),
        }
    }

    fn on_state_change(&self, id: &InstanceId, from: InstanceState, to: InstanceState) {
        debug!(instance = %id, ?from, ?to, "Instance state changed");
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}
