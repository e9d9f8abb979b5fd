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

use sandpool_common::{InstanceId, ProbeStatus};
use serde::Serialize;
use std::time::Instant;

/// Lifecycle state of a worker instance.
///
/// ```text
/// Starting ──> Ready ──> Draining ──> Stopped
///    │           │  ^        ^
///    │           v  │        │
///    │        Unhealthy ─────┘
///    └──────────────────────────────> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Ready,
    Draining,
    Unhealthy,
    Stopped,
}

impl InstanceState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, Unhealthy)
                | (Ready, Draining)
                | (Unhealthy, Ready)
                | (Unhealthy, Draining)
                | (Draining, Stopped)
        )
    }

    /// States in which the instance has a network address.
    pub fn has_address(self) -> bool {
        matches!(
            self,
            InstanceState::Ready | InstanceState::Draining | InstanceState::Unhealthy
        )
    }

    /// States that hold a slot against the pool's capacity.
    pub fn is_running(self) -> bool {
        self != InstanceState::Stopped
    }
}

/// Outcome of one forwarded request, reported back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// The caller went away. Neutral for health tracking.
    Cancelled,
}

/// A handle to one backend worker process and its bookkeeping.
///
/// Owned by the pool; everything outside the pool sees clones.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    /// Set once the worker reports ready, cleared when it stops.
    pub address: Option<String>,
    pub state: InstanceState,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub concurrent_requests: u32,
    pub consecutive_forward_failures: u32,
    pub consecutive_probe_failures: u32,
    pub last_probe: Option<Instant>,
    pub last_probe_status: Option<ProbeStatus>,
    /// When the instance last entered `Unhealthy`.
    pub unhealthy_since: Option<Instant>,
    /// Teardown was requested while the instance was still starting.
    pub stop_requested: bool,
}

impl Instance {
    pub fn new(id: InstanceId) -> Self {
        let now = Instant::now();
        Self {
            id,
            address: None,
            state: InstanceState::Starting,
            created_at: now,
            last_activity: now,
            concurrent_requests: 0,
            consecutive_forward_failures: 0,
            consecutive_probe_failures: 0,
            last_probe: None,
            last_probe_status: None,
            unhealthy_since: None,
            stop_requested: false,
        }
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns `false` and leaves the instance untouched otherwise.
    pub fn transition(&mut self, next: InstanceState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }

        self.state = next;
        match next {
            InstanceState::Unhealthy => self.unhealthy_since = Some(Instant::now()),
            InstanceState::Ready => self.unhealthy_since = None,
            InstanceState::Stopped => {
                self.address = None;
                self.unhealthy_since = None;
            }
            InstanceState::Starting | InstanceState::Draining => {}
        }
        true
    }

    /// Marks the instance ready at `address`.
    pub fn mark_ready(&mut self, address: String) -> bool {
        if self.state != InstanceState::Starting {
            return false;
        }
        self.address = Some(address);
        self.last_activity = Instant::now();
        self.transition(InstanceState::Ready)
    }

    pub fn is_selectable(&self) -> bool {
        self.state == InstanceState::Ready
    }

    /// Time since the last successful request, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Checks the address invariant: set exactly in addressed states.
    pub fn address_consistent(&self) -> bool {
        self.address.is_some() == self.state.has_address()
    }
}
