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

//! Instance selection strategies.
//!
//! The pool hands a strategy the `Ready` instances, oldest first, and the
//! strategy picks one. Strategies never see instances in any other state.

use sandpool_common::InstanceId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A `Ready` instance as offered to a [`SelectionStrategy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: InstanceId,
    pub concurrent_requests: u32,
}

/// Picks one instance out of the ready set.
///
/// `candidates` is never empty and is sorted by creation order, oldest first.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, candidates: &[Candidate]) -> Option<InstanceId>;

    fn name(&self) -> &'static str;
}

/// Fewest in-flight requests wins; ties go to the oldest instance so warm
/// instances are kept busy and younger ones can idle out.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn select(&self, candidates: &[Candidate]) -> Option<InstanceId> {
        // min_by_key returns the first minimum, i.e. the oldest
        candidates
            .iter()
            .min_by_key(|c| c.concurrent_requests)
            .map(|c| c.id.clone())
    }

    fn name(&self) -> &'static str {
        "least-loaded"
    }
}

/// Cycles through the ready instances regardless of load.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, candidates: &[Candidate]) -> Option<InstanceId> {
        if candidates.is_empty() {
            return None;
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(candidates[turn % candidates.len()].id.clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Looks up a strategy by its CLI name.
pub fn strategy_by_name(name: &str) -> Option<std::sync::Arc<dyn SelectionStrategy>> {
    match name {
        "least-loaded" => Some(std::sync::Arc::new(LeastLoaded)),
        "round-robin" => Some(std::sync::Arc::new(RoundRobin::new())),
        _ => None,
    }
}
