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

//! The instance pool.
//!
//! [`InstancePool`] exclusively owns every [`Instance`]. All bookkeeping
//! (the instance map and per-instance counters) sits behind one mutex that
//! is only ever held for counter and state updates, never across an
//! `.await`. Starting, probing, draining and stopping workers all happen
//! outside it, so a slow startup never blocks callers that only need an
//! instance that is already `Ready`.

use futures::future::join_all;
use sandpool_common::{InstanceId, ProbeStatus, Result, SandpoolError};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::hooks::{LifecycleHooks, StopReason};
use crate::instance::{Instance, InstanceState, Outcome};
use crate::runtime::WorkerRuntime;
use crate::selection::{Candidate, SelectionStrategy};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ceiling on instances that are starting, ready, unhealthy or draining.
    pub max_concurrent: usize,
    /// How long a new instance has to pass its readiness probe.
    pub startup_deadline: Duration,
    /// Pause between readiness probes while starting.
    pub readiness_poll_interval: Duration,
    /// Timeout of a single readiness probe.
    pub readiness_probe_timeout: Duration,
    /// Consecutive forwarding failures before an instance is marked unhealthy.
    pub failure_threshold: u32,
    /// How long `destroy` waits for in-flight requests before stopping anyway.
    pub force_kill_timeout: Duration,
    /// How long an instance may stay unhealthy before it is drained and
    /// stopped. A passing probe within this window puts it back in rotation.
    pub unhealthy_grace: Duration,
    /// Start a new instance (capacity permitting) once the least-loaded
    /// ready instance already carries this many in-flight requests.
    pub scale_out_threshold: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            startup_deadline: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_millis(100),
            readiness_probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            force_kill_timeout: Duration::from_secs(10),
            unhealthy_grace: Duration::from_secs(15),
            scale_out_threshold: None,
        }
    }
}

/// How a teardown request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The instance is not in the pool.
    AlreadyStopped,
    /// Another teardown is already draining it.
    InProgress,
    /// The instance is still starting and will be stopped as soon as
    /// startup settles.
    Deferred,
    /// The instance did not meet the teardown condition.
    Skipped,
    /// In-flight requests finished and the worker was stopped.
    Drained,
    /// The force-kill timeout fired with requests still in flight.
    ForceKilled,
}

#[derive(Debug)]
struct StateChange {
    id: InstanceId,
    from: InstanceState,
    to: InstanceState,
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<InstanceId, Instance>,
    next_seq: u64,
    pending_rechecks: HashSet<InstanceId>,
}

impl PoolState {
    fn running_count(&self) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.state.is_running())
            .count()
    }

    /// Ready instances, oldest first.
    fn candidates(&self, exclude: Option<&InstanceId>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .instances
            .values()
            .filter(|instance| instance.is_selectable())
            .filter(|instance| Some(&instance.id) != exclude)
            .map(|instance| Candidate {
                id: instance.id.clone(),
                concurrent_requests: instance.concurrent_requests,
            })
            .collect();
        candidates.sort_by_key(|c| c.id.seq());
        candidates
    }

    /// Takes one request slot on a ready instance and returns its address.
    fn claim(&mut self, id: &InstanceId) -> Option<String> {
        let instance = self.instances.get_mut(id)?;
        if !instance.is_selectable() {
            return None;
        }
        instance.concurrent_requests += 1;
        instance.address.clone()
    }

    fn reserve(&mut self, max_concurrent: usize) -> InstanceId {
        self.next_seq += 1;
        let id = InstanceId::new(self.next_seq);
        self.instances.insert(id.clone(), Instance::new(id.clone()));
        assert!(
            self.running_count() <= max_concurrent,
            "pool holds {} running instances, limit is {}",
            self.running_count(),
            max_concurrent
        );
        id
    }

    fn transition(&mut self, id: &InstanceId, next: InstanceState) -> Option<StateChange> {
        let instance = self.instances.get_mut(id)?;
        let from = instance.state;
        instance.transition(next).then(|| StateChange {
            id: id.clone(),
            from,
            to: next,
        })
    }

    /// Moves the instance to `Stopped` and forgets it.
    fn retire(&mut self, id: &InstanceId) -> Option<StateChange> {
        let change = self.transition(id, InstanceState::Stopped);
        if change.is_some() {
            self.instances.remove(id);
            self.pending_rechecks.remove(id);
        }
        change
    }
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled whenever an in-flight count drops or an instance leaves.
    changed: Notify,
    /// Signalled when forwarding failures ask for an out-of-band probe.
    recheck: Notify,
    runtime: Arc<dyn WorkerRuntime>,
    strategy: Arc<dyn SelectionStrategy>,
    hooks: Arc<dyn LifecycleHooks>,
    config: PoolConfig,
}

/// Owner of all worker instances. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct InstancePool {
    shared: Arc<Shared>,
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("config", &self.shared.config)
            .field("strategy", &self.shared.strategy.name())
            .finish_non_exhaustive()
    }
}

enum Acquired {
    Existing(Lease),
    Create(InstanceId),
}

impl InstancePool {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        strategy: Arc<dyn SelectionStrategy>,
        hooks: Arc<dyn LifecycleHooks>,
        config: PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
                recheck: Notify::new(),
                runtime,
                strategy,
                hooks,
                config,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn WorkerRuntime> {
        &self.shared.runtime
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn LifecycleHooks> {
        &self.shared.hooks
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, change: Option<StateChange>) {
        if let Some(change) = change {
            self.shared
                .hooks
                .on_state_change(&change.id, change.from, change.to);
        }
    }

    /// Returns a lease on a `Ready` instance, starting a new one if none is
    /// ready and the pool has room.
    ///
    /// # Errors
    /// - `NoCapacity` when nothing is ready and the pool is full
    /// - `StartupFailed` when a new instance does not become ready in time
    pub async fn acquire(&self) -> Result<Lease> {
        match self.try_acquire()? {
            Acquired::Existing(lease) => Ok(lease),
            Acquired::Create(id) => self.start_instance(id).await,
        }
    }

    /// Leases a `Ready` instance other than `exclude` without starting one.
    pub fn acquire_other(&self, exclude: &InstanceId) -> Option<Lease> {
        let mut state = self.lock();
        let candidates = state.candidates(Some(exclude));
        if candidates.is_empty() {
            return None;
        }
        let id = self.shared.strategy.select(&candidates)?;
        let address = state.claim(&id)?;
        Some(Lease::new(self.clone(), id, address))
    }

    fn try_acquire(&self) -> Result<Acquired> {
        let max_concurrent = self.shared.config.max_concurrent;
        let mut state = self.lock();

        let candidates = state.candidates(None);
        let has_room = state.running_count() < max_concurrent;
        let saturated = match self.shared.config.scale_out_threshold {
            Some(threshold) => candidates
                .iter()
                .map(|c| c.concurrent_requests)
                .min()
                .is_some_and(|load| load >= threshold),
            None => false,
        };

        if !candidates.is_empty() && !(saturated && has_room) {
            if let Some(id) = self.shared.strategy.select(&candidates) {
                if let Some(address) = state.claim(&id) {
                    return Ok(Acquired::Existing(Lease::new(self.clone(), id, address)));
                }
            }
        }

        if !has_room {
            return Err(SandpoolError::NoCapacity { max_concurrent });
        }

        let id = state.reserve(max_concurrent);
        debug!(instance = %id, "Starting new instance");
        Ok(Acquired::Create(id))
    }

    /// Runs startup on its own task so it completes even if the caller that
    /// triggered it goes away. A lease nobody collects is dropped, which
    /// releases it as cancelled.
    async fn start_instance(&self, id: InstanceId) -> Result<Lease> {
        let pool = self.clone();
        let task_id = id.clone();
        match tokio::spawn(async move { pool.bring_up(task_id).await }).await {
            Ok(result) => result,
            Err(e) => {
                let change = self.lock().retire(&id);
                self.fire(change);
                self.shared.changed.notify_waiters();
                Err(SandpoolError::StartupFailed {
                    instance_id: id,
                    reason: format!("startup task aborted: {}", e),
                })
            }
        }
    }

    async fn bring_up(self, id: InstanceId) -> Result<Lease> {
        let deadline = self.shared.config.startup_deadline;
        let attempt = async {
            let address = self
                .shared
                .runtime
                .start(&id)
                .await
                .map_err(|e| e.to_string())?;
            self.wait_ready(&address).await?;
            Ok::<_, String>(address)
        };

        let address = match tokio::time::timeout(deadline, attempt).await {
            Ok(Ok(address)) => address,
            Ok(Err(reason)) => return Err(self.fail_startup(id, reason).await),
            Err(_) => {
                let reason = format!("not ready within {}ms", deadline.as_millis());
                return Err(self.fail_startup(id, reason).await);
            }
        };

        let (change, address) = {
            let mut state = self.lock();
            let stop_requested = state
                .instances
                .get(&id)
                .map_or(true, |instance| instance.stop_requested);
            if stop_requested {
                (None, None)
            } else {
                let change = state.instances.get_mut(&id).and_then(|instance| {
                    instance.mark_ready(address).then(|| StateChange {
                        id: id.clone(),
                        from: InstanceState::Starting,
                        to: InstanceState::Ready,
                    })
                });
                (change, state.claim(&id))
            }
        };

        match address {
            Some(address) => {
                self.fire(change);
                self.shared.hooks.on_start(&id);
                Ok(Lease::new(self.clone(), id, address))
            }
            None => {
                self.stop_unstarted(&id, StopReason::Requested).await;
                Err(SandpoolError::StartupFailed {
                    instance_id: id,
                    reason: "stopped during startup".to_string(),
                })
            }
        }
    }

    /// Polls the readiness probe until it passes. Bounded by the caller.
    ///
    /// Gives up at once if the worker exits, returning the reason.
    async fn wait_ready(&self, address: &str) -> std::result::Result<(), String> {
        let config = &self.shared.config;
        loop {
            let probe = self.shared.runtime.health_check(address);
            match tokio::time::timeout(config.readiness_probe_timeout, probe).await {
                Ok(ProbeStatus::Healthy) => return Ok(()),
                Ok(ProbeStatus::Exited(reason)) => {
                    return Err(format!("worker exited before becoming ready: {}", reason));
                }
                _ => {}
            }
            tokio::time::sleep(config.readiness_poll_interval).await;
        }
    }

    async fn fail_startup(&self, id: InstanceId, reason: String) -> SandpoolError {
        let error = SandpoolError::StartupFailed {
            instance_id: id.clone(),
            reason,
        };
        self.shared.hooks.on_error(Some(&id), &error);
        self.stop_unstarted(&id, StopReason::StartupFailed).await;
        error
    }

    /// Stops a worker that never reached `Ready` and drops it from the pool.
    async fn stop_unstarted(&self, id: &InstanceId, reason: StopReason) {
        if let Err(e) = self.shared.runtime.stop(id).await {
            self.shared.hooks.on_error(Some(id), &e);
        }
        let change = self.lock().retire(id);
        self.shared.changed.notify_waiters();
        if change.is_some() {
            self.fire(change);
            self.shared.hooks.on_stop(id, reason);
        }
    }

    /// Returns a request slot and records how the request went.
    ///
    /// Unknown ids are ignored: the instance may have been force-killed
    /// while the request was in flight.
    pub fn release(&self, id: &InstanceId, outcome: Outcome) {
        let threshold = self.shared.config.failure_threshold;
        let mut change = None;
        let mut recheck = false;
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(instance) = state.instances.get_mut(id) else {
                debug!(instance = %id, "Release for instance no longer in the pool");
                return;
            };

            instance.concurrent_requests = instance.concurrent_requests.saturating_sub(1);
            match outcome {
                Outcome::Success => {
                    instance.last_activity = Instant::now();
                    instance.consecutive_forward_failures = 0;
                }
                Outcome::Failure => {
                    instance.consecutive_forward_failures += 1;
                    if instance.consecutive_forward_failures >= threshold {
                        if instance.state == InstanceState::Ready
                            && instance.transition(InstanceState::Unhealthy)
                        {
                            change = Some(StateChange {
                                id: id.clone(),
                                from: InstanceState::Ready,
                                to: InstanceState::Unhealthy,
                            });
                        }
                        recheck = state.pending_rechecks.insert(id.clone());
                    }
                }
                Outcome::Cancelled => {}
            }
        }

        self.shared.changed.notify_waiters();
        let marked = change.is_some();
        self.fire(change);
        if marked {
            warn!(
                instance = %id,
                failures = threshold,
                "Instance marked unhealthy after consecutive forwarding failures"
            );
            self.schedule_unhealthy_teardown(id);
        }
        if recheck {
            self.shared.recheck.notify_one();
        }
    }

    /// Excludes a `Ready` instance from selection and schedules its teardown.
    ///
    /// Unless it recovers within `unhealthy_grace`, the instance is then
    /// drained (bounded by `force_kill_timeout`) and stopped.
    pub fn mark_unhealthy(&self, id: &InstanceId) -> bool {
        let change = {
            let mut state = self.lock();
            let ready = state
                .instances
                .get(id)
                .is_some_and(|instance| instance.state == InstanceState::Ready);
            if ready {
                state.transition(id, InstanceState::Unhealthy)
            } else {
                None
            }
        };
        let marked = change.is_some();
        self.fire(change);
        if marked {
            self.schedule_unhealthy_teardown(id);
        }
        marked
    }

    fn schedule_unhealthy_teardown(&self, id: &InstanceId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instance = %id, "No tokio runtime to tear down unhealthy instance");
            return;
        };
        let pool = self.clone();
        let id = id.clone();
        let grace = self.shared.config.unhealthy_grace;
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            // Skipped if it recovered, or went unhealthy again later
            match pool.teardown_unhealthy(&id, grace, Instant::now()).await {
                Ok(Teardown::Drained) | Ok(Teardown::ForceKilled) => {
                    info!(instance = %id, "Stopped instance that stayed unhealthy");
                }
                Ok(_) => {}
                Err(e) => warn!(instance = %id, "Failed to stop unhealthy instance: {}", e),
            }
        });
    }

    /// Returns an `Unhealthy` instance to `Ready`, resetting its failure counts.
    pub fn recover(&self, id: &InstanceId) -> bool {
        let change = {
            let mut state = self.lock();
            let unhealthy = state
                .instances
                .get(id)
                .is_some_and(|instance| instance.state == InstanceState::Unhealthy);
            if !unhealthy {
                return false;
            }
            let change = state.transition(id, InstanceState::Ready);
            if let Some(instance) = state.instances.get_mut(id) {
                instance.consecutive_forward_failures = 0;
                instance.consecutive_probe_failures = 0;
            }
            change
        };
        let recovered = change.is_some();
        if recovered {
            info!(instance = %id, "Instance recovered");
        }
        self.fire(change);
        recovered
    }

    /// Records a probe result and returns the consecutive probe failure count.
    pub fn record_probe(&self, id: &InstanceId, status: &ProbeStatus) -> Option<u32> {
        let mut state = self.lock();
        let instance = state.instances.get_mut(id)?;
        instance.last_probe = Some(Instant::now());
        instance.last_probe_status = Some(status.clone());
        if status.is_healthy() {
            instance.consecutive_probe_failures = 0;
        } else {
            instance.consecutive_probe_failures += 1;
        }
        Some(instance.consecutive_probe_failures)
    }

    /// Drains the set of instances waiting for an out-of-band probe.
    pub fn take_rechecks(&self) -> Vec<InstanceId> {
        let mut state = self.lock();
        let mut ids: Vec<InstanceId> = state.pending_rechecks.drain().collect();
        ids.sort();
        ids
    }

    pub(crate) fn recheck_signal(&self) -> &Notify {
        &self.shared.recheck
    }

    /// Tears an instance down: drain, stop, forget.
    ///
    /// Idempotent. Waits up to `force_kill_timeout` for in-flight requests
    /// before stopping the worker anyway. An `Err` means the runtime failed
    /// to stop the worker; the instance has left the pool regardless.
    pub async fn destroy(&self, id: &InstanceId) -> Result<Teardown> {
        self.destroy_if(id, StopReason::Requested, |_| true).await
    }

    /// Destroys `id` if it is `Ready`, idle and idle for longer than `threshold`.
    ///
    /// The check and the move to `Draining` happen atomically, so a request
    /// that lands in between keeps the instance alive.
    pub async fn reap_idle(
        &self,
        id: &InstanceId,
        threshold: Duration,
        now: Instant,
    ) -> Result<Teardown> {
        self.destroy_if(id, StopReason::Idle, |instance| {
            instance.state == InstanceState::Ready
                && instance.concurrent_requests == 0
                && instance.idle_for(now) > threshold
        })
        .await
    }

    /// Destroys `id` if it has been `Unhealthy` for at least `grace`.
    pub async fn teardown_unhealthy(
        &self,
        id: &InstanceId,
        grace: Duration,
        now: Instant,
    ) -> Result<Teardown> {
        self.destroy_if(id, StopReason::Unhealthy, |instance| {
            instance.state == InstanceState::Unhealthy
                && instance
                    .unhealthy_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace)
        })
        .await
    }

    async fn destroy_if<F>(&self, id: &InstanceId, reason: StopReason, predicate: F) -> Result<Teardown>
    where
        F: FnOnce(&Instance) -> bool,
    {
        let change = {
            let mut state = self.lock();
            let Some(instance) = state.instances.get_mut(id) else {
                return Ok(Teardown::AlreadyStopped);
            };
            if !predicate(instance) {
                return Ok(Teardown::Skipped);
            }
            match instance.state {
                InstanceState::Stopped => return Ok(Teardown::AlreadyStopped),
                InstanceState::Draining => return Ok(Teardown::InProgress),
                InstanceState::Starting => {
                    instance.stop_requested = true;
                    return Ok(Teardown::Deferred);
                }
                InstanceState::Ready | InstanceState::Unhealthy => {}
            }
            state.transition(id, InstanceState::Draining)
        };
        self.fire(change);

        let force_kill_timeout = self.shared.config.force_kill_timeout;
        let teardown = if self.wait_drained(id, force_kill_timeout).await {
            Teardown::Drained
        } else {
            warn!(
                instance = %id,
                in_flight = self.in_flight(id),
                "Force-killing instance after {}ms",
                force_kill_timeout.as_millis()
            );
            Teardown::ForceKilled
        };

        let stopped = self.shared.runtime.stop(id).await;
        if let Err(e) = &stopped {
            self.shared.hooks.on_error(Some(id), e);
        }

        let change = self.lock().retire(id);
        self.shared.changed.notify_waiters();
        if change.is_some() {
            self.fire(change);
            self.shared.hooks.on_stop(id, reason);
        }

        stopped.map(|()| teardown)
    }

    /// Waits until `id` has no in-flight requests, up to `limit`.
    async fn wait_drained(&self, id: &InstanceId, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.in_flight(id) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight(id) == 0;
            }
        }
    }

    fn in_flight(&self, id: &InstanceId) -> u32 {
        self.lock()
            .instances
            .get(id)
            .map_or(0, |instance| instance.concurrent_requests)
    }

    /// Starts up to `count` instances ahead of traffic, bounded by capacity.
    ///
    /// Returns how many became ready. Fails only if none did.
    pub async fn warm_up(&self, count: usize) -> Result<usize> {
        let ids: Vec<InstanceId> = {
            let mut state = self.lock();
            let max_concurrent = self.shared.config.max_concurrent;
            let room = max_concurrent.saturating_sub(state.running_count());
            (0..count.min(room))
                .map(|_| state.reserve(max_concurrent))
                .collect()
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let results = join_all(ids.into_iter().map(|id| self.start_instance(id))).await;
        let mut started = 0;
        let mut first_error = None;
        for result in results {
            match result {
                // Dropping the lease hands the slot straight back
                Ok(_lease) => started += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if started == 0 => Err(e),
            _ => {
                info!(started, "Pool warmed up");
                Ok(started)
            }
        }
    }

    /// Destroys every instance. Instances still starting are stopped once
    /// their startup settles.
    pub async fn shutdown(&self) {
        let ids: Vec<InstanceId> = self.lock().instances.keys().cloned().collect();
        let teardowns = ids
            .iter()
            .map(|id| self.destroy_if(id, StopReason::Shutdown, |_| true));
        for (id, result) in ids.iter().zip(join_all(teardowns).await) {
            if let Err(e) = result {
                warn!(instance = %id, "Failed to stop instance during shutdown: {}", e);
            }
        }
    }

    /// Copies of every instance, oldest first.
    pub fn snapshot(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self.lock().instances.values().cloned().collect();
        instances.sort_by_key(|instance| instance.id.seq());
        instances
    }

    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.lock().instances.get(id).cloned()
    }

    /// Instances counted against `max_concurrent`.
    pub fn active_count(&self) -> usize {
        self.lock().running_count()
    }
}

/// One claimed request slot on a `Ready` instance.
///
/// Hand it back with [`Lease::release`]. A lease that is dropped without
/// being released counts as [`Outcome::Cancelled`].
pub struct Lease {
    pool: InstancePool,
    id: InstanceId,
    address: String,
    released: bool,
}

impl Lease {
    fn new(pool: InstancePool, id: InstanceId, address: String) -> Self {
        Self {
            pool,
            id,
            address,
            released: false,
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        self.pool.release(&self.id, outcome);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(&self.id, Outcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.startup_deadline, Duration::from_secs(30));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.force_kill_timeout, Duration::from_secs(10));
        assert_eq!(config.unhealthy_grace, Duration::from_secs(15));
        assert!(config.scale_out_threshold.is_none());
    }

    #[test]
    fn test_candidates_sorted_oldest_first() {
        let mut state = PoolState::default();
        for _ in 0..3 {
            state.reserve(3);
        }
        for (seq, load) in [(3, 0), (1, 2), (2, 0)] {
            let instance = state.instances.get_mut(&InstanceId::new(seq)).unwrap();
            instance.mark_ready(format!("127.0.0.1:{}", 9000 + seq));
            instance.concurrent_requests = load;
        }

        let ids: Vec<u64> = state.candidates(None).iter().map(|c| c.id.seq()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let ids: Vec<u64> = state
            .candidates(Some(&InstanceId::new(2)))
            .iter()
            .map(|c| c.id.seq())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_starting_instances_are_not_candidates() {
        let mut state = PoolState::default();
        let id = state.reserve(1);
        assert!(state.candidates(None).is_empty());
        assert!(state.claim(&id).is_none());
        assert_eq!(state.running_count(), 1);
    }

    #[test]
    #[should_panic(expected = "limit is 1")]
    fn test_reserve_past_capacity_panics() {
        let mut state = PoolState::default();
        state.reserve(1);
        state.reserve(1);
    }

    #[test]
    fn test_retire_removes_instance() {
        let mut state = PoolState::default();
        let id = state.reserve(2);
        state.pending_rechecks.insert(id.clone());

        let change = state.retire(&id).unwrap();
        assert_eq!(change.from, InstanceState::Starting);
        assert_eq!(change.to, InstanceState::Stopped);
        assert!(state.instances.is_empty());
        assert!(state.pending_rechecks.is_empty());
        // Second retire is a no-op
        assert!(state.retire(&id).is_none());
    }
}
