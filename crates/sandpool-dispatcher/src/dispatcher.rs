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

use axum::body::Body;
use axum::http::{Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Bytes;
use sandpool_common::{
    error_response, is_idempotent, ForwardRequest, ForwardResponse, Result, SandpoolError,
};
use sandpool_metrics::{DispatcherMetricsCollector, RequestOutcome};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::instance::Outcome;
use crate::pool::{InstancePool, Lease};

/// Dispatcher configuration: forwarding timeout, failover and the optional
/// wait for capacity.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time allowed for an instance to send back response headers.
    pub forward_timeout: Duration,
    /// Extra attempts against other instances after a failed forward.
    ///
    /// Only requests that are safe to replay are retried: idempotent
    /// methods, or requests that never reached the instance.
    pub max_retries: usize,
    /// How long to keep retrying `acquire` on `NoCapacity`. Zero fails fast.
    pub acquire_wait: Duration,
    /// First pause between capacity retries.
    pub initial_backoff_ms: u64,
    /// Pauses grow up to this value.
    pub max_backoff_ms: u64,
    /// Each pause is the previous one times this.
    pub backoff_multiplier: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(30),
            max_retries: 1,
            acquire_wait: Duration::ZERO,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl DispatcherConfig {
    fn next_backoff(&self, backoff_ms: u64) -> u64 {
        std::cmp::min(
            (backoff_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// The request entry point.
///
/// Leases an instance from the pool, forwards the request to it and relays
/// the response. The lease rides along with the response body and is only
/// released once the body has been fully sent, so an instance counts as busy
/// for as long as it is streaming.
///
/// Dropping the future returned by [`Dispatcher::handle`] aborts the forward
/// and releases the instance as cancelled, which does not count against its
/// health.
pub struct Dispatcher {
    pool: InstancePool,
    metrics: Arc<DispatcherMetricsCollector>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        pool: InstancePool,
        metrics: Arc<DispatcherMetricsCollector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            metrics,
            config,
        }
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetricsCollector> {
        &self.metrics
    }

    /// Handles one request. Never fails: errors become JSON error responses
    /// that name the failure kind and instance but no addresses.
    pub async fn handle(&self, request: ForwardRequest) -> ForwardResponse {
        let start_time = Instant::now();
        match self.dispatch(request).await {
            Ok(response) => {
                let outcome = if response.status().is_server_error() {
                    RequestOutcome::Failed
                } else {
                    RequestOutcome::Relayed
                };
                self.metrics.record_request(start_time, outcome);
                response
            }
            Err(error) => {
                if let SandpoolError::NoCapacity { max_concurrent } = &error {
                    debug!(max_concurrent, "Rejected request: no capacity");
                    self.metrics.record_request(start_time, RequestOutcome::Rejected);
                } else {
                    warn!(kind = error.kind().as_str(), "Request failed: {}", error);
                    self.metrics.record_request(start_time, RequestOutcome::Failed);
                }
                error_response(&error)
            }
        }
    }

    /// Forwards `request`, failing over to another ready instance when that
    /// is safe.
    ///
    /// # Errors
    /// - `NoCapacity` / `StartupFailed` from the pool
    /// - `ForwardFailure` when every allowed attempt failed
    /// - `ForwardTimeout` when an instance did not answer within `forward_timeout`
    pub async fn dispatch(&self, request: ForwardRequest) -> Result<ForwardResponse> {
        let replayable = is_idempotent(request.method());
        let mut retries_left = self.config.max_retries;
        let mut lease = self.acquire().await?;

        loop {
            let attempt = if retries_left > 0 {
                replay(&request)
            } else {
                // Last attempt: hand over the original
                return match self.forward(&lease, request).await {
                    Ok(response) => Ok(self.relay(lease, response)),
                    Err(error) => {
                        self.fail(lease, &error);
                        Err(error)
                    }
                };
            };

            match self.forward(&lease, attempt).await {
                Ok(response) => return Ok(self.relay(lease, response)),
                Err(error) => {
                    let failed = lease.id().clone();
                    self.fail(lease, &error);

                    let safe = replayable || !request_sent(&error);
                    if !safe {
                        return Err(error);
                    }
                    let Some(next) = self.pool.acquire_other(&failed) else {
                        debug!(instance = %failed, "No other ready instance to retry on");
                        return Err(error);
                    };
                    debug!(from = %failed, to = %next.id(), "Retrying request on another instance");
                    self.metrics.record_retry();
                    retries_left -= 1;
                    lease = next;
                }
            }
        }
    }

    /// `pool.acquire()`, retried with backoff on `NoCapacity` for up to
    /// `acquire_wait`.
    async fn acquire(&self) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_wait;
        let mut backoff_ms = self.config.initial_backoff_ms;

        loop {
            match self.pool.acquire().await {
                Err(SandpoolError::NoCapacity { .. }) if tokio::time::Instant::now() < deadline => {
                    let remaining = deadline - tokio::time::Instant::now();
                    let pause = Duration::from_millis(backoff_ms).min(remaining);
                    debug!("No capacity, retrying acquire in {}ms", pause.as_millis());
                    tokio::time::sleep(pause).await;
                    backoff_ms = self.config.next_backoff(backoff_ms);
                }
                result => return result,
            }
        }
    }

    async fn forward(&self, lease: &Lease, request: ForwardRequest) -> Result<ForwardResponse> {
        let instance_id = lease.id().clone();
        self.metrics.record_instance_request(&instance_id.to_string());

        let timeout = self.config.forward_timeout;
        let forward = self.pool.runtime().forward(lease.address(), request);
        match tokio::time::timeout(timeout, forward).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(SandpoolError::Connection(reason))) => Err(SandpoolError::ForwardFailure {
                instance_id,
                reason,
                request_sent: false,
            }),
            Ok(Err(e)) => Err(SandpoolError::ForwardFailure {
                instance_id,
                reason: e.to_string(),
                request_sent: true,
            }),
            Err(_) => Err(SandpoolError::ForwardTimeout {
                instance_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn fail(&self, lease: Lease, error: &SandpoolError) {
        self.metrics.record_instance_failure(&lease.id().to_string());
        self.pool.hooks().on_error(Some(lease.id()), error);
        lease.release(Outcome::Failure);
    }

    /// Attaches the lease to the response body.
    fn relay(&self, lease: Lease, response: ForwardResponse) -> ForwardResponse {
        let outcome = if response.status().is_server_error() {
            self.metrics.record_instance_failure(&lease.id().to_string());
            Outcome::Failure
        } else {
            Outcome::Success
        };

        let (parts, body) = response.into_parts();
        if body.is_end_stream() {
            lease.release(outcome);
            return Response::from_parts(parts, body);
        }
        Response::from_parts(parts, Body::new(LeasedBody::new(body, lease, outcome)))
    }
}

/// Whether a failed forward may have reached the instance.
fn request_sent(error: &SandpoolError) -> bool {
    match error {
        SandpoolError::ForwardFailure { request_sent, .. } => *request_sent,
        _ => true,
    }
}

/// Copies a request so it can be sent again. The body is reference-counted.
fn replay(request: &ForwardRequest) -> ForwardRequest {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// A response body that holds its instance lease until it is done.
///
/// Released as `outcome` once the last frame is out, as a failure if the
/// instance breaks off mid-stream, and as cancelled if the caller hangs up.
struct LeasedBody {
    inner: Body,
    lease: Option<Lease>,
    outcome: Outcome,
}

impl LeasedBody {
    fn new(inner: Body, lease: Lease, outcome: Outcome) -> Self {
        Self {
            inner,
            lease: Some(lease),
            outcome,
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(lease) = self.lease.take() {
            lease.release(outcome);
        }
    }
}

impl HttpBody for LeasedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finish(this.outcome),
            Poll::Ready(Some(Err(_))) => this.finish(Outcome::Failure),
            // The server may stop polling as soon as the body says it is done
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.finish(this.outcome),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
