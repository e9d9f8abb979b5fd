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

//! HTTP routes for the dispatcher.
//!
//! Every request is proxied through the [`Dispatcher`] except a few
//! reserved admin routes under [`ADMIN_PREFIX`]:
//!
//! - `GET /__sandpool/health` - liveness and pool occupancy
//! - `GET /__sandpool/metrics` - request metrics
//! - `GET /__sandpool/instances` - per-instance state and load
//!
//! Admin output never includes instance addresses.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http_body_util::LengthLimitError;
use sandpool_common::InstanceId;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::instance::{Instance, InstanceState};

/// Path prefix reserved for admin routes.
pub const ADMIN_PREFIX: &str = "/__sandpool";

/// Largest request body buffered for forwarding by default.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    max_body_bytes: usize,
}

/// What `GET /__sandpool/instances` reports per instance.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub state: InstanceState,
    pub concurrent_requests: u32,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub consecutive_forward_failures: u32,
    pub consecutive_probe_failures: u32,
}

impl InstanceView {
    fn new(instance: &Instance, now: Instant) -> Self {
        Self {
            id: instance.id.clone(),
            state: instance.state,
            concurrent_requests: instance.concurrent_requests,
            age_ms: now.saturating_duration_since(instance.created_at).as_millis() as u64,
            idle_ms: instance.idle_for(now).as_millis() as u64,
            consecutive_forward_failures: instance.consecutive_forward_failures,
            consecutive_probe_failures: instance.consecutive_probe_failures,
        }
    }
}

/// Builds the axum router: admin routes plus a proxy fallback.
pub fn router(dispatcher: Arc<Dispatcher>, max_body_bytes: usize) -> Router {
    let state = AppState {
        dispatcher,
        max_body_bytes,
    };

    Router::new()
        .route(&format!("{}/health", ADMIN_PREFIX), get(health))
        .route(&format!("{}/metrics", ADMIN_PREFIX), get(metrics))
        .route(&format!("{}/instances", ADMIN_PREFIX), get(instances))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Buffers the request body (it may have to be replayed) and dispatches.
async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            let too_large = std::error::Error::source(&e)
                .is_some_and(|source| source.is::<LengthLimitError>());
            let (status, error) = if too_large {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large")
            } else {
                (StatusCode::BAD_REQUEST, "bad_request")
            };
            let message = if too_large {
                format!("request body exceeds {} bytes", state.max_body_bytes)
            } else {
                "failed to read request body".to_string()
            };
            return (status, Json(json!({ "error": error, "message": message }))).into_response();
        }
    };

    state
        .dispatcher
        .handle(axum::http::Request::from_parts(parts, body))
        .await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.dispatcher.pool();
    Json(json!({
        "status": "ok",
        "active_instances": pool.active_count(),
        "max_concurrent": pool.config().max_concurrent,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let collector = state.dispatcher.metrics();
    let mut body = match serde_json::to_value(collector.server_info()) {
        Ok(value) => value,
        Err(e) => return internal_error(e),
    };
    let snapshot = match serde_json::to_value(collector.snapshot()) {
        Ok(value) => value,
        Err(e) => return internal_error(e),
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("metrics".to_string(), snapshot);
    }
    Json(body).into_response()
}

async fn instances(State(state): State<AppState>) -> impl IntoResponse {
    let now = Instant::now();
    let views: Vec<InstanceView> = state
        .dispatcher
        .pool()
        .snapshot()
        .iter()
        .map(|instance| InstanceView::new(instance, now))
        .collect();
    Json(json!({ "instances": views }))
}

fn internal_error(error: serde_json::Error) -> Response {
    tracing::error!("Failed to serialize admin response: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal", "message": "internal dispatcher error" })),
    )
        .into_response()
}
