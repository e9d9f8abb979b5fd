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
use axum::http::{header, HeaderValue, Response, StatusCode};
use serde_json::json;

use super::error::{ErrorKind, SandpoolError};

/// A response relayed from an instance. The body streams.
pub type ForwardResponse = Response<Body>;

/// Seconds a caller is told to wait after a `NoCapacity` rejection.
pub const RETRY_AFTER_SECS: u64 = 1;

impl SandpoolError {
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NoCapacity | ErrorKind::StartupFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ForwardFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::ForwardTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Renders an error as the JSON response the original caller receives.
pub fn error_response(error: &SandpoolError) -> ForwardResponse {
    let body = json!({
        "error": error.kind(),
        "message": error.public_message(),
        "instance_id": error.instance_id(),
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = error.status_code();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if matches!(error, SandpoolError::NoCapacity { .. }) {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    }
    response
}
