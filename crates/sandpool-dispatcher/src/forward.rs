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

//! HTTP transport to worker instances.

use axum::body::Body;
use axum::http::{Method, Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sandpool_common::{
    strip_hop_by_hop, ForwardRequest, ForwardResponse, ProbeStatus, Result, SandpoolError,
};

/// Forwards requests to instances over plain HTTP/1.
///
/// One pooled client is shared by every request, so connections to a
/// busy instance are reused.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    probe_path: String,
}

impl HttpForwarder {
    /// `probe_path` is requested with `GET` to check an instance's health.
    pub fn new(probe_path: impl Into<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            probe_path: probe_path.into(),
        }
    }

    fn target(address: &str, path_and_query: &str) -> Result<Uri> {
        format!("http://{}{}", address, path_and_query)
            .parse()
            .map_err(|e| SandpoolError::Transport(format!("Invalid target URI: {}", e)))
    }

    /// Sends `request` to the instance at `address`.
    ///
    /// Method, path, query, headers and body are preserved; hop-by-hop
    /// headers are dropped in both directions. The response body streams.
    pub async fn forward(&self, address: &str, request: ForwardRequest) -> Result<ForwardResponse> {
        let (mut parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        parts.uri = Self::target(address, path_and_query)?;
        strip_hop_by_hop(&mut parts.headers);

        let response = self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SandpoolError::Connection(format!("HTTP connect failed: {}", e))
                } else {
                    SandpoolError::Transport(format!("HTTP request failed: {}", e))
                }
            })?;

        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(incoming)))
    }

    /// `GET`s the probe path; any 2xx is healthy.
    pub async fn probe(&self, address: &str) -> ProbeStatus {
        let uri = match Self::target(address, &self.probe_path) {
            Ok(uri) => uri,
            Err(e) => return ProbeStatus::Unhealthy(e.to_string()),
        };
        let request = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
        {
            Ok(request) => request,
            Err(e) => return ProbeStatus::Unhealthy(e.to_string()),
        };

        match self.client.request(request).await {
            Ok(response) if response.status().is_success() => ProbeStatus::Healthy,
            Ok(response) => ProbeStatus::Unhealthy(format!("status {}", response.status())),
            Err(e) => ProbeStatus::Unhealthy(e.to_string()),
        }
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new("/status")
    }
}
