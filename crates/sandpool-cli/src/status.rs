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


//! The `status` subcommand: queries a dispatcher's admin routes.

use anyhow::{anyhow, Context, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use std::time::Duration;

/// Admin routes are mounted under this prefix by the dispatcher.
const ADMIN_PREFIX: &str = "/__sandpool";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Validates that a URL string starts with http:// or https://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Joins a server address and an admin route.
pub fn admin_url(server_address: &str, route: &str) -> String {
    format!(
        "{}{}/{}",
        server_address.trim_end_matches('/'),
        ADMIN_PREFIX,
        route
    )
}

/// GETs `url` and parses the body as JSON.
pub async fn fetch_json(url: &str) -> Result<Value> {
    let uri: Uri = url.parse().with_context(|| format!("Invalid URL {}", url))?;
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let request = Request::get(uri).body(Empty::new())?;

    let response = tokio::time::timeout(REQUEST_TIMEOUT, client.request(request))
        .await
        .map_err(|_| anyhow!("Timed out waiting for {}", url))?
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .with_context(|| format!("Failed to read response from {}", url))?
        .to_bytes();
    if !status.is_success() {
        return Err(anyhow!(
            "{} returned {}: {}",
            url,
            status,
            String::from_utf8_lossy(&body)
        ));
    }
    serde_json::from_slice(&body).with_context(|| format!("Invalid JSON from {}", url))
}

/// Merges the instance listing with the request metrics for each instance.
///
/// Instances the metrics do not know about yet get zero counts.
pub fn combine(instances: Value, metrics: &Value) -> Value {
    let per_instance = &metrics["metrics"]["instances"];
    let listing = instances["instances"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|mut instance| {
            let key = format!("instance-{}", instance["id"]);
            let served = &per_instance[key.as_str()];
            if let Some(obj) = instance.as_object_mut() {
                obj.insert(
                    "request_count".to_string(),
                    served["request_count"].as_u64().unwrap_or(0).into(),
                );
                obj.insert(
                    "failure_count".to_string(),
                    served["failure_count"].as_u64().unwrap_or(0).into(),
                );
            }
            instance
        })
        .collect::<Vec<_>>();

    json!({
        "uptime_ms": metrics["uptime_ms"],
        "total_requests": metrics["metrics"]["total_requests"],
        "instances": listing,
    })
}

/// Executes the `status` subcommand, printing raw JSON to stdout.
pub async fn run_status(server_address: &str) -> Result<()> {
    validate_http_url(server_address, "server address")?;

    let instances = fetch_json(&admin_url(server_address, "instances")).await?;
    let metrics = fetch_json(&admin_url(server_address, "metrics")).await?;

    println!("{}", serde_json::to_string(&combine(instances, &metrics))?);
    Ok(())
}
