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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server information reported by the admin endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub uptime_ms: u64,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            name: "sandpool".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
        }
    }
}

/// Request distribution for a single worker instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceMetrics {
    pub instance_id: String,
    pub request_count: u64,
    pub failure_count: u64,
    pub last_request_ms: u64,
}

impl InstanceMetrics {
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            request_count: 0,
            failure_count: 0,
            last_request_ms: 0,
        }
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Requests turned away because the pool had no capacity.
    pub rejected_requests: u64,
    /// Forwards re-attempted against a second instance.
    pub retries: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub uptime_ms: u64,
    pub instances: HashMap<String, InstanceMetrics>,
}

impl MetricsSnapshot {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            retries: 0,
            avg_latency_us: 0,
            max_latency_us: 0,
            uptime_ms,
            instances: HashMap::new(),
        }
    }
}
