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

use serde::Serialize;
use thiserror::Error;

use crate::protocol::InstanceId;

/// Stable, machine-readable classification of a [`SandpoolError`].
///
/// This is what gets reported to callers and metrics; the error's `Display`
/// text is for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoCapacity,
    StartupFailed,
    ForwardFailure,
    ForwardTimeout,
    ProbeTimeout,
    InstanceNotFound,
    InvalidConfig,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoCapacity => "no_capacity",
            ErrorKind::StartupFailed => "startup_failed",
            ErrorKind::ForwardFailure => "forward_failure",
            ErrorKind::ForwardTimeout => "forward_timeout",
            ErrorKind::ProbeTimeout => "probe_timeout",
            ErrorKind::InstanceNotFound => "instance_not_found",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum SandpoolError {
    #[error("No capacity: {max_concurrent} instance(s) already running and none ready")]
    NoCapacity { max_concurrent: usize },

    #[error("Instance {instance_id} failed to start: {reason}")]
    StartupFailed {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("Forwarding to instance {instance_id} failed: {reason}")]
    ForwardFailure {
        instance_id: InstanceId,
        reason: String,
        /// Whether the request may have reached the instance before failing.
        request_sent: bool,
    },

    #[error("Probe of instance {instance_id} timed out after {timeout_ms}ms")]
    ProbeTimeout {
        instance_id: InstanceId,
        timeout_ms: u64,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Instance {instance_id} did not answer within {timeout_ms}ms")]
    ForwardTimeout {
        instance_id: InstanceId,
        timeout_ms: u64,
    },

    #[error("Worker runtime error: {0}")]
    Runtime(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl SandpoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandpoolError::NoCapacity { .. } => ErrorKind::NoCapacity,
            SandpoolError::StartupFailed { .. } => ErrorKind::StartupFailed,
            SandpoolError::ForwardFailure { .. } => ErrorKind::ForwardFailure,
            SandpoolError::ForwardTimeout { .. } => ErrorKind::ForwardTimeout,
            SandpoolError::ProbeTimeout { .. } => ErrorKind::ProbeTimeout,
            SandpoolError::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            SandpoolError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SandpoolError::Connection(_)
            | SandpoolError::Transport(_)
            | SandpoolError::Runtime(_)
            | SandpoolError::Io(_)
            | SandpoolError::JsonSerialization(_) => ErrorKind::Internal,
        }
    }

    /// The instance this error is about, if any.
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            SandpoolError::StartupFailed { instance_id, .. }
            | SandpoolError::ForwardFailure { instance_id, .. }
            | SandpoolError::ForwardTimeout { instance_id, .. }
            | SandpoolError::ProbeTimeout { instance_id, .. }
            | SandpoolError::InstanceNotFound(instance_id) => Some(instance_id),
            _ => None,
        }
    }

    /// Message safe to hand to the original caller.
    ///
    /// Built only from the kind and instance id. Runtime and transport
    /// reasons can embed backend addresses, so they stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            SandpoolError::NoCapacity { .. } => {
                "service busy: no worker instance available, retry later".to_string()
            }
            SandpoolError::StartupFailed { instance_id, .. } => {
                format!("upstream unavailable: instance {} failed to start", instance_id)
            }
            SandpoolError::ForwardFailure { instance_id, .. } => {
                format!("upstream error from instance {}", instance_id)
            }
            SandpoolError::ForwardTimeout {
                instance_id,
                timeout_ms,
            } => format!(
                "upstream instance {} timed out after {}ms",
                instance_id, timeout_ms
            ),
            _ => "internal dispatcher error".to_string(),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandpoolError::NoCapacity { .. } | SandpoolError::StartupFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SandpoolError>;
