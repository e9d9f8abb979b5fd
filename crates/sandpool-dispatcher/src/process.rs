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

//! Worker runtime backed by local child processes.

use async_trait::async_trait;
use sandpool_common::{
    ForwardRequest, ForwardResponse, InstanceId, ProbeStatus, Result, SandpoolError,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::forward::HttpForwarder;
use crate::runtime::WorkerRuntime;

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Environment variable that tells the worker which port to listen on.
    pub port_env: String,
    /// Interface the worker listens on.
    pub host: String,
    pub probe_path: String,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            port_env: "PORT".to_string(),
            host: "127.0.0.1".to_string(),
            probe_path: "/status".to_string(),
        }
    }
}

struct Worker {
    child: Child,
    address: String,
}

/// Runs one child process per instance and talks to it over HTTP.
///
/// Each worker is told its port through `port_env` and its instance id
/// through `SANDPOOL_INSTANCE_ID`. Children are killed when stopped, and
/// when the runtime itself is dropped.
pub struct ProcessRuntime {
    config: ProcessConfig,
    forwarder: HttpForwarder,
    workers: Mutex<HashMap<InstanceId, Worker>>,
}

impl ProcessRuntime {
    pub fn new(config: ProcessConfig) -> Self {
        let forwarder = HttpForwarder::new(config.probe_path.clone());
        Self {
            config,
            forwarder,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<InstanceId, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks the OS for a port that is free right now.
    async fn free_port(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), 0)).await?;
        Ok(listener.local_addr()?.port())
    }

    /// Exit status of the worker at `address`, if it has already exited.
    fn exited(&self, address: &str) -> Option<String> {
        let mut workers = self.workers();
        let worker = workers.values_mut().find(|w| w.address == address)?;
        match worker.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl WorkerRuntime for ProcessRuntime {
    async fn start(&self, id: &InstanceId) -> Result<String> {
        let port = self.free_port().await?;
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env(&self.config.port_env, port.to_string())
            .env("SANDPOOL_INSTANCE_ID", id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            SandpoolError::Runtime(format!("Failed to spawn '{}': {}", self.config.command, e))
        })?;
        let address = format!("{}:{}", self.config.host, port);
        info!(instance = %id, pid = ?child.id(), port, "Spawned worker process");

        self.workers().insert(
            id.clone(),
            Worker {
                child,
                address: address.clone(),
            },
        );
        Ok(address)
    }

    async fn stop(&self, id: &InstanceId) -> Result<()> {
        let worker = self.workers().remove(id);
        let Some(mut worker) = worker else {
            debug!(instance = %id, "No worker process to stop");
            return Ok(());
        };

        match worker.child.try_wait()? {
            Some(status) => debug!(instance = %id, %status, "Worker process already exited"),
            None => {
                worker.child.kill().await?;
                debug!(instance = %id, "Killed worker process");
            }
        }
        Ok(())
    }

    async fn health_check(&self, address: &str) -> ProbeStatus {
        if let Some(status) = self.exited(address) {
            warn!("Worker process exited: {}", status);
            return ProbeStatus::Exited(status.to_string());
        }
        self.forwarder.probe(address).await
    }

    async fn forward(&self, address: &str, request: ForwardRequest) -> Result<ForwardResponse> {
        self.forwarder.forward(address, request).await
    }
}
