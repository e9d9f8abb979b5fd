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

//! HTTP server for the dispatcher.

use axum::Router;
use sandpool_common::{Result, SandpoolError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::http_router::{router, DEFAULT_MAX_BODY_BYTES};

/// HTTP front end: proxies every request through the dispatcher.
pub struct HttpServer {
    app: Router,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_body_limit(dispatcher, DEFAULT_MAX_BODY_BYTES)
    }

    /// Like [`HttpServer::new`] with a custom request body limit.
    pub fn with_body_limit(dispatcher: Arc<Dispatcher>, max_body_bytes: usize) -> Self {
        Self {
            app: router(dispatcher, max_body_bytes),
        }
    }

    pub fn into_router(self) -> Router {
        self.app
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        self.run_until(addr, std::future::pending()).await
    }

    /// Binds `addr` and serves until `shutdown` resolves, letting in-flight
    /// requests finish.
    pub async fn run_until<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SandpoolError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener
            .local_addr()
            .map_err(|e| SandpoolError::Transport(format!("Failed to get local addr: {}", e)))?;
        info!("Sandpool HTTP server listening on {}", local_addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| SandpoolError::Transport(format!("Server error: {}", e)))?;

        info!("Sandpool HTTP server stopped");
        Ok(())
    }
}
