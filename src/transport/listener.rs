//! TCP listener accepting agent connections.
//!
//! Agents are frequently unreachable from the collector (NAT, firewalls,
//! short-lived containers), so they dial in and keep the stream open; each
//! accepted stream is served on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::connection::serve_connection;
use crate::session::{AgentSessionRegistry, SessionConfig};

/// Listener for inbound agent streams.
pub struct AgentListener {
    listener: TcpListener,
    registry: Arc<AgentSessionRegistry>,
    config: SessionConfig,
}

impl AgentListener {
    /// Bind to `addr` (for example `0.0.0.0:8181`).
    pub async fn bind(
        addr: &str,
        registry: Arc<AgentSessionRegistry>,
        config: SessionConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind agent listener to {addr}"))?;

        info!(addr = %addr, "Agent listener bound");

        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Run the accept loop, serving each connection on its own task.
    ///
    /// This method runs until the task is aborted.
    pub async fn accept_loop(self: Arc<Self>) {
        info!("Starting agent accept loop");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted agent connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let registry = Arc::clone(&self.registry);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        match serve_connection(stream, registry, &config).await {
                            Ok(agent_id) => {
                                info!(agent_id = %agent_id, peer = %peer, "Agent connection ended");
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Agent connection failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    // Brief delay before retrying
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
