use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::forwarder::handle_connection;
use crate::liveness;
use crate::registry::Registry;

/// Owns the control-channel listener and the shared [`Registry`].
/// Construct with [`Server::bind`], then run with [`Server::run`].
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.effective_bind_addr().to_string();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "listening for agent connections");
        Ok(Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        })
    }

    /// The address the control-channel listener actually bound to,
    /// useful when `bind_addr` asked for an OS-assigned port.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A clone of the registry handle, for callers embedding the server
    /// and wanting to read [`Registry::snapshot`] concurrently (e.g. to
    /// serve it over their own HTTP endpoint).
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Accept connections and run the liveness sweep until the process
    /// is killed. Each accepted connection is handled on its own task;
    /// a failed accept is logged and does not bring the server down.
    pub async fn run(self) -> Result<()> {
        let _liveness_shutdown = liveness::spawn(
            self.registry.clone(),
            Duration::from_secs(self.config.liveness_period_secs),
            chrono::Duration::seconds(self.config.timeout_secs as i64),
        );

        let max_frame = self.config.max_frame_bytes;
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            tracing::debug!(%peer_addr, "accepted connection");
            let registry = self.registry.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer_addr, registry, max_frame).await;
            });
        }
    }
}
