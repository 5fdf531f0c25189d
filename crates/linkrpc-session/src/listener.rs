use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use linkrpc_transport::UdsListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::dispatch::ServiceProvider;
use crate::error::Result;
use crate::server::ServerConnection;

/// Accepts clients on a Unix domain socket and serves `provider` to each.
pub struct SessionListener {
    socket: UdsListener,
    provider: Arc<dyn ServiceProvider>,
    config: ServerConfig,
    next_peer_id: AtomicU64,
}

impl SessionListener {
    pub fn bind(path: impl AsRef<Path>, provider: Arc<dyn ServiceProvider>) -> Result<Self> {
        Ok(Self {
            socket: UdsListener::bind(path)?,
            provider,
            config: ServerConfig::default(),
            next_peer_id: AtomicU64::new(1),
        })
    }

    /// Settings applied to every accepted connection.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept the next client. Each connection is labelled `peer-N`.
    pub fn accept(&self) -> Result<ServerConnection> {
        let stream = self.socket.accept()?;
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("peer-{id}");
        if let Some((uid, gid, pid)) = stream.peer_credentials() {
            info!(peer = %label, uid, gid, pid, "client accepted");
        } else {
            info!(peer = %label, "client accepted");
        }
        ServerConnection::accept(
            stream,
            Arc::clone(&self.provider),
            self.config.clone(),
            &label,
        )
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}
