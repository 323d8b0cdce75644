//! SSH server for the sshexec daemon.
//!
//! Accepts TCP connections and runs each one as an independent russh
//! session driven by [`SessionHandler`].

mod config;
mod handler;
pub mod host_key;

pub use config::{DEFAULT_PORT, ServerConfig};
pub use handler::SessionHandler;
pub use host_key::{HostKeyError, load_or_generate};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::accept::{ACCEPT_BACKOFF, is_transient_accept_error};
use crate::pipeline::Executor;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// SSH server handle.
pub struct SshServer {
    config: ServerConfig,
    executor: Arc<Executor>,
    ssh_config: Arc<russh::server::Config>,
}

impl SshServer {
    /// Create a server presenting `host_key` and running invocations on `executor`.
    pub fn new(config: ServerConfig, executor: Arc<Executor>, host_key: PrivateKey) -> Self {
        let ssh_config = russh::server::Config {
            keys: vec![host_key],
            inactivity_timeout: config.inactivity_timeout,
            auth_rejection_time: config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };
        Self {
            config,
            executor,
            ssh_config: Arc::new(ssh_config),
        }
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(addr = %listener.local_addr().unwrap_or(addr), "Listening for SSH connections");
        Ok(listener)
    }

    /// Accept connections until a non-transient accept error occurs.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept failure, retrying");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let handler = SessionHandler::new(Arc::clone(&self.executor), Some(peer));
        let ssh_config = Arc::clone(&self.ssh_config);
        tokio::spawn(async move {
            let session = match russh::server::run_stream(ssh_config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%peer, error = %e, "SSH handshake failed");
                    return;
                }
            };
            match session.await {
                Ok(()) => debug!(%peer, "Connection closed"),
                Err(e) => warn!(%peer, error = %e, "Connection ended with error"),
            }
        });
    }
}
