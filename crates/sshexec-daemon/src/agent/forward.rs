//! Agent forwarding shuttle.
//!
//! Each local client that connects to the relay socket gets its own agent
//! channel toward the caller, and bytes are copied both ways until either
//! side closes. The shuttle owns the relay and closes it when stopped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::AgentRelay;
use crate::accept::{ACCEPT_BACKOFF, is_transient_accept_error};

/// Byte stream toward the caller's agent.
pub trait AgentIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentIo for T {}

/// Boxed agent stream returned by [`AgentChannelOpener`].
pub type AgentStream = Box<dyn AgentIo>;

/// Opens a new agent channel toward the caller, one per local client.
#[async_trait]
pub trait AgentChannelOpener: Send + Sync {
    async fn open_agent_channel(&self) -> io::Result<AgentStream>;
}

/// A running shuttle bound to one relay.
#[derive(Debug)]
pub struct AgentForwarding {
    socket_path: PathBuf,
    stop: CancellationToken,
    task: JoinHandle<io::Result<()>>,
}

impl AgentForwarding {
    /// Start relaying connections accepted on `relay` through `opener`.
    pub fn start(relay: AgentRelay, opener: Arc<dyn AgentChannelOpener>) -> Self {
        let socket_path = relay.path().to_path_buf();
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_shuttle(relay, opener, stop.clone()));
        Self {
            socket_path,
            stop,
            task,
        }
    }

    /// Path of the relay socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, drop in-flight agent connections and close the relay.
    pub async fn stop(self) -> io::Result<()> {
        self.stop.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

async fn run_shuttle(
    relay: AgentRelay,
    opener: Arc<dyn AgentChannelOpener>,
    stop: CancellationToken,
) -> io::Result<()> {
    let listener = &relay;
    accept_loop(move || listener.accept(), relay.path(), &opener, &stop).await;
    relay.close()
}

/// Relay accepted clients until `stop` fires or accepting fails for good.
///
/// Transient failures are retried after a back-off so one bad accept does
/// not end forwarding for the rest of the session.
async fn accept_loop<A, F>(
    mut accept: A,
    path: &Path,
    opener: &Arc<dyn AgentChannelOpener>,
    stop: &CancellationToken,
) where
    A: FnMut() -> F,
    F: Future<Output = io::Result<UnixStream>>,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            accepted = accept() => match accepted {
                Ok(stream) => {
                    connections.spawn(relay_connection(stream, Arc::clone(opener)));
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(path = %path.display(), error = %e, "Transient agent listener accept failure, retrying");
                    tokio::select! {
                        () = stop.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Agent listener accept failed");
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

async fn relay_connection(mut local: UnixStream, opener: Arc<dyn AgentChannelOpener>) {
    let mut remote = match opener.open_agent_channel().await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(error = %e, "Failed to open agent channel to caller");
            return;
        }
    };
    info!("Forwarding agent connection");

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((to_agent, from_agent)) => {
            debug!(to_agent, from_agent, "Agent connection finished");
        }
        Err(e) => {
            debug!(error = %e, "Agent connection ended with error");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::agent::listener::{RelayNaming, create_relay};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Accept source replaying `results`, then waiting forever.
    fn scripted(
        results: Vec<io::Result<UnixStream>>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = io::Result<UnixStream>> + Send>> {
        let mut results = VecDeque::from(results);
        move || {
            let next = results.pop_front();
            Box::pin(async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }
    }

    /// Opener whose "caller side" ends are handed to the test.
    struct DuplexOpener {
        agents: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl AgentChannelOpener for DuplexOpener {
        async fn open_agent_channel(&self) -> io::Result<AgentStream> {
            let (ours, theirs) = tokio::io::duplex(1024);
            self.agents
                .send(theirs)
                .map_err(|_| io::Error::other("test agent gone"))?;
            Ok(Box::new(ours))
        }
    }

    struct FailingOpener;

    #[async_trait]
    impl AgentChannelOpener for FailingOpener {
        async fn open_agent_channel(&self) -> io::Result<AgentStream> {
            Err(io::Error::other("channel refused"))
        }
    }

    #[tokio::test]
    async fn shuttles_bytes_both_ways() {
        let root = tempfile::TempDir::new().unwrap();
        let relay = create_relay(&RelayNaming::default().with_temp_root(root.path())).unwrap();
        let (tx, mut agents) = mpsc::unbounded_channel();
        let forwarding = AgentForwarding::start(relay, Arc::new(DuplexOpener { agents: tx }));

        let mut client = UnixStream::connect(forwarding.socket_path()).await.unwrap();
        client.write_all(b"request").await.unwrap();

        let mut agent = agents.recv().await.unwrap();
        let mut buf = [0u8; 7];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        agent.write_all(b"answer").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"answer");

        forwarding.stop().await.unwrap();
    }

    #[tokio::test]
    async fn each_client_gets_its_own_channel() {
        let root = tempfile::TempDir::new().unwrap();
        let relay = create_relay(&RelayNaming::default().with_temp_root(root.path())).unwrap();
        let (tx, mut agents) = mpsc::unbounded_channel();
        let forwarding = AgentForwarding::start(relay, Arc::new(DuplexOpener { agents: tx }));

        let _first = UnixStream::connect(forwarding.socket_path()).await.unwrap();
        let _second = UnixStream::connect(forwarding.socket_path()).await.unwrap();
        assert!(agents.recv().await.is_some());
        assert!(agents.recv().await.is_some());

        forwarding.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_removes_relay_socket() {
        let root = tempfile::TempDir::new().unwrap();
        let relay = create_relay(&RelayNaming::default().with_temp_root(root.path())).unwrap();
        let (tx, _agents) = mpsc::unbounded_channel();
        let forwarding = AgentForwarding::start(relay, Arc::new(DuplexOpener { agents: tx }));
        let path = forwarding.socket_path().to_path_buf();
        assert!(path.exists());

        forwarding.stop().await.unwrap();

        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
        assert!(UnixStream::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn refused_channel_drops_local_client() {
        let root = tempfile::TempDir::new().unwrap();
        let relay = create_relay(&RelayNaming::default().with_temp_root(root.path())).unwrap();
        let forwarding = AgentForwarding::start(relay, Arc::new(FailingOpener));

        let mut client = UnixStream::connect(forwarding.socket_path()).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        forwarding.stop().await.unwrap();
    }

    #[tokio::test]
    async fn transient_accept_error_keeps_forwarding() {
        let (local, mut client) = UnixStream::pair().unwrap();
        let (tx, mut agents) = mpsc::unbounded_channel();
        let opener: Arc<dyn AgentChannelOpener> = Arc::new(DuplexOpener { agents: tx });
        let stop = CancellationToken::new();
        let accept = scripted(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Err(io::Error::from_raw_os_error(libc::EMFILE)),
            Ok(local),
        ]);
        let looped = tokio::spawn({
            let stop = stop.clone();
            async move { accept_loop(accept, Path::new("/run/agent"), &opener, &stop).await }
        });

        let mut agent = agents.recv().await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        stop.cancel();
        looped.await.unwrap();
    }

    #[tokio::test]
    async fn fatal_accept_error_ends_loop() {
        let opener: Arc<dyn AgentChannelOpener> = Arc::new(FailingOpener);
        let stop = CancellationToken::new();
        let accept = scripted(vec![Err(io::Error::from_raw_os_error(libc::EBADF))]);

        let ended = tokio::time::timeout(
            Duration::from_secs(5),
            accept_loop(accept, Path::new("/run/agent"), &opener, &stop),
        )
        .await;
        assert!(ended.is_ok());
        assert!(!stop.is_cancelled());
    }
}
