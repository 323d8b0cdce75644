//! Agent relay listener.
//!
//! Unix socket paths are limited by the size of `sockaddr_un.sun_path`
//! (108 bytes including the terminating NUL on Linux, 104 on the BSDs and
//! macOS). Conventional naming schemes such as `/tmp/auth-agent<random>/
//! listener.sock` under a long `$TMPDIR` overflow that limit, so the relay
//! lives at `<temp root>/<short prefix><random>/<short name>` and the
//! composed path is checked before binding.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

/// Environment variable through which the subprocess discovers the agent.
pub const AGENT_SOCKET_ENV: &str = "SSH_AUTH_SOCK";

/// Longest socket path (in bytes, without the NUL) the platform accepts.
#[cfg(target_os = "linux")]
pub const MAX_SOCKET_PATH_LEN: usize = 107;
#[cfg(not(target_os = "linux"))]
pub const MAX_SOCKET_PATH_LEN: usize = 103;

const DEFAULT_DIR_PREFIX: &str = "agent";
const DEFAULT_SOCKET_NAME: &str = "agent";

/// Naming strategy for relay sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNaming {
    /// Directory under which the per-session directory is created.
    pub temp_root: PathBuf,
    /// Prefix of the per-session directory; a random suffix is appended.
    pub dir_prefix: String,
    /// File name of the socket inside the per-session directory.
    pub socket_name: String,
}

impl Default for RelayNaming {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir(),
            dir_prefix: DEFAULT_DIR_PREFIX.to_string(),
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
        }
    }
}

impl RelayNaming {
    /// Set the directory relay directories are created in.
    #[must_use]
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    /// Set the per-session directory prefix.
    #[must_use]
    pub fn with_dir_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dir_prefix = prefix.into();
        self
    }

    /// Set the socket file name.
    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = name.into();
        self
    }
}

/// Errors from relay creation.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to create agent directory under {root}: {source}")]
    CreateDir {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Agent socket path {path} is {len} bytes, exceeding the {max}-byte limit")]
    PathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("Failed to bind agent socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A bound relay socket and the temporary directory holding it.
///
/// Closing consumes the relay, so it can happen at most once. If a relay is
/// dropped without [`AgentRelay::close`] the directory is still removed.
#[derive(Debug)]
pub struct AgentRelay {
    listener: UnixListener,
    path: PathBuf,
    dir: TempDir,
}

/// Create a relay socket according to `naming`.
pub fn create_relay(naming: &RelayNaming) -> Result<AgentRelay, RelayError> {
    let dir = tempfile::Builder::new()
        .prefix(&naming.dir_prefix)
        .tempdir_in(&naming.temp_root)
        .map_err(|source| RelayError::CreateDir {
            root: naming.temp_root.clone(),
            source,
        })?;

    let path = dir.path().join(&naming.socket_name);
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH_LEN {
        return Err(RelayError::PathTooLong {
            path,
            len,
            max: MAX_SOCKET_PATH_LEN,
        });
    }

    let listener = UnixListener::bind(&path).map_err(|source| RelayError::Bind {
        path: path.clone(),
        source,
    })?;

    info!(path = %path.display(), "Agent listener created");
    Ok(AgentRelay {
        listener,
        path,
        dir,
    })
}

impl AgentRelay {
    /// Address handed to the subprocess.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next local agent client.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Stop listening and remove the socket together with its directory.
    pub fn close(self) -> io::Result<()> {
        let Self {
            listener,
            path,
            dir,
        } = self;
        drop(listener);
        dir.close()?;
        debug!(path = %path.display(), "Agent listener closed");
        Ok(())
    }
}
