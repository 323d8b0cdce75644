//! Host key loading.
//!
//! Without a configured key the server generates an ephemeral Ed25519 key
//! at startup, so clients see a new host identity after every restart.

use std::path::{Path, PathBuf};

use russh::keys::{Algorithm, PrivateKey};
use tracing::{info, warn};

/// Errors from host key setup.
#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("Failed to load host key {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("Failed to generate host key: {0}")]
    Generate(String),
}

/// Load the host key at `path`, or generate an ephemeral one when `None`.
pub fn load_or_generate(path: Option<&Path>) -> Result<PrivateKey, HostKeyError> {
    match path {
        Some(path) => {
            let key = russh::keys::load_secret_key(path, None).map_err(|source| {
                HostKeyError::Load {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            info!(path = %path.display(), algorithm = %key.algorithm(), "Loaded host key");
            Ok(key)
        }
        None => {
            let key = generate_ephemeral()?;
            warn!("No host key configured, using an ephemeral Ed25519 key");
            Ok(key)
        }
    }
}

/// Generate a fresh Ed25519 host key.
pub fn generate_ephemeral() -> Result<PrivateKey, HostKeyError> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| HostKeyError::Generate(e.to_string()))
}
