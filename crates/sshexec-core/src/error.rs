//! Error types for `sshexec` core library.

use thiserror::Error;

/// Result type alias using `sshexec` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `sshexec` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The shell executable could not be located or is not executable
    #[error("Could not find shell executable ({name}): {source}")]
    ShellNotFound {
        name: String,
        #[source]
        source: which::Error,
    },
}
