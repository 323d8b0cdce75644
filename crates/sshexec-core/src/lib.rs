//! `sshexec` Core Library
//!
//! Shared functionality for `sshexec` components:
//! - Shell executable resolution
//! - Tracing/logging initialisation
//! - Error types

pub mod error;
pub mod shell;
pub mod tracing_init;

pub use error::{Error, Result};
pub use shell::{DEFAULT_SHELL, resolve_shell};
