//! sshexec Daemon Library
//!
//! Core functionality for the sshexec daemon:
//! - Execution pipeline running one shell subprocess per SSH channel
//! - Agent-forwarding relay sockets for subprocesses
//! - Task identifiers for log correlation
//! - SSH session server adapting channels into pipeline sessions

mod accept;
pub mod agent;
pub mod pipeline;
pub mod server;
pub mod task;
