//! Agent forwarding: a short-path Unix socket inside the daemon host that the
//! subprocess reaches through `SSH_AUTH_SOCK`, relayed to the caller's agent.

pub mod forward;
pub mod listener;

pub use forward::{AgentChannelOpener, AgentForwarding, AgentIo, AgentStream};
pub use listener::{
    AGENT_SOCKET_ENV, AgentRelay, MAX_SOCKET_PATH_LEN, RelayError, RelayNaming, create_relay,
};
