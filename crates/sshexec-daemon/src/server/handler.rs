//! Per-connection SSH handler.
//!
//! Authentication is permissive: the transport accepts every principal and
//! the name is only carried into logs. Each session channel collects `env`
//! and `auth-agent-req` requests until an `exec` (or `shell`) request hands
//! it to the execution pipeline.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{AgentChannelOpener, AgentStream};
use crate::pipeline::{ExecSession, Executor};

use super::ServerError;

/// Extended-data type code of stderr (RFC 4254 §5.2).
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Principal name used until authentication names one.
const UNKNOWN_USER: &str = "unknown";

struct ChannelState {
    /// Taken when the channel is handed to the pipeline.
    channel: Option<Channel<Msg>>,
    env: Vec<(String, String)>,
    agent_requested: bool,
    cancel: CancellationToken,
}

/// russh handler for one client connection.
pub struct SessionHandler {
    executor: Arc<Executor>,
    peer: Option<SocketAddr>,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SessionHandler {
    pub fn new(executor: Arc<Executor>, peer: Option<SocketAddr>) -> Self {
        Self {
            executor,
            peer,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn accept_user(&mut self, user: &str, method: &str) -> Auth {
        info!(peer = ?self.peer, user, method, "Accepted authentication");
        self.user = Some(user.to_string());
        Auth::Accept
    }

    /// Hand the channel to the pipeline in a task of its own.
    fn start_invocation(
        &mut self,
        id: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<(), ServerError> {
        let Some(state) = self.channels.get_mut(&id) else {
            session.channel_failure(id)?;
            return Ok(());
        };
        let Some(channel) = state.channel.take() else {
            debug!(channel = ?id, "Ignoring second exec request on channel");
            session.channel_failure(id)?;
            return Ok(());
        };
        session.channel_success(id)?;

        let handle = session.handle();
        let user = self.user.clone().unwrap_or_else(|| UNKNOWN_USER.to_string());
        let stderr = channel.make_writer_ext(Some(SSH_EXTENDED_DATA_STDERR));
        let (stdin, stdout) = tokio::io::split(channel.into_stream());

        let mut exec = ExecSession::new(user, command, stdin, stdout, stderr)
            .with_env(std::mem::take(&mut state.env))
            .with_cancel(state.cancel.clone());
        if state.agent_requested {
            exec = exec.with_agent(Arc::new(ChannelAgentOpener {
                handle: handle.clone(),
            }));
        }

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let outcome = executor.run(exec).await;
            report_exit(&handle, id, outcome.exit_status()).await;
        });
        Ok(())
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        for state in self.channels.values() {
            state.cancel.cancel();
        }
    }
}

impl russh::server::Handler for SessionHandler {
    type Error = ServerError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user, "none"))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user, "password"))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.accept_user(user, "publickey"))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = ?self.peer, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(
            channel.id(),
            ChannelState {
                channel: Some(channel),
                env: Vec::new(),
                agent_requested: false,
                cancel: CancellationToken::new(),
            },
        );
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(false);
        };
        state.agent_requested = true;
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_invocation(channel, None, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.start_invocation(channel, Some(command), session)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }
}

/// Opens `auth-agent@openssh.com` channels back to the client.
struct ChannelAgentOpener {
    handle: Handle,
}

#[async_trait]
impl AgentChannelOpener for ChannelAgentOpener {
    async fn open_agent_channel(&self) -> io::Result<AgentStream> {
        let channel = self
            .handle
            .channel_open_agent()
            .await
            .map_err(io::Error::other)?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Send the exit status, then EOF and close the channel.
async fn report_exit(handle: &Handle, id: ChannelId, status: u32) {
    if handle.exit_status_request(id, status).await.is_err() {
        debug!(channel = ?id, "Failed to send exit status, channel already closed");
    }
    if handle.eof(id).await.is_err() {
        debug!(channel = ?id, "Failed to send EOF");
    }
    if handle.close(id).await.is_err() {
        debug!(channel = ?id, "Failed to close channel");
    }
}
