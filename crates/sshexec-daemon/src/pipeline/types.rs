//! Pipeline session, configuration and outcome types.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentChannelOpener, RelayError, RelayNaming};
use crate::task::TaskId;

/// Exit status reported for rejected or failed invocations.
pub const FAILURE_STATUS: u32 = 1;

/// How the subprocess exit code maps to the status reported to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitStatusPolicy {
    /// Report the subprocess's real exit code (`128 + signal` if killed).
    #[default]
    Propagate,
    /// Report 0 for every command that ran, whatever it exited with.
    AlwaysZero,
}

/// Pipeline configuration shared by every session.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Shell run as `<shell> -c <command>`.
    pub shell: PathBuf,
    pub exit_policy: ExitStatusPolicy,
    /// Kill the subprocess when the caller goes away before it exits.
    pub kill_on_disconnect: bool,
    pub relay_naming: RelayNaming,
}

impl PipelineConfig {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            exit_policy: ExitStatusPolicy::default(),
            kill_on_disconnect: true,
            relay_naming: RelayNaming::default(),
        }
    }

    #[must_use]
    pub const fn with_exit_policy(mut self, policy: ExitStatusPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_kill_on_disconnect(mut self, kill: bool) -> Self {
        self.kill_on_disconnect = kill;
        self
    }

    #[must_use]
    pub fn with_relay_naming(mut self, naming: RelayNaming) -> Self {
        self.relay_naming = naming;
        self
    }
}

/// One execution request and its I/O channels.
///
/// `stdin`/`stdout` are the two halves of the primary channel and `stderr` is
/// the diagnostic channel. `command` is `None` for shell (interactive)
/// requests.
pub struct ExecSession<I, O, E> {
    /// Authenticated principal; opaque to the pipeline, used in logs.
    pub user: String,
    pub command: Option<String>,
    pub env: Vec<(String, String)>,
    pub stdin: I,
    pub stdout: O,
    pub stderr: E,
    /// Present when the caller asked for agent forwarding.
    pub agent: Option<Arc<dyn AgentChannelOpener>>,
    /// Fired when the caller goes away.
    pub cancel: CancellationToken,
}

impl<I, O, E> ExecSession<I, O, E> {
    pub fn new(user: impl Into<String>, command: Option<String>, stdin: I, stdout: O, stderr: E) -> Self {
        Self {
            user: user.into(),
            command,
            env: Vec::new(),
            stdin,
            stdout,
            stderr,
            agent: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_agent(mut self, opener: Arc<dyn AgentChannelOpener>) -> Self {
        self.agent = Some(opener);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A subprocess that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub task_id: TaskId,
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Status reported to the caller after applying the exit policy.
    pub reported_status: u32,
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub enum ExecOutcome {
    /// No command was given; the caller was told interactive use is refused.
    Rejected,
    /// Agent forwarding was requested but the relay could not be created.
    RelayFailed(RelayError),
    /// The shell could not be started.
    SpawnFailed(io::Error),
    Completed(Completion),
}

impl ExecOutcome {
    /// Exit status to report on the session.
    pub const fn exit_status(&self) -> u32 {
        match self {
            Self::Rejected | Self::RelayFailed(_) | Self::SpawnFailed(_) => FAILURE_STATUS,
            Self::Completed(completion) => completion.reported_status,
        }
    }

    /// Task identifier, issued only when a subprocess started.
    pub const fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Completed(completion) => Some(completion.task_id),
            _ => None,
        }
    }

    /// Lifecycle state the invocation ends in.
    pub const fn terminal_state(&self) -> InvocationState {
        match self {
            Self::Rejected => InvocationState::Rejected,
            Self::RelayFailed(_) => InvocationState::RelayFailed,
            Self::SpawnFailed(_) => InvocationState::SpawnFailed,
            Self::Completed(_) => InvocationState::Terminated,
        }
    }
}

/// Lifecycle of one invocation, traced at debug level.
///
/// ```text
/// Idle → Validating → Rejected
///                   ↘ Preparing → RelayFailed
///                               ↘ Spawning → SpawnFailed
///                                          ↘ Running → Draining → Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Validating,
    Rejected,
    Preparing,
    RelayFailed,
    Spawning,
    SpawnFailed,
    Running,
    Draining,
    Terminated,
}

impl InvocationState {
    /// Whether no further transition can happen.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::RelayFailed | Self::SpawnFailed | Self::Terminated
        )
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Rejected => "rejected",
            Self::Preparing => "preparing",
            Self::RelayFailed => "relay_failed",
            Self::Spawning => "spawning",
            Self::SpawnFailed => "spawn_failed",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
