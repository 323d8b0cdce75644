//! Execution pipeline: one shell subprocess per session.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AGENT_SOCKET_ENV, AgentForwarding, create_relay};
use crate::task::{TaskId, TaskRegistry};

use super::copy::{RelayOutcome, StreamDirection, StreamEnd, copy_stream};
use super::types::{
    Completion, ExecOutcome, ExecSession, ExitStatusPolicy, FAILURE_STATUS, InvocationState,
    PipelineConfig,
};

/// Written to the primary channel when a session carries no command.
pub const INTERACTIVE_REJECTION: &str = "Interactive invocation is not supported\n";

/// Runs sessions as `<shell> -c <command>` subprocesses.
#[derive(Debug)]
pub struct Executor {
    config: PipelineConfig,
    tasks: Arc<TaskRegistry>,
}

/// Debug trace of an invocation's state transitions.
struct Lifecycle<'a> {
    user: &'a str,
    state: InvocationState,
}

impl<'a> Lifecycle<'a> {
    const fn new(user: &'a str) -> Self {
        Self {
            user,
            state: InvocationState::Idle,
        }
    }

    fn advance(&mut self, next: InvocationState) {
        debug!(user = %self.user, from = %self.state, to = %next, "Invocation state changed");
        self.state = next;
    }

    /// Enter the terminal state matching `outcome` and hand it back.
    fn finish(&mut self, outcome: ExecOutcome) -> ExecOutcome {
        self.advance(outcome.terminal_state());
        outcome
    }
}

impl Executor {
    pub const fn new(config: PipelineConfig, tasks: Arc<TaskRegistry>) -> Self {
        Self { config, tasks }
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub const fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Run one session to completion and report how it ended.
    ///
    /// Every resource the run creates (subprocess, relay socket, copy tasks)
    /// is released before this returns, whichever path it takes.
    #[allow(clippy::too_many_lines)]
    pub async fn run<I, O, E>(&self, session: ExecSession<I, O, E>) -> ExecOutcome
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let ExecSession {
            user,
            command,
            env,
            stdin,
            mut stdout,
            mut stderr,
            agent,
            cancel,
        } = session;
        let mut lifecycle = Lifecycle::new(&user);

        lifecycle.advance(InvocationState::Validating);
        let Some(command) = command.filter(|c| !c.trim().is_empty()) else {
            info!(user = %user, "Rejecting interactive invocation");
            if let Err(e) = write_message(&mut stdout, INTERACTIVE_REJECTION).await {
                debug!(user = %user, error = %e, "Failed to deliver rejection message");
            }
            return lifecycle.finish(ExecOutcome::Rejected);
        };

        lifecycle.advance(InvocationState::Preparing);
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&command)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let forwarding = match agent {
            Some(opener) => match create_relay(&self.config.relay_naming) {
                Ok(relay) => {
                    info!(user = %user, path = %relay.path().display(), "Starting agent listener");
                    cmd.env(AGENT_SOCKET_ENV, relay.path());
                    Some(AgentForwarding::start(relay, opener))
                }
                Err(e) => {
                    error!(user = %user, error = %e, "Failed to create agent listener");
                    let message = format!("agent forwarding unavailable: {e}\n");
                    if let Err(write_err) = write_message(&mut stderr, &message).await {
                        debug!(user = %user, error = %write_err, "Failed to deliver relay error");
                    }
                    return lifecycle.finish(ExecOutcome::RelayFailed(e));
                }
            },
            None => None,
        };

        lifecycle.advance(InvocationState::Spawning);
        let spawned = cmd.spawn().and_then(|mut child| {
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(i), Some(o), Some(e)) => Ok((child, i, o, e)),
                _ => Err(io::Error::other("subprocess standard streams unavailable")),
            }
        });
        let (mut child, child_stdin, child_stdout, child_stderr) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    user = %user,
                    shell = %self.config.shell.display(),
                    error = %e,
                    "Failed to spawn subprocess"
                );
                if let Err(write_err) = write_message(&mut stderr, &format!("{e}\n")).await {
                    debug!(user = %user, error = %write_err, "Failed to deliver spawn error");
                }
                release_forwarding(forwarding, None).await;
                return lifecycle.finish(ExecOutcome::SpawnFailed(e));
            }
        };

        let task_id = self.tasks.next_task_id();
        info!(task_id = %task_id, user = %user, pid = ?child.id(), "Started subprocess");
        lifecycle.advance(InvocationState::Running);

        let input = tokio::spawn(copy_stream(StreamDirection::Input, stdin, child_stdin));
        let mut diagnostics =
            tokio::spawn(copy_stream(StreamDirection::Diagnostics, child_stderr, stderr));

        let kill_on_disconnect = self.config.kill_on_disconnect;
        let output = {
            let copy = copy_stream(StreamDirection::Output, child_stdout, &mut stdout);
            tokio::pin!(copy);
            tokio::select! {
                outcome = &mut copy => outcome,
                () = cancel.cancelled(), if kill_on_disconnect => {
                    kill_child(&mut child, task_id);
                    copy.await
                }
            }
        };
        log_relay_outcome(task_id, &output);

        lifecycle.advance(InvocationState::Draining);
        let status = wait_child(&mut child, &cancel, kill_on_disconnect, task_id).await;

        tokio::select! {
            joined = &mut diagnostics => match joined {
                Ok(outcome) => log_relay_outcome(task_id, &outcome),
                Err(e) => debug!(task_id = %task_id, error = %e, "Diagnostics relay task failed"),
            },
            () = cancel.cancelled() => {
                diagnostics.abort();
                debug!(task_id = %task_id, "Caller gone, dropping remaining diagnostics");
            }
        }

        input.abort();
        match input.await {
            Ok(outcome) => log_relay_outcome(task_id, &outcome),
            Err(e) if e.is_cancelled() => {
                debug!(task_id = %task_id, "Input relay stopped after subprocess exit");
            }
            Err(e) => debug!(task_id = %task_id, error = %e, "Input relay task failed"),
        }

        let completion = self.complete(task_id, status);
        info!(
            task_id = %task_id,
            exit_code = ?completion.exit_code,
            signal = ?completion.signal,
            reported_status = completion.reported_status,
            "Subprocess exited"
        );

        release_forwarding(forwarding, Some(task_id)).await;
        lifecycle.finish(ExecOutcome::Completed(completion))
    }

    fn complete(&self, task_id: TaskId, status: Option<ExitStatus>) -> Completion {
        let exit_code = status.and_then(|s| s.code());
        let signal = status.and_then(|s| s.signal());
        let real_status = status.map_or(FAILURE_STATUS, |s| status_code(&s));
        let reported_status = match self.config.exit_policy {
            ExitStatusPolicy::Propagate => real_status,
            ExitStatusPolicy::AlwaysZero => 0,
        };
        Completion {
            task_id,
            exit_code,
            signal,
            reported_status,
        }
    }
}

/// Map an exit status to the SSH exit-status value: the exit code, or
/// `128 + signal` when the process was killed.
pub(crate) fn status_code(status: &ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return u32::try_from(code).unwrap_or(FAILURE_STATUS);
    }
    status
        .signal()
        .and_then(|signal| u32::try_from(signal).ok())
        .map_or(FAILURE_STATUS, |signal| 128 + signal)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> io::Result<()> {
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}

/// Kill the subprocess and everything it started.
///
/// The shell leads its own process group, so commands it forked (and that
/// may hold the output pipes) die with it.
fn kill_child(child: &mut Child, task_id: TaskId) {
    info!(task_id = %task_id, "Caller disconnected, killing subprocess group");
    let group = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw);
    if let Some(group) = group {
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => return,
            Err(e) => debug!(task_id = %task_id, error = %e, "Failed to signal process group"),
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(task_id = %task_id, error = %e, "Failed to signal subprocess");
    }
}

async fn wait_child(
    child: &mut Child,
    cancel: &CancellationToken,
    kill_on_disconnect: bool,
    task_id: TaskId,
) -> Option<ExitStatus> {
    let waited = tokio::select! {
        status = child.wait() => status,
        () = cancel.cancelled(), if kill_on_disconnect => {
            kill_child(child, task_id);
            child.wait().await
        }
    };
    match waited {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to wait for subprocess");
            None
        }
    }
}

fn log_relay_outcome(task_id: TaskId, outcome: &RelayOutcome) {
    match &outcome.end {
        StreamEnd::Eof => debug!(
            task_id = %task_id,
            direction = %outcome.direction,
            bytes = outcome.bytes,
            "Stream relay finished"
        ),
        StreamEnd::Failed(e) => debug!(
            task_id = %task_id,
            direction = %outcome.direction,
            bytes = outcome.bytes,
            error = %e,
            "Stream relay stopped on error"
        ),
    }
}

async fn release_forwarding(forwarding: Option<AgentForwarding>, task_id: Option<TaskId>) {
    let Some(forwarding) = forwarding else {
        return;
    };
    let path = forwarding.socket_path().to_path_buf();
    match forwarding.stop().await {
        Ok(()) => info!(task_id = ?task_id.map(TaskId::get), path = %path.display(), "Agent listener closed"),
        Err(e) => warn!(
            task_id = ?task_id.map(TaskId::get),
            path = %path.display(),
            error = %e,
            "Failed to close agent listener"
        ),
    }
}
