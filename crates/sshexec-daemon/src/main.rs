//! sshexec Daemon
//!
//! Accepts SSH connections and runs each exec request as
//! `<shell> -c <command>`, relaying stdio and forwarding the client's agent.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::{error, info};

use sshexec_core::tracing_init::{default_filter, init_tracing};
use sshexec_daemon::agent::RelayNaming;
use sshexec_daemon::pipeline::{ExitStatusPolicy, Executor, PipelineConfig};
use sshexec_daemon::server::{DEFAULT_PORT, ServerConfig, SshServer, load_or_generate};
use sshexec_daemon::task::TaskRegistry;

#[derive(Parser, Debug)]
#[command(name = "sshexec-daemon")]
#[command(version, about = "sshexec daemon - runs SSH exec requests as shell subprocesses")]
struct Args {
    /// TCP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SSHEXEC_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "SSHEXEC_BIND")]
    bind: IpAddr,

    /// Shell used to run commands, by name (looked up in PATH) or path
    #[arg(long, env = "SSHEXEC_SHELL")]
    shell: Option<String>,

    /// OpenSSH private key presented as the host key.
    /// An ephemeral Ed25519 key is generated when unset.
    #[arg(long, env = "SSHEXEC_HOST_KEY")]
    host_key: Option<PathBuf>,

    /// Exit status reported for commands that ran.
    #[arg(
        long,
        default_value = "propagate",
        env = "SSHEXEC_EXIT_STATUS",
        value_parser = ["propagate", "always-zero"]
    )]
    exit_status: String,

    /// Kill the subprocess when the client disconnects before it exits
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "SSHEXEC_KILL_ON_DISCONNECT")]
    kill_on_disconnect: bool,

    /// Prefix of per-session agent socket directories
    #[arg(long, default_value = "agent", env = "SSHEXEC_AGENT_DIR_PREFIX")]
    agent_dir_prefix: String,

    /// File name of the agent socket inside its directory
    #[arg(long, default_value = "agent", env = "SSHEXEC_AGENT_SOCKET_NAME")]
    agent_socket_name: String,

    /// Directory agent socket directories are created in (system temp dir by default)
    #[arg(long, env = "SSHEXEC_AGENT_TEMP_ROOT")]
    agent_temp_root: Option<PathBuf>,

    /// Seconds of inactivity before a connection is dropped (0 disables)
    #[arg(long, default_value_t = 0, env = "SSHEXEC_INACTIVITY_TIMEOUT")]
    inactivity_timeout: u64,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "SSHEXEC_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SSHEXEC_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(&default_filter(&args.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        bind = %args.bind,
        "Starting sshexec-daemon"
    );

    // Fail before binding so a broken host never accepts connections.
    let shell = sshexec_core::resolve_shell(args.shell.as_deref())
        .context("No usable shell found")?;
    info!(shell = %shell.display(), "Resolved shell");

    let host_key = load_or_generate(args.host_key.as_deref())?;

    let exit_policy = match args.exit_status.as_str() {
        "always-zero" => ExitStatusPolicy::AlwaysZero,
        _ => ExitStatusPolicy::Propagate,
    };

    let mut relay_naming = RelayNaming::default()
        .with_dir_prefix(args.agent_dir_prefix)
        .with_socket_name(args.agent_socket_name);
    if let Some(root) = args.agent_temp_root {
        relay_naming = relay_naming.with_temp_root(root);
    }

    let pipeline = PipelineConfig::new(shell)
        .with_exit_policy(exit_policy)
        .with_kill_on_disconnect(args.kill_on_disconnect)
        .with_relay_naming(relay_naming);
    let executor = Arc::new(Executor::new(pipeline, Arc::new(TaskRegistry::new())));

    let config = ServerConfig::new(args.port)
        .with_bind_addr(args.bind)
        .with_inactivity_timeout(Duration::from_secs(args.inactivity_timeout));
    let server = SshServer::new(config, executor, host_key);
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to start listener");
            return Err(e.into());
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Unset $NOTIFY_SOCKET so subprocesses cannot notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!(error = %e, "Listener failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    info!("Daemon stopped");
    Ok(())
}
