//! Tracing/logging initialization.
//!
//! Diagnostics always go to standard error; standard output of the daemon is
//! never used for protocol traffic but is kept clean for supervisors anyway.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a log level, covering the daemon
/// crate and this core crate (e.g. `"sshexec_daemon=info,sshexec_core=info"`).
pub fn default_filter(level: &str) -> String {
    format!("sshexec_daemon={level},sshexec_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set.
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        assert_eq!(
            default_filter("debug"),
            "sshexec_daemon=debug,sshexec_core=debug"
        );
    }
}
