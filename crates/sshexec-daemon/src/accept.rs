//! Classification of listener accept failures, shared by the SSH listener
//! and the agent relay sockets.

use std::io;
use std::time::Duration;

/// Pause before retrying after a transient accept failure.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept errors that concern a single connection or a momentary resource
/// shortage rather than the listener itself.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn connection_level_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[test]
    fn descriptor_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::ENFILE)));
    }

    #[test]
    fn listener_errors_are_fatal() {
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
