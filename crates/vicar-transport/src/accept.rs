//! Accept-loop error classification

use std::io;
use std::time::Duration;

/// Pause after a transient accept error before retrying
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(all(unix, not(target_os = "linux")))]
const ENOBUFS: i32 = 55;

/// Whether an `accept()` error should be retried instead of ending the loop
///
/// Errors about the pending connection itself and descriptor or buffer
/// exhaustion are transient; anything else means the listener is unusable.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }

    err.raw_os_error().is_some_and(is_resource_exhaustion)
}

#[cfg(unix)]
fn is_resource_exhaustion(code: i32) -> bool {
    // ENOMEM, ENFILE, EMFILE
    matches!(code, 12 | 23 | 24) || code == ENOBUFS
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_code: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(23)));
    }
}
