use std::fmt::Debug;
use std::io::{Error, ErrorKind, Result};

/// Check an error return value for timeouts.
///
/// Both transport readers run with a receive timeout so they can notice a
/// shutdown request, and the OS reports an expired timeout as an error.
/// This trait adds a `should_retry` method to `Error` and `Result` to tell
/// that case apart from a real failure.
pub trait ShouldRetry {
    /// Check for timeout
    ///
    /// If `true`, the error is probably due to a timeout.
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for Error {
    fn should_retry(&self) -> bool {
        match self.kind() {
            // EAGAIN, EINPROGRESS and EWOULDBLOCK are the three possible codes
            // returned when a timeout occurs. the stdlib already maps EAGAIN
            // and EWOULDBLOCK to WouldBlock
            ErrorKind::WouldBlock | ErrorKind::TimedOut => true,
            // however, EINPROGRESS is also valid
            ErrorKind::Other => {
                if let Some(i) = self.raw_os_error() {
                    i == nix::errno::Errno::EINPROGRESS as i32
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

impl<E: Debug> ShouldRetry for Result<E> {
    fn should_retry(&self) -> bool {
        if let &Err(ref e) = self {
            e.should_retry()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_retry_real_failures_do_not() {
        assert!(Error::from(ErrorKind::WouldBlock).should_retry());
        assert!(Error::from(ErrorKind::TimedOut).should_retry());
        assert!(!Error::from(ErrorKind::ConnectionReset).should_retry());
        assert!(!Error::from(ErrorKind::UnexpectedEof).should_retry());
    }
}
