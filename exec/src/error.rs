//! Error types for the vessel supervisory core.

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while launching and monitoring processes.
#[derive(Error, Debug)]
pub enum Error {
    /// A system call failed
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    /// The exec request was malformed
    #[error("Invalid exec request: {0}")]
    InvalidRequest(String),

    /// Internal bookkeeping was corrupted; never recoverable
    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    /// Process group not tracked
    #[error("Process group not found: root PID {0}")]
    GroupNotFound(i32),

    /// The kernel could not attach tracking to a descendant
    #[error("Failed to track a child process of PID {0}")]
    TrackingFailed(i32),

    /// Control channel error
    #[error("Control channel error: {0}")]
    ControlChannel(String),

    /// No kernel event queue on this platform
    #[error("Kernel event queue is not supported on this platform")]
    Unsupported,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Error {
    /// Wrap a failed system call.
    pub fn sys(op: &'static str, source: nix::Error) -> Self {
        Error::Sys { op, source }
    }

    /// Wrap the current `errno` for a failed system call.
    pub fn last_os(op: &'static str) -> Self {
        Error::Sys {
            op,
            source: Errno::last(),
        }
    }

    /// Build an invariant violation.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    /// The OS error code carried by a syscall failure.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Sys { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Whether this error is a programming error that must end the dispatch cycle.
    pub fn is_invariant(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_error_carries_errno_and_op() {
        let err = Error::sys("fork", Errno::EAGAIN);
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
        assert!(err.to_string().starts_with("fork failed"));
        assert!(!err.is_invariant());
    }

    #[test]
    fn test_invariant_classification() {
        let err = Error::invariant("pid 12 not in descendants");
        assert!(err.is_invariant());
        assert_eq!(err.errno(), None);
    }
}
