//! Process status and reaping helpers.
//!
//! Exit statuses are kept in their raw wait(2) encoding; callers decide
//! whether a process exited normally or was killed.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Raw wait status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Wrap a raw wait status.
    pub fn from_raw(raw: i32) -> Self {
        ExitStatus(raw)
    }

    /// Status of a process that exited normally with `code`.
    pub fn from_code(code: i32) -> Self {
        ExitStatus((code & 0xff) << 8)
    }

    /// The raw wait status.
    pub fn raw(&self) -> i32 {
        self.0
    }

    /// Exit code (if exited normally).
    pub fn code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.0) {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// Terminating signal (if killed by a signal).
    pub fn signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }

    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code(), self.signal()) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            _ => write!(f, "wait status {:#x}", self.0),
        }
    }
}

/// Block until `pid` exits and return its raw status.
pub fn wait_blocking(pid: Pid) -> Result<ExitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        match Errno::result(ret) {
            Ok(_) => return Ok(ExitStatus::from_raw(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::sys("waitpid", e)),
        }
    }
}

/// Reap a process the kernel already reported as exited.
///
/// Returns `None` when the process was already reaped elsewhere.
pub fn reap(pid: Pid) -> Result<Option<ExitStatus>> {
    match wait_blocking(pid) {
        Ok(status) => {
            debug!(pid = pid.as_raw(), status = %status, "Reaped process");
            Ok(Some(status))
        }
        Err(Error::Sys {
            source: Errno::ECHILD,
            ..
        }) => {
            debug!(pid = pid.as_raw(), "Process already reaped");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Send `sig` to every pid, skipping processes that already vanished.
///
/// Returns the number of processes signalled.
pub fn signal_pids<'a>(pids: impl IntoIterator<Item = &'a Pid>, sig: Signal) -> Result<usize> {
    let mut sent = 0;
    for pid in pids {
        match signal::kill(*pid, sig) {
            Ok(()) => sent += 1,
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "Process gone before signal delivery");
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), signal = ?sig, error = %e, "Failed to signal process");
                return Err(Error::sys("kill", e));
            }
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_decoding() {
        let status = ExitStatus::from_code(0);
        assert!(status.success());
        assert_eq!(status.code(), Some(0));
        assert_eq!(status.signal(), None);

        let status = ExitStatus::from_code(3);
        assert!(!status.success());
        assert_eq!(status.code(), Some(3));
        assert_eq!(status.to_string(), "exit code 3");
    }

    #[test]
    fn test_signal_decoding() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(status.code(), None);
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(!status.success());
    }

    #[test]
    fn test_reap_unknown_child_is_none() {
        // pid 1 is never our child
        let result = reap(Pid::from_raw(1)).unwrap();
        assert_eq!(result, None);
    }
}
