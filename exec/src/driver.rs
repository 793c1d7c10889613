//! tokio integration.
//!
//! Drives a [`Supervisor`] from a single-threaded runtime: readability of
//! the kernel queue descriptor sets the multiplexer's ready flag, and each
//! wakeup runs one dispatch turn. The supervisor is not `Send`, so the
//! future must run on a current-thread runtime or a `LocalSet`.

use crate::error::Result;
use crate::supervisor::Supervisor;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::trace;

/// Poll interval for queues that have no descriptor.
const MANUAL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Borrowed queue descriptor; closing stays with the queue.
struct QueueFd(RawFd);

impl AsRawFd for QueueFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Dispatch `supervisor` until `done` returns true.
pub async fn drive<F>(supervisor: &Supervisor, mut done: F) -> Result<()>
where
    F: FnMut(&Supervisor) -> bool,
{
    let readiness = supervisor
        .readiness_fd()
        .map(|fd| AsyncFd::with_interest(QueueFd(fd), Interest::READABLE))
        .transpose()?;

    loop {
        supervisor.dispatch()?;
        if done(supervisor) {
            return Ok(());
        }
        if supervisor.needs_dispatch() {
            tokio::task::yield_now().await;
            continue;
        }

        match &readiness {
            Some(fd) => {
                let mut guard = fd.readable().await?;
                guard.clear_ready();
                supervisor.mark_ready();
                trace!("Kernel queue readable");
            }
            None => tokio::time::sleep(MANUAL_POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::exec::ExecRequest;
    use crate::kevent::ManualQueue;
    use crate::process::ExitStatus;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test(flavor = "current_thread")]
    async fn test_drive_until_group_exits() {
        let queue = ManualQueue::new();
        let supervisor =
            Supervisor::with_queue(SupervisorConfig::default(), Box::new(queue.clone())).unwrap();

        let exited = Rc::new(Cell::new(None));
        let seen = Rc::clone(&exited);
        let handle = supervisor
            .launch(ExecRequest::new(["/bin/sh", "-c", "exit 4"]).on_complete(|_| {}, move |status| seen.set(Some(status))))
            .unwrap();

        queue.deliver_exit(handle.pid(), ExitStatus::from_code(4)).unwrap();
        drive(&supervisor, |s| s.group_count() == 0).await.unwrap();

        assert_eq!(exited.get().and_then(|s| s.code()), Some(4));
    }
}
