//! Supervisor facade.
//!
//! [`Context`] holds the state every component shares and is handed to each
//! component explicitly. [`Supervisor`] wires the components together and
//! exposes one dispatch entry point for the host event loop.

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::exec::{ExecRequest, LaunchHandle, Launcher};
use crate::kevent::EventQueue;
use crate::monitor::{GroupHandle, GroupSnapshot, ProcessGroupMonitor, Reaper, WaitReaper};
use crate::mux::Multiplexer;
use crate::process;
use crate::scheduler::Scheduler;
use crate::signals::{SignalNotification, SignalRelay};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest single sleep of [`Supervisor::run_until`] when the queue has no descriptor.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// State shared by every component of one supervisor.
pub struct Context {
    pub(crate) config: SupervisorConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) mux: Multiplexer,
    pub(crate) monitor: RefCell<ProcessGroupMonitor>,
}

/// Launches processes and supervises their process groups.
pub struct Supervisor {
    ctx: Rc<Context>,
    launcher: Launcher,
    relay: SignalRelay,
}

impl Supervisor {
    /// Supervisor on the platform's kernel event queue.
    #[cfg(target_os = "freebsd")]
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let queue = crate::kqueue::Kqueue::new()?;
        Self::with_queue(config, Box::new(queue))
    }

    /// Supervisor on the platform's kernel event queue.
    #[cfg(not(target_os = "freebsd"))]
    pub fn new(_config: SupervisorConfig) -> Result<Self> {
        Err(Error::Unsupported)
    }

    /// Supervisor on an explicit event queue.
    pub fn with_queue(config: SupervisorConfig, queue: Box<dyn EventQueue>) -> Result<Self> {
        Self::with_parts(config, queue, Box::new(WaitReaper))
    }

    /// Supervisor on an explicit event queue and reaper.
    pub fn with_parts(
        config: SupervisorConfig,
        queue: Box<dyn EventQueue>,
        reaper: Box<dyn Reaper>,
    ) -> Result<Self> {
        config.validate()?;
        let mux = Multiplexer::new(queue, config.max_events_per_poll);
        let ctx = Rc::new(Context {
            config,
            scheduler: Scheduler::new(),
            mux,
            monitor: RefCell::new(ProcessGroupMonitor::new(reaper)),
        });

        Ok(Supervisor {
            launcher: Launcher::new(Rc::clone(&ctx)),
            relay: SignalRelay::new(&ctx),
            ctx,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.ctx.config
    }

    /// Launch a process.
    pub fn launch(&self, request: ExecRequest) -> Result<LaunchHandle> {
        self.launcher.launch(request)
    }

    /// Relay the configured signals to `callback`.
    pub fn watch_signals<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&SignalNotification) -> Result<()> + 'static,
    {
        let signals = self.ctx.config.signals()?;
        self.relay.watch(&signals, callback)
    }

    /// Relay an explicit set of signals to `callback`.
    pub fn watch(&self, signals: &[Signal], callback: impl Fn(&SignalNotification) -> Result<()> + 'static) -> Result<()> {
        self.relay.watch(signals, callback)
    }

    /// Stop relaying `sig`.
    pub fn unwatch_signal(&self, sig: Signal) -> Result<()> {
        self.relay.unwatch(sig)
    }

    /// Active pids of one group.
    pub fn active_pids(&self, group: GroupHandle) -> Result<BTreeSet<Pid>> {
        self.ctx.monitor.borrow().active_pids(group)
    }

    /// Active pids of every group.
    pub fn all_active_pids(&self) -> BTreeSet<Pid> {
        self.snapshot()
            .into_iter()
            .flat_map(|group| group.active_pids)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.ctx.monitor.borrow().snapshot()
    }

    /// Send `sig` to every active process of `group`.
    pub fn signal_group(&self, group: GroupHandle, sig: Signal) -> Result<usize> {
        let pids = self.active_pids(group)?;
        let sent = process::signal_pids(&pids, sig)?;
        debug!(group = %group, signal = ?sig, sent, "Signalled process group");
        Ok(sent)
    }

    /// Number of tracked groups, including completed ones awaiting cleanup.
    pub fn group_count(&self) -> usize {
        self.ctx.monitor.borrow().len()
    }

    /// Whether `group` is still tracked.
    pub fn is_tracked(&self, group: GroupHandle) -> bool {
        self.ctx.monitor.borrow().get(group).is_some()
    }

    /// Run one turn: drain a batch of kernel events, run the resulting
    /// tasks, then the idle stage once no task is left.
    ///
    /// Returns the number of kernel events drained. An invariant violation
    /// ends the turn with an error.
    pub fn dispatch(&self) -> Result<usize> {
        if self.ctx.mux.readiness_fd().is_none() {
            self.ctx.mux.mark_ready();
        }

        let drained = self.ctx.mux.poll_and_dispatch(&self.ctx.scheduler)?;
        let ran = self.ctx.scheduler.run_pending()?;
        let idled = if self.ctx.scheduler.pending() == 0 {
            self.ctx.scheduler.run_idle()?
        } else {
            0
        };

        if drained + ran + idled > 0 {
            trace!(drained, ran, idled, "Dispatched");
        }
        Ok(drained)
    }

    /// Record that the kernel queue became readable.
    pub fn mark_ready(&self) {
        self.ctx.mux.mark_ready();
    }

    /// Whether another call to [`Supervisor::dispatch`] has work to do
    /// without waiting on the kernel.
    pub fn needs_dispatch(&self) -> bool {
        self.ctx.mux.is_ready()
            || self.ctx.scheduler.pending() > 0
            || self.ctx.scheduler.idle_pending() > 0
    }

    /// Descriptor of the kernel queue, if it has one.
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.ctx.mux.readiness_fd()
    }

    /// Block up to `timeout` for the kernel queue to become readable.
    ///
    /// Returns true and marks the queue ready when events are pending. A
    /// queue without a descriptor is always considered ready.
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let Some(fd) = self.readiness_fd() else {
            return Ok(true);
        };

        // the multiplexer owns the descriptor for as long as we do
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match poll(&mut fds, millis) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => {
                self.mark_ready();
                Ok(true)
            }
            Err(e) => Err(Error::sys("poll", e)),
        }
    }

    /// Dispatch until `done` holds or `timeout` elapses.
    ///
    /// Returns whether `done` held.
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> Result<bool>
    where
        F: FnMut(&Supervisor) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.dispatch()?;
            if done(self) {
                return Ok(true);
            }
            if self.needs_dispatch() {
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self.readiness_fd().is_some() {
                self.wait_ready(remaining)?;
            } else {
                std::thread::sleep(remaining.min(IDLE_SLEEP));
            }
        }
    }

    /// Drain the non-fatal errors raised by tasks so far.
    pub fn take_background_errors(&self) -> Vec<Error> {
        self.ctx.scheduler.take_background_errors()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}
