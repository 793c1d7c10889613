//! Process launcher.
//!
//! A launch moves through `Preparing -> Forked -> {ChildExecuting |
//! ParentMonitoring} -> Completed`. Everything that can fail without a
//! process existing (argv validation, program lookup, control pipe creation)
//! happens before fork.

use crate::child::{self, ChildPlan, PlanInputs, PreExecHook};
use crate::control::{ControlChannel, ControlPipe};
use crate::error::{Error, Result};
use crate::kevent::{EventSpec, Filter, KernelEvent, Token};
use crate::monitor::GroupHandle;
use crate::process::{self, ExitStatus};
use crate::registry::EventFactory;
use crate::scheduler::Task;
use crate::supervisor::Context;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::{ForkResult, Pid};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// One of the three standard streams of the launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    /// Parse a logical stream name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "stdin" => Ok(StdStream::Stdin),
            "stdout" => Ok(StdStream::Stdout),
            "stderr" => Ok(StdStream::Stderr),
            other => Err(Error::InvalidRequest(format!("unknown stream name: {}", other))),
        }
    }

    /// Descriptor number the stream is duplicated onto.
    pub fn target_fd(&self) -> RawFd {
        match self {
            StdStream::Stdin => libc::STDIN_FILENO,
            StdStream::Stdout => libc::STDOUT_FILENO,
            StdStream::Stderr => libc::STDERR_FILENO,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdStream::Stdin => write!(f, "stdin"),
            StdStream::Stdout => write!(f, "stdout"),
            StdStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Source descriptors for fd 0, 1 and 2 of the launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirects {
    fds: [RawFd; 3],
}

impl Default for Redirects {
    fn default() -> Self {
        Redirects { fds: [0, 1, 2] }
    }
}

impl Redirects {
    /// Build from `name -> fd` pairs; unnamed streams keep the supervisor's own.
    pub fn from_names<'a>(pairs: impl IntoIterator<Item = (&'a str, RawFd)>) -> Result<Self> {
        let mut redirects = Redirects::default();
        for (name, fd) in pairs {
            redirects.set(StdStream::from_name(name)?, fd);
        }
        Ok(redirects)
    }

    pub fn set(&mut self, stream: StdStream, fd: RawFd) {
        self.fds[stream.target_fd() as usize] = fd;
    }

    pub fn get(&self, stream: StdStream) -> RawFd {
        self.fds[stream.target_fd() as usize]
    }

    pub fn as_array(&self) -> [RawFd; 3] {
        self.fds
    }

    /// Check every source is an open descriptor.
    fn validate(&self) -> Result<()> {
        for (stream, fd) in [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr]
            .into_iter()
            .zip(self.fds)
        {
            if fcntl(fd, FcntlArg::F_GETFD).is_err() {
                return Err(Error::InvalidRequest(format!(
                    "{} source descriptor {} is not open",
                    stream, fd
                )));
            }
        }
        Ok(())
    }
}

/// Called with the control channel once an async launch is monitored.
pub type StartCallback = Box<dyn FnOnce(ControlChannel)>;

/// Called once the whole process group has exited, with the root's status.
pub type ExitCallback = Box<dyn FnOnce(ExitStatus)>;

/// How the caller waits for the launched process.
pub enum ExecMode {
    /// Block until the root process exits
    Sync,
    /// Return immediately; callbacks report start and group completion
    Async {
        on_start: StartCallback,
        on_exit: ExitCallback,
    },
}

impl fmt::Debug for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Sync => write!(f, "Sync"),
            ExecMode::Async { .. } => write!(f, "Async"),
        }
    }
}

/// What to launch and how.
pub struct ExecRequest {
    argv: Vec<String>,
    redirects: Redirects,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    pre_exec: Option<PreExecHook>,
    mode: ExecMode,
}

impl ExecRequest {
    /// A synchronous launch of `argv` with the supervisor's own stdio.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecRequest {
            argv: argv.into_iter().map(Into::into).collect(),
            redirects: Redirects::default(),
            env: Vec::new(),
            current_dir: None,
            pre_exec: None,
            mode: ExecMode::Sync,
        }
    }

    pub fn stdin(mut self, fd: RawFd) -> Self {
        self.redirects.set(StdStream::Stdin, fd);
        self
    }

    pub fn stdout(mut self, fd: RawFd) -> Self {
        self.redirects.set(StdStream::Stdout, fd);
        self
    }

    pub fn stderr(mut self, fd: RawFd) -> Self {
        self.redirects.set(StdStream::Stderr, fd);
        self
    }

    /// Redirect a stream named `stdin`, `stdout` or `stderr`.
    pub fn redirect(mut self, name: &str, fd: RawFd) -> Result<Self> {
        self.redirects.set(StdStream::from_name(name)?, fd);
        Ok(self)
    }

    pub fn redirects(mut self, redirects: Redirects) -> Self {
        self.redirects = redirects;
        self
    }

    /// Add or override an environment variable of the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Change into `dir` before exec.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Run `hook` in the child right before exec, e.g. to enter a jail.
    pub fn pre_exec<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> std::io::Result<()> + 'static,
    {
        self.pre_exec = Some(Box::new(hook));
        self
    }

    /// Launch asynchronously and report through the given callbacks.
    pub fn on_complete<S, E>(mut self, on_start: S, on_exit: E) -> Self
    where
        S: FnOnce(ControlChannel) + 'static,
        E: FnOnce(ExitStatus) + 'static,
    {
        self.mode = ExecMode::Async {
            on_start: Box::new(on_start),
            on_exit: Box::new(on_exit),
        };
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn mode(&self) -> &ExecMode {
        &self.mode
    }
}

/// Result of a launch.
#[derive(Debug)]
pub enum LaunchHandle {
    /// Synchronous launch; the root has exited
    Exited {
        pid: Pid,
        status: ExitStatus,
        channel: ControlChannel,
    },
    /// Asynchronous launch; the group is being monitored
    Monitoring { pid: Pid, group: GroupHandle },
}

impl LaunchHandle {
    pub fn pid(&self) -> Pid {
        match self {
            LaunchHandle::Exited { pid, .. } | LaunchHandle::Monitoring { pid, .. } => *pid,
        }
    }

    pub fn group(&self) -> Option<GroupHandle> {
        match self {
            LaunchHandle::Monitoring { group, .. } => Some(*group),
            LaunchHandle::Exited { .. } => None,
        }
    }

    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            LaunchHandle::Exited { status, .. } => Some(*status),
            LaunchHandle::Monitoring { .. } => None,
        }
    }
}

/// Forks and execs launch requests, handing async launches to the monitor.
pub struct Launcher {
    ctx: Rc<Context>,
}

impl Launcher {
    pub fn new(ctx: Rc<Context>) -> Self {
        Launcher { ctx }
    }

    /// Launch `request`.
    pub fn launch(&self, request: ExecRequest) -> Result<LaunchHandle> {
        let ExecRequest {
            argv,
            redirects,
            env,
            current_dir,
            mut pre_exec,
            mode,
        } = request;

        redirects.validate()?;
        let mut pipe = ControlPipe::new()?;
        let ctrl_fd = pipe
            .child_fd()
            .ok_or_else(|| Error::invariant("new control pipe has no child end"))?;

        let reset_signals: Vec<libc::c_int> = self
            .ctx
            .config
            .signals()?
            .into_iter()
            .map(|sig| sig as libc::c_int)
            .collect();
        let plan = ChildPlan::build(PlanInputs {
            argv: &argv,
            env: &env,
            ctrl_env: Some((self.ctx.config.ctrl_fd_env.as_str(), ctrl_fd)),
            redirects: redirects.as_array(),
            current_dir: current_dir.as_deref(),
            reset_signals: &reset_signals,
            failure_code: self.ctx.config.exec_failure_code,
        })?;

        debug!(argv = ?argv, mode = ?mode, tty = ?plan.tty(), "Launching process");

        // The child only touches the pre-built plan.
        let pid = match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Child) => child::run_child(&plan, &mut pipe, pre_exec.as_mut()),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => return Err(Error::sys("fork", e)),
        };

        info!(pid = pid.as_raw(), program = ?plan.program(), "Forked process");
        let channel = pipe.init_parent()?;

        match mode {
            ExecMode::Sync => {
                let status = process::wait_blocking(pid)?;
                info!(pid = pid.as_raw(), status = %status, "Process exited");
                Ok(LaunchHandle::Exited {
                    pid,
                    status,
                    channel,
                })
            }
            ExecMode::Async { on_start, on_exit } => {
                let group = self.monitor(pid, on_exit)?;
                on_start(channel);
                Ok(LaunchHandle::Monitoring { pid, group })
            }
        }
    }

    /// Track `pid` and subscribe to its exit and its descendants.
    fn monitor(&self, pid: Pid, on_exit: ExitCallback) -> Result<GroupHandle> {
        let group = match self.ctx.monitor.borrow_mut().track(pid) {
            Ok(group) => group,
            Err(e) => {
                abandon(pid);
                return Err(e);
            }
        };

        let factory = Rc::new(ProcessGroupEventFactory {
            ctx: Rc::downgrade(&self.ctx),
            group,
            on_exit: Rc::new(RefCell::new(Some(on_exit))),
            token: Cell::new(Token::NONE),
        });
        let bound: Rc<dyn EventFactory> = factory.clone();

        match self.ctx.mux.register(&EventSpec::process(pid, true), &bound) {
            Ok(token) => {
                factory.token.set(token);
                Ok(group)
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "Failed to monitor process");
                self.ctx.monitor.borrow_mut().remove(group);
                abandon(pid);
                Err(e)
            }
        }
    }
}

/// Kill and reap a child that cannot be monitored.
fn abandon(pid: Pid) {
    match signal::kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid.as_raw(), error = %e, "Failed to kill unmonitored process"),
    }
    if let Err(e) = process::wait_blocking(pid) {
        warn!(pid = pid.as_raw(), error = %e, "Failed to reap unmonitored process");
    }
}

/// Turns process events of one group into monitor updates.
struct ProcessGroupEventFactory {
    ctx: Weak<Context>,
    group: GroupHandle,
    on_exit: Rc<RefCell<Option<ExitCallback>>>,
    token: Cell<Token>,
}

impl EventFactory for ProcessGroupEventFactory {
    fn create_task(&self, event: &KernelEvent) -> Result<Task> {
        if event.filter != Filter::Proc {
            return Err(Error::invariant(format!(
                "process group {} received a {:?} event",
                self.group, event.filter
            )));
        }

        let ctx = self.ctx.clone();
        let group = self.group;
        let on_exit = Rc::clone(&self.on_exit);
        let token = self.token.get();
        let event = *event;
        Ok(Box::new(move || {
            handle_process_event(ctx, group, token, on_exit, event)
        }))
    }
}

fn handle_process_event(
    ctx: Weak<Context>,
    group: GroupHandle,
    token: Token,
    on_exit: Rc<RefCell<Option<ExitCallback>>>,
    event: KernelEvent,
) -> Result<()> {
    let Some(ctx) = ctx.upgrade() else {
        return Ok(());
    };
    let pid = event.pid();

    if event.notes.track_err {
        ctx.monitor.borrow_mut().note_tracking_error(group)?;
        ctx.scheduler
            .report_background(Error::TrackingFailed(pid.as_raw()));
    }

    let fully_exited = {
        let mut monitor = ctx.monitor.borrow_mut();
        if event.notes.child {
            monitor.on_descendant_spawned(group, pid)?;
        }
        if event.notes.exit {
            monitor.on_exit(group, pid, ExitStatus::from_raw(event.data as i32))?
        } else {
            false
        }
    };

    if !fully_exited {
        return Ok(());
    }

    let status = ctx
        .monitor
        .borrow()
        .get(group)
        .and_then(|g| g.root_exit_status())
        .ok_or_else(|| Error::invariant(format!("group {} completed without a root status", group)))?;

    // Cleanup runs on an idle turn, after the dispatch that got us here.
    let weak = Rc::downgrade(&ctx);
    ctx.scheduler.when_idle(Box::new(move || {
        if let Some(ctx) = weak.upgrade() {
            ctx.monitor.borrow_mut().remove(group);
            ctx.mux.release(token);
            debug!(group = %group, "Cleaned up process group");
        }
        Ok(())
    }));

    let callback = on_exit.borrow_mut().take();
    match callback {
        Some(callback) => {
            callback(status);
            Ok(())
        }
        None => Err(Error::invariant(format!(
            "completion of group {} reported twice",
            group
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_stream_names() {
        assert_eq!(StdStream::from_name("stdout").unwrap(), StdStream::Stdout);
        assert_matches!(StdStream::from_name("stdwhat"), Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_redirects_from_names() {
        let redirects = Redirects::from_names([("stderr", 1), ("stdin", 5)]).unwrap();
        assert_eq!(redirects.as_array(), [5, 1, 1]);
        assert_eq!(redirects.get(StdStream::Stdout), 1);
        assert_matches!(
            Redirects::from_names([("console", 3)]),
            Err(Error::InvalidRequest(_))
        );
    }

    #[test]
    fn test_closed_source_descriptor_rejected() {
        let redirects = Redirects::default();
        assert!(redirects.validate().is_ok());

        let mut redirects = Redirects::default();
        redirects.set(StdStream::Stdout, -1);
        assert_matches!(redirects.validate(), Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_request_builder() {
        let request = ExecRequest::new(["/bin/sh", "-c", "exit 0"])
            .stderr(1)
            .env("A", "1")
            .current_dir("/tmp")
            .redirect("stdin", 0)
            .unwrap();
        assert_eq!(request.argv(), ["/bin/sh", "-c", "exit 0"]);
        assert_eq!(request.redirects.as_array(), [0, 1, 1]);
        assert_matches!(request.mode(), ExecMode::Sync);

        let request = request.on_complete(|_| {}, |_| {});
        assert_matches!(request.mode(), ExecMode::Async { .. });
    }
}
