//! The child side of a launch.
//!
//! Everything the child needs is prepared in a [`ChildPlan`] before fork.
//! After fork the child only makes async-signal-safe calls: no allocation,
//! no locks, and no return into caller code.

use crate::control::ControlPipe;
use crate::error::{Error, Result};
use crate::terminal;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Fallback search path when neither the request nor the supervisor has one.
const DEFAULT_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Upper bound of the descriptor sweep where the kernel has no close-from call.
const MAX_CLOSE_FD: RawFd = 65536;

/// Runs in the child after fd redirection and before exec.
pub type PreExecHook = Box<dyn FnMut() -> std::io::Result<()>>;

/// A failed step in the child, carried without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildError {
    pub op: &'static str,
    pub errno: Errno,
}

impl ChildError {
    pub fn new(op: &'static str, errno: Errno) -> Self {
        ChildError { op, errno }
    }

    /// Write `vessel: <op>: <description>` to stderr.
    fn report(&self) {
        let mut buf = [0u8; 256];
        let mut len = 0;
        for part in [b"vessel: " as &[u8], self.op.as_bytes(), b": ", self.errno.desc().as_bytes(), b"\n"] {
            let n = part.len().min(buf.len() - len);
            buf[len..len + n].copy_from_slice(&part[..n]);
            len += n;
        }
        unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len) };
    }
}

/// Everything the child branch needs, built before fork.
#[derive(Debug)]
pub struct ChildPlan {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    redirects: [RawFd; 3],
    tty: Option<RawFd>,
    current_dir: Option<CString>,
    reset_signals: Vec<libc::c_int>,
    max_fd: RawFd,
    failure_code: i32,
}

/// Inputs of [`ChildPlan::build`].
pub struct PlanInputs<'a> {
    pub argv: &'a [String],
    pub env: &'a [(String, String)],
    pub ctrl_env: Option<(&'a str, RawFd)>,
    pub redirects: [RawFd; 3],
    pub current_dir: Option<&'a Path>,
    pub reset_signals: &'a [libc::c_int],
    pub failure_code: i32,
}

impl ChildPlan {
    /// Resolve the program and lay out argv and envp as NUL-terminated arrays.
    pub fn build(inputs: PlanInputs<'_>) -> Result<Self> {
        let Some(first) = inputs.argv.first() else {
            return Err(Error::InvalidRequest("argv is empty".to_string()));
        };

        let mut env: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        for (key, value) in inputs.env {
            if key.is_empty() || key.contains('=') {
                return Err(Error::InvalidRequest(format!("invalid environment name {:?}", key)));
            }
            env.insert(OsString::from(key), OsString::from(value));
        }
        if let Some((var, fd)) = inputs.ctrl_env {
            env.insert(OsString::from(var), OsString::from(fd.to_string()));
        }

        let program = resolve_program(first, env.get(OsStr::new("PATH")), inputs.current_dir)?;
        let program = c_string(program.as_os_str().as_bytes(), "program")?;

        let argv = inputs
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(&entry, "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;

        let current_dir = inputs
            .current_dir
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        let stdin = inputs.redirects[0];
        let tty = (stdin != libc::STDIN_FILENO && terminal::is_terminal(stdin)).then_some(stdin);

        let max_fd = match unistd::sysconf(unistd::SysconfVar::OPEN_MAX) {
            Ok(Some(open_max)) if open_max > 0 => open_max.min(MAX_CLOSE_FD as libc::c_long) as RawFd,
            _ => 1024,
        };

        Ok(ChildPlan {
            program,
            argv_ptrs: null_terminated(&argv),
            _argv: argv,
            envp_ptrs: null_terminated(&envp),
            _envp: envp,
            redirects: inputs.redirects,
            tty,
            current_dir,
            reset_signals: inputs.reset_signals.to_vec(),
            max_fd,
            failure_code: inputs.failure_code,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }

    /// Stdin terminal the child becomes session leader of, if any.
    pub fn tty(&self) -> Option<RawFd> {
        self.tty
    }

    pub fn argv_ptrs(&self) -> &[*const libc::c_char] {
        &self.argv_ptrs
    }

    pub fn envp_ptrs(&self) -> &[*const libc::c_char] {
        &self.envp_ptrs
    }
}

/// Run the child branch. Never returns.
pub fn run_child(plan: &ChildPlan, pipe: &mut ControlPipe, hook: Option<&mut PreExecHook>) -> ! {
    if let Err(e) = exec_child(plan, pipe, hook) {
        e.report();
    }
    unsafe { libc::_exit(plan.failure_code) }
}

fn exec_child(
    plan: &ChildPlan,
    pipe: &mut ControlPipe,
    hook: Option<&mut PreExecHook>,
) -> std::result::Result<Infallible, ChildError> {
    let ctrl_fd = pipe
        .init_child()
        .map_err(|_| ChildError::new("control pipe", Errno::EBADF))?;

    for sig in &plan.reset_signals {
        unsafe { libc::signal(*sig, libc::SIG_DFL) };
    }

    if let Some(tty) = plan.tty {
        terminal::become_session_leader(tty)?;
    }

    redirect_fds(&plan.redirects)?;

    if let Some(dir) = &plan.current_dir {
        unistd::chdir(dir.as_c_str()).map_err(|e| ChildError::new("chdir", e))?;
    }

    if let Some(hook) = hook {
        hook().map_err(|e| {
            ChildError::new("pre-exec hook", e.raw_os_error().map_or(Errno::EINVAL, Errno::from_i32))
        })?;
    }

    close_descriptors(ctrl_fd, plan.max_fd);

    unsafe { libc::execve(plan.program.as_ptr(), plan.argv_ptrs.as_ptr(), plan.envp_ptrs.as_ptr()) };
    Err(ChildError::new("execve", Errno::last()))
}

/// Duplicate each source onto fd 0, 1 and 2.
pub fn redirect_fds(redirects: &[RawFd; 3]) -> std::result::Result<(), ChildError> {
    redirect_onto(redirects, &[0, 1, 2])
}

/// Duplicate `sources[i]` onto `targets[i]`, in order.
///
/// A source that is itself an earlier target is first moved to a spare
/// descriptor, so swapped streams keep their original files.
fn redirect_onto(sources: &[RawFd; 3], targets: &[RawFd; 3]) -> std::result::Result<(), ChildError> {
    let mut sources = *sources;
    for i in 0..sources.len() {
        let src = sources[i];
        let clobbered = (0..targets.len())
            .any(|j| j != i && targets[j] == src && sources[j] != targets[j]);
        if src != targets[i] && clobbered {
            sources[i] = fcntl(src, FcntlArg::F_DUPFD_CLOEXEC(3))
                .map_err(|e| ChildError::new("fcntl F_DUPFD_CLOEXEC", e))?;
        }
    }

    for (src, target) in sources.iter().zip(targets) {
        redirect_fd(*src, *target)?;
    }
    Ok(())
}

/// Duplicate `src` onto `target`; a no-op when they are the same descriptor.
pub fn redirect_fd(src: RawFd, target: RawFd) -> std::result::Result<(), ChildError> {
    if src == target {
        return Ok(());
    }
    loop {
        match unistd::dup2(src, target) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ChildError::new("dup2", e)),
        }
    }
}

/// Close every descriptor above stdio except `keep`.
fn close_descriptors(keep: RawFd, fallback_max: RawFd) {
    if keep < 3 {
        close_from(3, fallback_max);
        return;
    }
    for fd in 3..keep {
        let _ = unistd::close(fd);
    }
    close_from(keep + 1, fallback_max);
}

/// Close every descriptor numbered `first` or higher.
#[cfg(target_os = "freebsd")]
fn close_from(first: RawFd, _fallback_max: RawFd) {
    unsafe { libc::closefrom(first) };
}

#[cfg(target_os = "linux")]
fn close_from(first: RawFd, fallback_max: RawFd) {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        )
    };
    if ret != 0 {
        // kernels older than 5.9
        close_each(first, fallback_max);
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "linux")))]
fn close_from(first: RawFd, fallback_max: RawFd) {
    close_each(first, fallback_max);
}

#[cfg(not(target_os = "freebsd"))]
fn close_each(first: RawFd, max: RawFd) {
    for fd in first..max {
        let _ = unistd::close(fd);
    }
}

fn resolve_program(program: &str, path: Option<&OsString>, cwd: Option<&Path>) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }

    let search = path.cloned().unwrap_or_else(|| OsString::from(DEFAULT_PATH));
    let cwd = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    which::which_in(program, Some(search), cwd)
        .map_err(|_| Error::InvalidRequest(format!("command not found: {}", program)))
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::InvalidRequest(format!("{} contains a NUL byte", what)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}
