//! Kernel event model shared by every queue backend.
//!
//! Registrations carry a [`Token`] instead of a pointer; the multiplexer maps
//! tokens back to the factory that owns the registration.

use crate::error::{Error, Result};
use crate::process::ExitStatus;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Opaque user data attached to a kernel registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Token of an event that carried no user data.
    pub const NONE: Token = Token(0);

    pub fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Kernel event filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Process lifecycle
    Proc,
    /// Signal delivery
    Signal,
    /// A filter this crate never registers
    Unknown(i16),
}

/// Process notes requested by, or reported on, a `Filter::Proc` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcNotes {
    /// The process exited; `data` holds the wait status
    pub exit: bool,
    /// Follow forks and register descendants automatically
    pub track: bool,
    /// A tracked descendant appeared; `data` holds the parent pid
    pub child: bool,
    /// The kernel failed to attach tracking to a descendant
    pub track_err: bool,
}

impl ProcNotes {
    /// Notes for exit and descendant tracking.
    pub fn exit_and_track() -> Self {
        ProcNotes {
            exit: true,
            track: true,
            ..Default::default()
        }
    }
}

/// A registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSpec {
    pub ident: usize,
    pub filter: Filter,
    pub notes: ProcNotes,
}

impl EventSpec {
    /// Watch a process for exit, optionally following its forks.
    pub fn process(pid: Pid, track: bool) -> Self {
        EventSpec {
            ident: pid.as_raw() as usize,
            filter: Filter::Proc,
            notes: ProcNotes {
                exit: true,
                track,
                ..Default::default()
            },
        }
    }

    /// Watch for delivery of a signal.
    pub fn signal(sig: Signal) -> Self {
        EventSpec {
            ident: sig as i32 as usize,
            filter: Filter::Signal,
            notes: ProcNotes::default(),
        }
    }

    /// Identity of the registration inside a queue.
    pub fn key(&self) -> (usize, Filter) {
        (self.ident, self.filter)
    }
}

/// An event drained from a kernel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEvent {
    pub ident: usize,
    pub filter: Filter,
    pub notes: ProcNotes,
    pub data: i64,
    pub token: Token,
}

impl KernelEvent {
    /// Process exit report.
    pub fn exit(pid: Pid, status: ExitStatus, token: Token) -> Self {
        KernelEvent {
            ident: pid.as_raw() as usize,
            filter: Filter::Proc,
            notes: ProcNotes {
                exit: true,
                ..Default::default()
            },
            data: status.raw() as i64,
            token,
        }
    }

    /// Descendant spawn report.
    pub fn child(child: Pid, parent: Pid, token: Token) -> Self {
        KernelEvent {
            ident: child.as_raw() as usize,
            filter: Filter::Proc,
            notes: ProcNotes {
                child: true,
                ..Default::default()
            },
            data: parent.as_raw() as i64,
            token,
        }
    }

    /// Failed descendant tracking report.
    pub fn track_error(parent: Pid, token: Token) -> Self {
        KernelEvent {
            ident: parent.as_raw() as usize,
            filter: Filter::Proc,
            notes: ProcNotes {
                track_err: true,
                ..Default::default()
            },
            data: 0,
            token,
        }
    }

    /// Signal delivery report; `data` counts deliveries since the last report.
    pub fn signal(sig: Signal, count: i64, token: Token) -> Self {
        KernelEvent {
            ident: sig as i32 as usize,
            filter: Filter::Signal,
            notes: ProcNotes::default(),
            data: count,
            token,
        }
    }

    /// The process this event reports on.
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.ident as i32)
    }

    /// The signal this event reports on.
    pub fn as_signal(&self) -> Result<Signal> {
        Signal::try_from(self.ident as i32)
            .map_err(|_| Error::invariant(format!("signal event for unknown signal {}", self.ident)))
    }
}

/// A kernel event queue backend.
pub trait EventQueue {
    /// Add or replace a registration.
    fn add(&self, spec: &EventSpec, token: Token) -> Result<()>;

    /// Remove a registration.
    fn delete(&self, spec: &EventSpec) -> Result<()>;

    /// Drain up to `max` ready events without blocking.
    fn poll(&self, max: usize) -> Result<Vec<KernelEvent>>;

    /// Descriptor that becomes readable when events are pending.
    ///
    /// `None` means the queue has no descriptor and must be polled every turn.
    fn readiness_fd(&self) -> Option<RawFd>;
}

#[derive(Default)]
struct ManualState {
    registrations: RefCell<HashMap<(usize, Filter), (Token, ProcNotes)>>,
    pending: RefCell<VecDeque<KernelEvent>>,
    fail_next_add: Cell<Option<Errno>>,
    fail_next_poll: Cell<Option<Errno>>,
}

/// An event queue fed by the caller.
///
/// Used to replay recorded kernel activity and on platforms without kqueue.
/// Process registrations follow kqueue semantics: exit reports are one-shot
/// and tracked registrations are inherited by reported descendants.
#[derive(Clone, Default)]
pub struct ManualQueue {
    state: Rc<ManualState>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw event.
    pub fn push(&self, event: KernelEvent) {
        self.state.pending.borrow_mut().push_back(event);
    }

    /// Number of events waiting to be drained.
    pub fn pending(&self) -> usize {
        self.state.pending.borrow().len()
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        self.state.registrations.borrow().len()
    }

    /// Token registered for `spec`, if any.
    pub fn token_for(&self, spec: &EventSpec) -> Option<Token> {
        self.state
            .registrations
            .borrow()
            .get(&spec.key())
            .map(|(token, _)| *token)
    }

    /// Make the next `add` fail with `errno`.
    pub fn fail_next_add(&self, errno: Errno) {
        self.state.fail_next_add.set(Some(errno));
    }

    /// Make the next `poll` fail with `errno`.
    pub fn fail_next_poll(&self, errno: Errno) {
        self.state.fail_next_poll.set(Some(errno));
    }

    /// Report that tracked process `parent` forked `child`.
    pub fn deliver_child(&self, parent: Pid, child: Pid) -> Result<Token> {
        let (token, notes) = self.lookup(parent.as_raw() as usize, Filter::Proc)?;
        if !notes.track {
            return Err(Error::sys("kevent", Errno::EINVAL));
        }

        self.state
            .registrations
            .borrow_mut()
            .insert((child.as_raw() as usize, Filter::Proc), (token, notes));
        self.push(KernelEvent::child(child, parent, token));
        Ok(token)
    }

    /// Report that watched process `pid` exited.
    pub fn deliver_exit(&self, pid: Pid, status: ExitStatus) -> Result<Token> {
        let (token, _) = self.lookup(pid.as_raw() as usize, Filter::Proc)?;
        self.state
            .registrations
            .borrow_mut()
            .remove(&(pid.as_raw() as usize, Filter::Proc));
        self.push(KernelEvent::exit(pid, status, token));
        Ok(token)
    }

    /// Report delivery of a watched signal.
    pub fn deliver_signal(&self, sig: Signal) -> Result<Token> {
        let (token, _) = self.lookup(sig as i32 as usize, Filter::Signal)?;
        self.push(KernelEvent::signal(sig, 1, token));
        Ok(token)
    }

    fn lookup(&self, ident: usize, filter: Filter) -> Result<(Token, ProcNotes)> {
        self.state
            .registrations
            .borrow()
            .get(&(ident, filter))
            .copied()
            .ok_or_else(|| Error::sys("kevent", Errno::ENOENT))
    }
}

impl EventQueue for ManualQueue {
    fn add(&self, spec: &EventSpec, token: Token) -> Result<()> {
        if let Some(errno) = self.state.fail_next_add.take() {
            return Err(Error::sys("kevent add", errno));
        }
        self.state
            .registrations
            .borrow_mut()
            .insert(spec.key(), (token, spec.notes));
        Ok(())
    }

    fn delete(&self, spec: &EventSpec) -> Result<()> {
        self.state
            .registrations
            .borrow_mut()
            .remove(&spec.key())
            .map(|_| ())
            .ok_or_else(|| Error::sys("kevent delete", Errno::ENOENT))
    }

    fn poll(&self, max: usize) -> Result<Vec<KernelEvent>> {
        if let Some(errno) = self.state.fail_next_poll.take() {
            return Err(Error::sys("kevent poll", errno));
        }
        let mut pending = self.state.pending.borrow_mut();
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    fn readiness_fd(&self) -> Option<RawFd> {
        None
    }
}
