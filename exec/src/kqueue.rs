//! FreeBSD kqueue backend.

use crate::error::{Error, Result};
use crate::kevent::{EventQueue, EventSpec, Filter, KernelEvent, ProcNotes, Token};
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::trace;

/// A kqueue descriptor.
#[derive(Debug)]
pub struct Kqueue {
    fd: OwnedFd,
}

impl Kqueue {
    /// Open a new kernel event queue.
    pub fn new() -> Result<Self> {
        let fd = Errno::result(unsafe { libc::kqueue() }).map_err(|e| Error::sys("kqueue", e))?;
        Ok(Kqueue {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Submit `changes` and collect ready events without blocking.
    fn kevent(&self, changes: &[KEvent], events: &mut [KEvent]) -> nix::Result<usize> {
        // zero timeout: never block the scheduler
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // KEvent is a transparent wrapper of the C struct
        let ret = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                changes.as_ptr().cast::<libc::kevent>(),
                changes.len() as libc::c_int,
                events.as_mut_ptr().cast::<libc::kevent>(),
                events.len() as libc::c_int,
                &timeout,
            )
        };
        Errno::result(ret).map(|n| n as usize)
    }
}

impl AsRawFd for Kqueue {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl EventQueue for Kqueue {
    fn add(&self, spec: &EventSpec, token: Token) -> Result<()> {
        let change = encode(spec, EventFlag::EV_ADD, token)?;
        trace!(ident = spec.ident, filter = ?spec.filter, token = token.raw(), "kevent add");
        self.kevent(&[change], &mut [])
            .map(drop)
            .map_err(|e| Error::sys("kevent add", e))
    }

    fn delete(&self, spec: &EventSpec) -> Result<()> {
        let change = encode(spec, EventFlag::EV_DELETE, Token::NONE)?;
        trace!(ident = spec.ident, filter = ?spec.filter, "kevent delete");
        self.kevent(&[change], &mut [])
            .map(drop)
            .map_err(|e| Error::sys("kevent delete", e))
    }

    fn poll(&self, max: usize) -> Result<Vec<KernelEvent>> {
        let empty = KEvent::new(
            0,
            EventFilter::EVFILT_PROC,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        let mut events = vec![empty; max];
        let count = self
            .kevent(&[], &mut events)
            .map_err(|e| Error::sys("kevent poll", e))?;

        Ok(events[..count].iter().map(decode).collect())
    }

    fn readiness_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}

fn encode(spec: &EventSpec, flags: EventFlag, token: Token) -> Result<KEvent> {
    let filter = match spec.filter {
        Filter::Proc => EventFilter::EVFILT_PROC,
        Filter::Signal => EventFilter::EVFILT_SIGNAL,
        Filter::Unknown(raw) => {
            return Err(Error::InvalidRequest(format!("cannot register kernel filter {}", raw)))
        }
    };
    Ok(KEvent::new(
        spec.ident,
        filter,
        flags,
        encode_notes(&spec.notes),
        0,
        token.raw() as libc::intptr_t,
    ))
}

fn encode_notes(notes: &ProcNotes) -> FilterFlag {
    let mut fflags = FilterFlag::empty();
    if notes.exit {
        fflags |= FilterFlag::NOTE_EXIT;
    }
    if notes.track {
        fflags |= FilterFlag::NOTE_TRACK;
    }
    fflags
}

fn decode(ev: &KEvent) -> KernelEvent {
    let filter = match ev.filter() {
        Ok(EventFilter::EVFILT_PROC) => Filter::Proc,
        Ok(EventFilter::EVFILT_SIGNAL) => Filter::Signal,
        Ok(other) => Filter::Unknown(other as i16),
        // a filter even nix does not know
        Err(_) => Filter::Unknown(0),
    };

    let notes = if filter == Filter::Proc {
        let fflags = ev.fflags();
        ProcNotes {
            exit: fflags.contains(FilterFlag::NOTE_EXIT),
            track: false,
            child: fflags.contains(FilterFlag::NOTE_CHILD),
            track_err: fflags.contains(FilterFlag::NOTE_TRACKERR),
        }
    } else {
        ProcNotes::default()
    };

    KernelEvent {
        ident: ev.ident(),
        filter,
        notes,
        data: ev.data() as i64,
        token: Token::from_raw(ev.udata() as u64),
    }
}
