//! Kernel event multiplexer.
//!
//! Owns the kernel event queue. A lower-level notifier (a poll loop or the
//! tokio driver) marks the queue ready; `poll_and_dispatch` then drains a
//! bounded batch and queues one task per event on the scheduler.

use crate::error::{Error, Result};
use crate::kevent::{EventQueue, EventSpec, Filter, Token};
use crate::registry::{EventFactory, EventRegistry};
use crate::scheduler::Scheduler;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, warn};

/// Kernel event multiplexer.
pub struct Multiplexer {
    queue: Box<dyn EventQueue>,
    registry: EventRegistry,
    ready: Cell<bool>,
    max_events: usize,
}

impl Multiplexer {
    pub fn new(queue: Box<dyn EventQueue>, max_events: usize) -> Self {
        Self {
            queue,
            registry: EventRegistry::new(),
            ready: Cell::new(false),
            max_events: max_events.max(1),
        }
    }

    /// Register `spec` with the kernel, bound to `factory`.
    pub fn register(&self, spec: &EventSpec, factory: &Rc<dyn EventFactory>) -> Result<Token> {
        let token = self.registry.bind(factory);
        if let Err(e) = self.queue.add(spec, token) {
            if !self.registry.in_use(token) {
                self.registry.release(token);
            }
            return Err(e);
        }

        self.registry.record(spec, token);
        debug!(ident = spec.ident, filter = ?spec.filter, token = token.raw(), "Registered kernel event");
        Ok(token)
    }

    /// Remove the kernel registration for `spec`.
    pub fn unregister(&self, spec: &EventSpec) -> Result<()> {
        self.queue.delete(spec)?;
        self.registry.forget(spec);
        debug!(ident = spec.ident, filter = ?spec.filter, "Unregistered kernel event");
        Ok(())
    }

    /// Drop the factory bound to `token`; later events carrying it are ignored.
    pub fn release(&self, token: Token) {
        self.registry.release(token);
    }

    /// Number of factories still bound.
    pub fn bound_factories(&self) -> usize {
        self.registry.len()
    }

    /// Descriptor to watch for readiness.
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.queue.readiness_fd()
    }

    /// Record that the queue has events pending.
    pub fn mark_ready(&self) {
        self.ready.set(true);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Drain up to one batch of kernel events into `scheduler`.
    ///
    /// Returns the number of events drained. A full batch leaves the queue
    /// marked ready so the next turn keeps draining.
    pub fn poll_and_dispatch(&self, scheduler: &Scheduler) -> Result<usize> {
        if !self.ready.replace(false) {
            return Ok(0);
        }

        let events = self.queue.poll(self.max_events)?;
        for event in &events {
            if let Filter::Unknown(raw) = event.filter {
                return Err(Error::invariant(format!(
                    "unexpected kernel filter {} for ident {}",
                    raw, event.ident
                )));
            }

            if event.token.is_none() {
                return Err(Error::invariant(format!(
                    "kernel event for ident {} carries no user data",
                    event.ident
                )));
            }

            let Some(factory) = self.registry.lookup(event.token) else {
                warn!(ident = event.ident, token = event.token.raw(), "Dropping event for released factory");
                continue;
            };

            scheduler.enqueue(factory.create_task(event)?);
        }

        if events.len() == self.max_events {
            self.ready.set(true);
        }

        Ok(events.len())
    }
}
