//! Host signal relay.
//!
//! Watched signals are ignored at the OS level and delivered through the
//! kernel event queue instead. Each delivery becomes one task that hands the
//! application a snapshot of every tracked process group. The relay never
//! signals or terminates anything itself.

use crate::error::{Error, Result};
use crate::kevent::{EventSpec, Filter, KernelEvent, Token};
use crate::monitor::GroupSnapshot;
use crate::registry::EventFactory;
use crate::scheduler::Task;
use crate::supervisor::Context;
use nix::sys::signal::{self, SigHandler, Signal};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info};

/// Receives relayed signals.
pub type SignalCallback = Rc<dyn Fn(&SignalNotification) -> Result<()>>;

/// A relayed signal with the groups active at delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalNotification {
    pub signal: Signal,
    pub groups: Vec<GroupSnapshot>,
}

impl SignalNotification {
    /// Short lowercase name, `int` for `SIGINT`.
    pub fn name(&self) -> String {
        signal_name(self.signal)
    }
}

impl Serialize for SignalNotification {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SignalNotification", 2)?;
        state.serialize_field("signal", &self.name())?;
        state.serialize_field("groups", &self.groups)?;
        state.end()
    }
}

/// Short lowercase name of `sig`.
pub fn signal_name(sig: Signal) -> String {
    let name = sig.as_str();
    name.strip_prefix("SIG").unwrap_or(name).to_lowercase()
}

/// Relays host signals to one application callback.
pub struct SignalRelay {
    ctx: Weak<Context>,
    callback: Rc<RefCell<Option<SignalCallback>>>,
    factory: Rc<dyn EventFactory>,
    watched: RefCell<Vec<Signal>>,
    token: RefCell<Option<Token>>,
}

impl SignalRelay {
    pub fn new(ctx: &Rc<Context>) -> Self {
        let callback = Rc::new(RefCell::new(None));
        let factory: Rc<dyn EventFactory> = Rc::new(SignalEventFactory {
            ctx: Rc::downgrade(ctx),
            callback: Rc::clone(&callback),
        });
        SignalRelay {
            ctx: Rc::downgrade(ctx),
            callback,
            factory,
            watched: RefCell::new(Vec::new()),
            token: RefCell::new(None),
        }
    }

    /// Relay `signals` to `callback`, replacing any earlier callback.
    pub fn watch<F>(&self, signals: &[Signal], callback: F) -> Result<()>
    where
        F: Fn(&SignalNotification) -> Result<()> + 'static,
    {
        let ctx = self.context()?;
        *self.callback.borrow_mut() = Some(Rc::new(callback));

        for sig in signals {
            unsafe { signal::signal(*sig, SigHandler::SigIgn) }
                .map_err(|e| Error::sys("signal", e))?;
            let token = ctx.mux.register(&EventSpec::signal(*sig), &self.factory)?;
            *self.token.borrow_mut() = Some(token);

            let mut watched = self.watched.borrow_mut();
            if !watched.contains(sig) {
                watched.push(*sig);
            }
            info!(signal = %signal_name(*sig), "Relaying signal");
        }
        Ok(())
    }

    /// Stop relaying `sig` and restore its default disposition.
    pub fn unwatch(&self, sig: Signal) -> Result<()> {
        let ctx = self.context()?;
        if !self.watched.borrow().contains(&sig) {
            return Err(Error::InvalidRequest(format!(
                "signal {} is not relayed",
                signal_name(sig)
            )));
        }

        ctx.mux.unregister(&EventSpec::signal(sig))?;
        unsafe { signal::signal(sig, SigHandler::SigDfl) }.map_err(|e| Error::sys("signal", e))?;

        let mut watched = self.watched.borrow_mut();
        watched.retain(|s| *s != sig);
        if watched.is_empty() {
            if let Some(token) = self.token.borrow_mut().take() {
                ctx.mux.release(token);
            }
        }
        debug!(signal = %signal_name(sig), "Stopped relaying signal");
        Ok(())
    }

    /// Signals currently relayed.
    pub fn watched(&self) -> Vec<Signal> {
        self.watched.borrow().clone()
    }

    fn context(&self) -> Result<Rc<Context>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| Error::invariant("signal relay outlived its supervisor"))
    }
}

struct SignalEventFactory {
    ctx: Weak<Context>,
    callback: Rc<RefCell<Option<SignalCallback>>>,
}

impl EventFactory for SignalEventFactory {
    fn create_task(&self, event: &KernelEvent) -> Result<Task> {
        if event.filter != Filter::Signal {
            return Err(Error::invariant(format!(
                "signal relay received a {:?} event",
                event.filter
            )));
        }

        let signal = event.as_signal()?;
        let ctx = self.ctx.clone();
        let callback = Rc::clone(&self.callback);
        Ok(Box::new(move || {
            let Some(ctx) = ctx.upgrade() else {
                return Ok(());
            };
            let callback = callback
                .borrow()
                .clone()
                .ok_or_else(|| Error::invariant("signal delivered with no relay callback"))?;

            let notification = SignalNotification {
                signal,
                groups: ctx.monitor.borrow().snapshot(),
            };
            debug!(signal = %notification.name(), groups = notification.groups.len(), "Relaying signal");
            callback(&notification)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(Signal::SIGINT), "int");
        assert_eq!(signal_name(Signal::SIGTERM), "term");
        assert_eq!(signal_name(Signal::SIGHUP), "hup");
    }

    #[test]
    fn test_notification_serializes_name() {
        let notification = SignalNotification {
            signal: Signal::SIGTERM,
            groups: Vec::new(),
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["signal"], "term");
        assert_eq!(json["groups"], serde_json::json!([]));
    }
}
