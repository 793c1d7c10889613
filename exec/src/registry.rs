//! Event source registry.
//!
//! Maps the token attached to a kernel registration back to the factory that
//! turns the kernel's report into scheduler work. The registry holds a strong
//! reference to every bound factory, so a factory lives at least as long as
//! any registration that names it.

use crate::error::Result;
use crate::kevent::{EventSpec, Filter, KernelEvent, Token};
use crate::scheduler::Task;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Turns one raw kernel event into deferred application work.
pub trait EventFactory {
    fn create_task(&self, event: &KernelEvent) -> Result<Task>;
}

/// Token to factory bindings.
pub struct EventRegistry {
    next: Cell<u64>,
    factories: RefCell<HashMap<Token, Rc<dyn EventFactory>>>,
    bindings: RefCell<HashMap<(usize, Filter), Token>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            next: Cell::new(1),
            factories: RefCell::new(HashMap::new()),
            bindings: RefCell::new(HashMap::new()),
        }
    }

    /// Token for `factory`, allocating one on first use.
    pub fn bind(&self, factory: &Rc<dyn EventFactory>) -> Token {
        let existing = self
            .factories
            .borrow()
            .iter()
            .find(|(_, bound)| same_factory(bound, factory))
            .map(|(token, _)| *token);

        if let Some(token) = existing {
            return token;
        }

        let token = Token::from_raw(self.next.get());
        self.next.set(self.next.get() + 1);
        self.factories.borrow_mut().insert(token, Rc::clone(factory));
        debug!(token = token.raw(), "Bound event factory");
        token
    }

    /// Remember that `spec` was registered with `token`.
    pub fn record(&self, spec: &EventSpec, token: Token) {
        self.bindings.borrow_mut().insert(spec.key(), token);
    }

    /// Forget the registration for `spec`.
    pub fn forget(&self, spec: &EventSpec) -> Option<Token> {
        self.bindings.borrow_mut().remove(&spec.key())
    }

    /// Factory bound to `token`.
    pub fn lookup(&self, token: Token) -> Option<Rc<dyn EventFactory>> {
        self.factories.borrow().get(&token).cloned()
    }

    /// Whether any recorded registration still uses `token`.
    pub fn in_use(&self, token: Token) -> bool {
        self.bindings.borrow().values().any(|t| *t == token)
    }

    /// Drop the factory bound to `token` along with its recorded registrations.
    pub fn release(&self, token: Token) -> Option<Rc<dyn EventFactory>> {
        self.bindings.borrow_mut().retain(|_, t| *t != token);
        let released = self.factories.borrow_mut().remove(&token);
        if released.is_some() {
            debug!(token = token.raw(), "Released event factory");
        }
        released
    }

    /// Number of bound factories.
    pub fn len(&self) -> usize {
        self.factories.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn same_factory(a: &Rc<dyn EventFactory>, b: &Rc<dyn EventFactory>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    struct Noop;

    impl EventFactory for Noop {
        fn create_task(&self, _event: &KernelEvent) -> Result<Task> {
            Ok(Box::new(|| Ok(())))
        }
    }

    #[test]
    fn test_factory_reused_across_registrations() {
        let registry = EventRegistry::new();
        let factory: Rc<dyn EventFactory> = Rc::new(Noop);

        let first = registry.bind(&factory);
        let second = registry.bind(&factory);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);

        registry.record(&EventSpec::signal(Signal::SIGINT), first);
        registry.record(&EventSpec::signal(Signal::SIGTERM), first);
        assert!(registry.in_use(first));

        registry.forget(&EventSpec::signal(Signal::SIGINT));
        assert!(registry.in_use(first));
    }

    #[test]
    fn test_distinct_factories_get_distinct_tokens() {
        let registry = EventRegistry::new();
        let a: Rc<dyn EventFactory> = Rc::new(Noop);
        let b: Rc<dyn EventFactory> = Rc::new(Noop);
        assert_ne!(registry.bind(&a), registry.bind(&b));
        assert!(!registry.bind(&a).is_none());
    }

    #[test]
    fn test_release_drops_factory() {
        let registry = EventRegistry::new();
        let factory: Rc<dyn EventFactory> = Rc::new(Noop);
        let token = registry.bind(&factory);
        registry.record(&EventSpec::signal(Signal::SIGHUP), token);
        assert_eq!(Rc::strong_count(&factory), 2);

        assert!(registry.release(token).is_some());
        assert!(registry.lookup(token).is_none());
        assert!(!registry.in_use(token));
        assert_eq!(Rc::strong_count(&factory), 1);
    }
}
