//! Cooperative single-threaded scheduler.
//!
//! Tasks run to completion one at a time in FIFO order. Idle tasks run only
//! once the regular queue is empty, which lets event handlers defer mutations
//! of state that the dispatch loop is still walking.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use tracing::{error, trace};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() -> Result<()>>;

/// Single-threaded task queue with an idle stage.
#[derive(Default)]
pub struct Scheduler {
    /// Tasks ready to run
    queue: RefCell<VecDeque<Task>>,
    /// Tasks waiting for an idle turn
    idle: RefCell<VecDeque<Task>>,
    /// Non-fatal errors raised by tasks
    background: RefCell<Vec<Error>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task at the tail.
    pub fn enqueue(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }

    /// Queue a task for the next idle turn.
    pub fn when_idle(&self, task: Task) {
        self.idle.borrow_mut().push_back(task);
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Number of tasks waiting for an idle turn.
    pub fn idle_pending(&self) -> usize {
        self.idle.borrow().len()
    }

    /// Run queued tasks until the queue is empty.
    ///
    /// Tasks queued while running are run in the same call. An invariant
    /// violation stops the cycle and is returned; any other task error is
    /// recorded as a background error.
    pub fn run_pending(&self) -> Result<usize> {
        let mut ran = 0;
        loop {
            let task = self.queue.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            ran += 1;
            self.settle(task())?;
        }
        trace!(ran, "Ran queued tasks");
        Ok(ran)
    }

    /// Run the idle tasks that were queued before this call.
    pub fn run_idle(&self) -> Result<usize> {
        let batch: Vec<Task> = self.idle.borrow_mut().drain(..).collect();
        let mut ran = 0;
        let mut tasks = batch.into_iter();
        while let Some(task) = tasks.next() {
            ran += 1;
            if let Err(e) = self.settle(task()) {
                // keep the rest for the next idle turn
                let mut idle = self.idle.borrow_mut();
                for (i, rest) in tasks.by_ref().enumerate() {
                    idle.insert(i, rest);
                }
                return Err(e);
            }
        }
        Ok(ran)
    }

    /// Record a non-fatal error.
    pub fn report_background(&self, err: Error) {
        error!(error = %err, "Background error");
        self.background.borrow_mut().push(err);
    }

    /// Drain the recorded background errors.
    pub fn take_background_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.background.borrow_mut())
    }

    fn settle(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_invariant() => Err(e),
            Err(e) => {
                self.report_background(e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::rc::Rc;

    fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let sched = Scheduler::new();
        let log = recorder();
        for name in ["a", "b", "c"] {
            let log = Rc::clone(&log);
            sched.enqueue(Box::new(move || {
                log.borrow_mut().push(name);
                Ok(())
            }));
        }

        assert_eq!(sched.run_pending().unwrap(), 3);
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_idle_tasks_wait_for_idle_turn() {
        let sched = Rc::new(Scheduler::new());
        let log = recorder();

        {
            let log = Rc::clone(&log);
            let inner = Rc::clone(&sched);
            sched.enqueue(Box::new(move || {
                log.borrow_mut().push("event");
                let idle_log = Rc::clone(&log);
                inner.when_idle(Box::new(move || {
                    idle_log.borrow_mut().push("cleanup");
                    Ok(())
                }));
                Ok(())
            }));
        }

        sched.run_pending().unwrap();
        assert_eq!(*log.borrow(), vec!["event"]);
        assert_eq!(sched.idle_pending(), 1);

        sched.run_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["event", "cleanup"]);
    }

    #[test]
    fn test_invariant_error_stops_cycle() {
        let sched = Scheduler::new();
        let log = recorder();
        sched.enqueue(Box::new(|| Err(Error::invariant("corrupt"))));
        {
            let log = Rc::clone(&log);
            sched.enqueue(Box::new(move || {
                log.borrow_mut().push("after");
                Ok(())
            }));
        }

        assert_matches!(sched.run_pending(), Err(Error::Invariant(_)));
        assert!(log.borrow().is_empty());
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_other_errors_become_background() {
        let sched = Scheduler::new();
        sched.enqueue(Box::new(|| Err(Error::TrackingFailed(42))));
        sched.enqueue(Box::new(|| Ok(())));

        assert_eq!(sched.run_pending().unwrap(), 2);
        let errors = sched.take_background_errors();
        assert_eq!(errors.len(), 1);
        assert_matches!(errors[0], Error::TrackingFailed(42));
        assert!(sched.take_background_errors().is_empty());
    }
}
