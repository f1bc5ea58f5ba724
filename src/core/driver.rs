//! Run strategies: a main loop the adapter owns versus one it piggybacks on.
//!
//! Both strategies share the contract of `run_forever`:
//!
//! - refuse to nest (`LoopError::AlreadyRunning`),
//! - make sure queued callbacks run even when `stop` fires among them,
//! - report an interrupt-driven exit as `LoopError::Interrupted` and clear
//!   the flag so the next run starts clean.
//!
//! The owned driver creates a fresh foreign main-loop object per run and
//! dispatches once before blocking, so a `stop` issued by those callbacks
//! quits the object before it ever waits. The piggyback driver cannot call
//! callbacks before the host's loop runs (a `stop` among them would fire
//! while nothing is running), so it only arms the dispatch watch and lets
//! the host's iteration do the rest.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::backend::{ExternalDriver, MainLoop};
use crate::core::event_loop::LoopInner;
use crate::error::LoopError;

/// Blocking-run strategy for one loop.
pub(crate) trait RunDriver {
    /// Blocks until `request_stop`, then reports how the run ended.
    fn run(&self, inner: &Rc<LoopInner>) -> Result<(), LoopError>;

    /// Makes the current run return; no-op when not running.
    fn request_stop(&self);

    /// Whether a `run` is in progress.
    fn is_running(&self) -> bool;
}

/// Strategy that creates and owns the foreign main-loop object.
pub(crate) struct OwnedDriver {
    main: RefCell<Option<Rc<dyn MainLoop>>>,
}

impl OwnedDriver {
    pub(crate) fn new() -> Self {
        OwnedDriver {
            main: RefCell::new(None),
        }
    }
}

impl RunDriver for OwnedDriver {
    fn run(&self, inner: &Rc<LoopInner>) -> Result<(), LoopError> {
        if self.main.borrow().is_some() {
            return Err(LoopError::AlreadyRunning);
        }

        // The object starts out running, so a quit issued while the first
        // pass below executes flips is_running before we would block.
        let main = inner.backend().main_loop(inner.context());
        *self.main.borrow_mut() = Some(Rc::clone(&main));

        inner.dispatch();
        if main.is_running() {
            main.run();
        }

        *self.main.borrow_mut() = None;
        if inner.take_interrupted() {
            Err(LoopError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn request_stop(&self) {
        let main = self.main.borrow().clone();
        if let Some(main) = main {
            main.quit();
        }
    }

    fn is_running(&self) -> bool {
        self.main.borrow().is_some()
    }
}

/// Strategy that rides a loop someone else runs (a GUI toolkit's own
/// `main`), restricted to the default context.
pub(crate) struct PiggybackDriver {
    external: Rc<dyn ExternalDriver>,
    running: Cell<bool>,
}

impl PiggybackDriver {
    pub(crate) fn new(external: Rc<dyn ExternalDriver>) -> Self {
        PiggybackDriver {
            external,
            running: Cell::new(false),
        }
    }
}

impl RunDriver for PiggybackDriver {
    fn run(&self, inner: &Rc<LoopInner>) -> Result<(), LoopError> {
        if self.running.get() {
            return Err(LoopError::AlreadyRunning);
        }

        // Queued callbacks must wait for the host's iteration; a stop()
        // among them has to land while the host loop is actually running.
        inner.schedule_dispatch();

        self.running.set(true);
        self.external.run();
        self.running.set(false);

        if inner.take_interrupted() {
            Err(LoopError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn request_stop(&self) {
        if self.running.get() {
            self.external.quit();
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }
}
