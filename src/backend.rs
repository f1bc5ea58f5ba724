//! Seam between the adapter and the foreign main-loop library.
//!
//! The adapter never talks to a concrete C loop directly. Everything it
//! needs is expressed by a handful of object-safe traits that a binding
//! crate implements once:
//!
//! - [`Backend`] — factory for contexts, watch sources, and main loops.
//! - [`Context`] — an iteration domain; watches attach to exactly one.
//! - [`WatchSource`] — a single event source (timer, fd, signal, child).
//! - [`MainLoop`] — a blocking runner the adapter owns outright.
//! - [`ExternalDriver`] — a runner owned by someone else (a GUI toolkit's
//!   `main()`), which the adapter only piggybacks on.
//!
//! ## Rules
//! - All trait objects here are single-threaded; the adapter holds them in
//!   `Rc` and never sends them across threads.
//! - [`WatchSource::destroy`] must be idempotent and must be safe to call
//!   from inside the source's own callback.
//! - A destroyed or `WatchAction::Remove`-d source never fires again.
//! - Firing order across distinct sources in one iteration is the foreign
//!   library's business; the adapter does not rely on it.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared handle to the foreign-library factory.
pub type BackendRef = Rc<dyn Backend>;

/// Shared handle to an iteration context.
pub type ContextRef = Rc<dyn Context>;

/// Callback installed on a [`WatchSource`].
///
/// Invoked by the foreign library whenever the watched condition holds; the
/// return value tells the library whether to keep the source installed.
pub type WatchCallback = Box<dyn FnMut(WatchEvent) -> WatchAction>;

/// Stable identity of a [`Context`].
///
/// Used as a map key by the process-wide interrupt multiplexer, so two
/// `ContextRef`s wrapping the same underlying context must report the same
/// id. Backends mint ids with [`ContextId::next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Returns a process-unique id for a newly created context.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Which readiness condition an fd watch reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdInterest {
    /// Fires when the descriptor is readable (or hung up).
    Read,
    /// Fires when the descriptor is writable.
    Write,
}

/// Payload passed to a [`WatchCallback`] when its source fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Timer expired, fd became ready, or the watched signal arrived.
    Ready,
    /// The watched child exited; `status` is the raw `wait(2)` status word,
    /// undecoded.
    ChildExited {
        /// Raw wait status as the platform reported it.
        status: i32,
    },
}

/// What the foreign library should do with a source after its callback ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchAction {
    /// Keep the source installed and fire it again next time.
    Continue,
    /// Remove the source; it never fires again.
    Remove,
}

/// Factory for everything the adapter borrows from the foreign library.
///
/// Watch creation is infallible by contract except for signals, where the
/// library may refuse a number it cannot trap ([`Backend::signal_watch`]
/// returns `None` in that case).
pub trait Backend {
    /// Returns the process-global default context.
    ///
    /// Repeated calls return handles with the same [`ContextId`].
    fn default_context(&self) -> ContextRef;

    /// Creates a fresh private context.
    fn new_context(&self) -> ContextRef;

    /// Current reading of the library's monotonic clock.
    ///
    /// The origin is unspecified; only differences are meaningful. Typical
    /// granularity is a microsecond.
    fn monotonic_time(&self) -> Duration;

    /// Creates a timer source firing `interval` from now, and every
    /// `interval` after that when `repeat` is set.
    ///
    /// A zero interval means "next iteration".
    fn timer_watch(&self, interval: Duration, repeat: bool) -> Box<dyn WatchSource>;

    /// Creates an fd readiness source for one interest.
    fn fd_watch(&self, fd: RawFd, interest: FdInterest) -> Box<dyn WatchSource>;

    /// Creates a signal source, or `None` when the library refuses the
    /// number (forced kill and forced stop cannot be trapped anywhere).
    fn signal_watch(&self, signum: i32) -> Option<Box<dyn WatchSource>>;

    /// Creates a child-exit source for `pid`.
    ///
    /// Fires at most once, with [`WatchEvent::ChildExited`]. Only
    /// meaningful on the default context.
    fn child_watch(&self, pid: u32) -> Box<dyn WatchSource>;

    /// Creates a main loop iterating `context`.
    ///
    /// The loop starts in the running state, so a `quit()` issued before
    /// [`MainLoop::run`] makes that run return immediately. This mirrors
    /// how the foreign object behaves and the run driver depends on it.
    fn main_loop(&self, context: &ContextRef) -> Rc<dyn MainLoop>;
}

/// One iteration domain of the foreign library.
pub trait Context {
    /// Stable identity, equal across clones of the same context.
    fn id(&self) -> ContextId;

    /// Whether this is the process-global default context.
    fn is_default(&self) -> bool;
}

/// A single installed event source.
///
/// The adapter drives a fixed install sequence: `set_callback`, then
/// `attach`, then eventually `destroy` (or `WatchAction::Remove` from the
/// callback). Implementations may assume that order.
pub trait WatchSource {
    /// Installs the callback fired by the foreign library.
    fn set_callback(&mut self, callback: WatchCallback);

    /// Attaches the source to a context; it may fire from the next
    /// iteration on.
    fn attach(&mut self, context: &ContextRef);

    /// Detaches and disables the source.
    ///
    /// Idempotent, and callable from inside the source's own callback.
    fn destroy(&mut self);
}

/// Blocking runner owned by the adapter.
pub trait MainLoop {
    /// Iterates the context until [`MainLoop::quit`] is called.
    ///
    /// Returns immediately when `quit` already ran.
    fn run(&self);

    /// Makes the current (or next) `run` return.
    fn quit(&self);

    /// Whether a `quit` has not yet been issued.
    fn is_running(&self) -> bool;
}

/// External runner the adapter does not own.
///
/// `run` and `quit` map onto whatever the hosting toolkit exposes; the
/// adapter calls them at most once per `run_forever`.
pub trait ExternalDriver {
    /// Runs the host's own blocking loop until `quit`.
    fn run(&self);

    /// Makes the host's loop return.
    fn quit(&self);
}
