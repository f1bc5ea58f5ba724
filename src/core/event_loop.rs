//! # Foreign main-loop adapter core.
//!
//! Bridges a callback-driven foreign loop (contexts, watch sources, a
//! blocking runner) into handle-based scheduling with deterministic
//! dispatch passes.
//!
//! ## Architecture
//!
//! ```text
//!   call_soon / timers / fd / signal / child        LoopRemote (any thread)
//!                  │                                        │
//!                  ▼                                        ▼
//!            [ready queue] ◄── trampoline ◄── inbox drain (pipe watch)
//!                  │
//!                  ▼
//!             dispatch pass  ── runs the N callbacks queued at entry;
//!                  │            later arrivals wait for the next pass
//!                  ▼
//!            wakeup watch    ── zero-interval repeating timer, armed
//!                               while the queue is non-empty, destroyed
//!                               when a pass drains it
//! ```
//!
//! ## Rules
//! - Callbacks run only inside a dispatch pass, on the loop's thread.
//!   A pass takes a count snapshot at entry; work queued during the pass
//!   runs in the next one, after the foreign library polled again.
//! - Per-key registrations (fd, signal, child) replace: registering over
//!   a live entry cancels it first.
//! - One loop per run: `run_forever` refuses nesting.
//! - The interrupt flag is only ever set from a queued callback, so an
//!   interrupt cannot preempt user code mid-callback.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd;

use crate::backend::{BackendRef, ContextRef, ExternalDriver, FdInterest, WatchAction};
use crate::core::driver::{OwnedDriver, PiggybackDriver, RunDriver};
use crate::core::interrupt;
use crate::core::remote::{Inbox, LoopRemote, Message};
use crate::error::LoopError;
use crate::handle::{ChildCodeCell, Handle, RegistrationSlot};
use crate::task::TaskEntry;

fn next_loop_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct LoopInner {
    id: u64,
    // Filled by `Rc::new_cyclic`; lets &self methods hand out weak refs
    // for the closures they install on foreign sources.
    weak_self: Weak<LoopInner>,
    backend: BackendRef,
    context: ContextRef,
    driver: Box<dyn RunDriver>,

    ready: RefCell<VecDeque<Handle>>,
    dispatching: Cell<bool>,
    wakeup: RefCell<Option<Box<dyn crate::backend::WatchSource>>>,

    handles: RefCell<HashMap<u64, Handle>>,
    next_handle: Cell<u64>,

    readers: RefCell<HashMap<RawFd, Handle>>,
    writers: RefCell<HashMap<RawFd, Handle>>,
    signal_handlers: RefCell<HashMap<i32, Handle>>,
    child_handlers: RefCell<HashMap<u32, Handle>>,

    interrupted: Cell<bool>,
    closed: Cell<bool>,

    inbox: Arc<Inbox>,
    inbox_pipe: OwnedFd,

    pub(crate) tasks: RefCell<HashMap<u64, TaskEntry>>,
    next_task: Cell<u64>,
}

/// Event loop bridging the foreign main loop into callback scheduling.
///
/// Single-threaded by construction: the loop and everything it hands out
/// except [`LoopRemote`] stay on the thread that created it. Cloning is
/// cheap and shares the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop iterating a fresh private context.
    pub fn new(backend: BackendRef) -> Result<Self, LoopError> {
        let context = backend.new_context();
        Self::build(backend, context, Box::new(OwnedDriver::new()))
    }

    /// Creates a loop iterating the given context.
    ///
    /// On the default context the loop also hooks into the process-wide
    /// interrupt watch, so Ctrl-C ends `run_forever` with
    /// [`LoopError::Interrupted`].
    pub fn with_context(backend: BackendRef, context: ContextRef) -> Result<Self, LoopError> {
        Self::build(backend, context, Box::new(OwnedDriver::new()))
    }

    /// Creates a loop that piggybacks on an externally owned runner.
    ///
    /// The host toolkit drives the default context; `run_forever` maps to
    /// the host's run and `stop` to its quit. Callbacks queued before the
    /// run start executing once the host loop iterates.
    pub fn external(
        backend: BackendRef,
        driver: Rc<dyn ExternalDriver>,
    ) -> Result<Self, LoopError> {
        let context = backend.default_context();
        Self::build(backend, context, Box::new(PiggybackDriver::new(driver)))
    }

    fn build(
        backend: BackendRef,
        context: ContextRef,
        driver: Box<dyn RunDriver>,
    ) -> Result<Self, LoopError> {
        let (inbox, inbox_pipe) = Inbox::new()?;
        let inner = Rc::new_cyclic(|weak| LoopInner {
            id: next_loop_id(),
            weak_self: weak.clone(),
            backend,
            context,
            driver,
            ready: RefCell::new(VecDeque::new()),
            dispatching: Cell::new(false),
            wakeup: RefCell::new(None),
            handles: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            readers: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),
            signal_handlers: RefCell::new(HashMap::new()),
            child_handlers: RefCell::new(HashMap::new()),
            interrupted: Cell::new(false),
            closed: Cell::new(false),
            inbox,
            inbox_pipe,
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(1),
        });

        inner.install_inbox_watch();

        if inner.context.is_default() {
            interrupt::install(&inner.backend, &inner.context);
            interrupt::attach(&inner.context, inner.make_remote());
        }

        tracing::debug!(loop_id = inner.id, context = %inner.context.id(), "event loop created");
        Ok(EventLoop { inner })
    }

    /// Blocks running the loop until [`EventLoop::stop`] (or an interrupt).
    pub fn run_forever(&self) -> Result<(), LoopError> {
        if self.inner.closed.get() {
            return Err(LoopError::Closed);
        }
        self.inner.driver.run(&self.inner)
    }

    /// Makes the current run return once the running pass finishes.
    ///
    /// Outside a run this does nothing; only the main loop created by the
    /// current `run_forever` can be quit.
    pub fn stop(&self) {
        self.inner.driver.request_stop();
    }

    /// Whether a blocking run is in progress.
    pub fn is_running(&self) -> bool {
        self.inner.driver.is_running()
    }

    /// Cancels every registration and detaches from the interrupt watch.
    ///
    /// Terminal and idempotent. Scheduling on a closed loop is ignored
    /// (the returned handles come back already cancelled), and blocking
    /// runs report [`LoopError::Closed`].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`EventLoop::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Current reading of the foreign monotonic clock.
    ///
    /// The origin is arbitrary; pair with [`EventLoop::call_at`].
    pub fn time(&self) -> Duration {
        self.inner.backend.monotonic_time()
    }

    /// Queues a callback for the next dispatch pass.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) -> Handle {
        self.inner.call_soon_once(Box::new(callback))
    }

    /// Runs a callback once after `delay`.
    ///
    /// A zero delay is exactly [`EventLoop::call_soon`]: no timer source
    /// is created and the callback joins the next pass.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Handle {
        self.inner.call_later_once(delay, Box::new(callback))
    }

    /// Runs a callback once when [`EventLoop::time`] reaches `when`.
    ///
    /// A deadline already in the past degenerates to `call_soon`.
    pub fn call_at(&self, when: Duration, callback: impl FnOnce() + 'static) -> Handle {
        let delay = when.saturating_sub(self.time());
        self.inner.call_later_once(delay, Box::new(callback))
    }

    /// Hands out a sendable scheduling handle for other threads.
    pub fn remote(&self) -> LoopRemote {
        self.inner.make_remote()
    }

    /// Watches `fd` for readability, replacing any previous reader on it.
    ///
    /// The callback fires once per dispatch pass while the descriptor
    /// stays ready; it is expected to consume the readiness.
    pub fn add_reader(&self, fd: impl AsRawFd, callback: impl FnMut() + 'static) {
        self.inner
            .add_fd_watch(fd.as_raw_fd(), FdInterest::Read, Box::new(callback));
    }

    /// Drops the reader on `fd`; reports whether one existed.
    pub fn remove_reader(&self, fd: impl AsRawFd) -> bool {
        remove_keyed(&self.inner.readers, fd.as_raw_fd())
    }

    /// Watches `fd` for writability, replacing any previous writer on it.
    pub fn add_writer(&self, fd: impl AsRawFd, callback: impl FnMut() + 'static) {
        self.inner
            .add_fd_watch(fd.as_raw_fd(), FdInterest::Write, Box::new(callback));
    }

    /// Drops the writer on `fd`; reports whether one existed.
    pub fn remove_writer(&self, fd: impl AsRawFd) -> bool {
        remove_keyed(&self.inner.writers, fd.as_raw_fd())
    }

    /// Installs `callback` for `signum`, replacing any previous handler.
    ///
    /// Fails for numbers the platform does not know
    /// ([`LoopError::UnsupportedSignal`]) and for signals nothing can
    /// catch ([`LoopError::UncatchableSignal`]). Note that a failed call
    /// has still removed the previous handler.
    pub fn add_signal_handler(
        &self,
        signum: i32,
        callback: impl FnMut() + 'static,
    ) -> Result<(), LoopError> {
        self.inner.add_signal(signum, Box::new(callback))
    }

    /// Drops the handler for `signum`; reports whether one existed.
    pub fn remove_signal_handler(&self, signum: i32) -> bool {
        remove_keyed(&self.inner.signal_handlers, signum)
    }

    /// Watches the child process `pid`, replacing any previous watch.
    ///
    /// The callback receives the decoded exit code: negated signal number
    /// for a signal death, plain code for a normal exit, `None` when the
    /// status was neither. Fires at most once. Only available on loops
    /// iterating the default context.
    pub fn add_child_handler(
        &self,
        pid: u32,
        callback: impl FnMut(Option<i32>) + 'static,
    ) -> Result<(), LoopError> {
        self.inner.add_child(pid, Box::new(callback))
    }

    /// Drops the child watch for `pid`; reports whether one existed.
    pub fn remove_child_handler(&self, pid: u32) -> bool {
        remove_keyed(&self.inner.child_handlers, pid)
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context.id())
            .field("running", &self.is_running())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

impl LoopInner {
    pub(crate) fn backend(&self) -> &BackendRef {
        &self.backend
    }

    pub(crate) fn context(&self) -> &ContextRef {
        &self.context
    }

    pub(crate) fn next_handle_id(&self) -> u64 {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        id
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        let id = self.next_task.get();
        self.next_task.set(id + 1);
        id
    }

    pub(crate) fn make_remote(&self) -> LoopRemote {
        LoopRemote::new(self.id, Arc::downgrade(&self.inbox))
    }

    pub(crate) fn weak(&self) -> Weak<LoopInner> {
        self.weak_self.clone()
    }

    pub(crate) fn register_handle(&self, handle: &Handle) {
        self.handles.borrow_mut().insert(handle.id(), handle.clone());
    }

    pub(crate) fn forget_handle(&self, id: u64) {
        self.handles.borrow_mut().remove(&id);
    }

    /// Drops a registration-table entry, but only while `id` still owns
    /// it. A replacement registered under the same key stays put.
    pub(crate) fn release_slot(&self, slot: RegistrationSlot, id: u64) {
        match slot {
            RegistrationSlot::None => {}
            RegistrationSlot::Reader(fd) => release_if_owner(&self.readers, fd, id),
            RegistrationSlot::Writer(fd) => release_if_owner(&self.writers, fd, id),
            RegistrationSlot::Signal(signum) => {
                release_if_owner(&self.signal_handlers, signum, id)
            }
            RegistrationSlot::Child(pid) => release_if_owner(&self.child_handlers, pid, id),
        }
    }

    /// Appends a fired handle to the ready queue without arming anything;
    /// the caller (the trampoline) dispatches right after.
    pub(crate) fn enqueue(&self, handle: Handle) {
        self.ready.borrow_mut().push_back(handle);
    }

    /// Runs one dispatch pass.
    ///
    /// Only the callbacks queued when the pass starts are run; everything
    /// queued by those callbacks waits for the next pass, after another
    /// foreign poll. The queue is never borrowed across a callback, so
    /// callbacks may schedule, cancel, and close freely.
    pub(crate) fn dispatch(&self) {
        self.dispatching.set(true);

        let ntodo = self.ready.borrow().len();
        for _ in 0..ntodo {
            let next = self.ready.borrow_mut().pop_front();
            let Some(handle) = next else {
                break;
            };
            if !handle.is_cancelled() {
                handle.run();
            }
        }

        self.schedule_dispatch();
        self.dispatching.set(false);
    }

    /// Arms the wakeup watch when callbacks are waiting and nothing is
    /// armed yet.
    ///
    /// The watch is a zero-interval repeating timer: each expiry runs a
    /// pass, and the expiry that finds the queue empty destroys it. This
    /// keeps the foreign loop from sleeping while work is queued without
    /// ever spinning on an idle queue.
    pub(crate) fn schedule_dispatch(&self) {
        if self.closed.get() {
            return;
        }
        if self.ready.borrow().is_empty() || self.wakeup.borrow().is_some() {
            return;
        }

        let mut source = self.backend.timer_watch(Duration::ZERO, true);
        let weak = self.weak();
        source.set_callback(Box::new(move |_| {
            let Some(inner) = weak.upgrade() else {
                return WatchAction::Remove;
            };
            inner.dispatch();
            if inner.ready.borrow().is_empty() {
                let wakeup = inner.wakeup.borrow_mut().take();
                if let Some(mut wakeup) = wakeup {
                    wakeup.destroy();
                }
                WatchAction::Remove
            } else {
                WatchAction::Continue
            }
        }));
        source.attach(&self.context);
        *self.wakeup.borrow_mut() = Some(source);
    }

    pub(crate) fn call_soon_once(&self, callback: Box<dyn FnOnce()>) -> Handle {
        let mut callback = Some(callback);
        self.call_soon_boxed(Box::new(move || {
            if let Some(callback) = callback.take() {
                callback();
            }
        }))
    }

    pub(crate) fn call_soon_boxed(&self, callback: Box<dyn FnMut()>) -> Handle {
        let handle = Handle::deferred(self, callback);
        if self.closed.get() {
            tracing::warn!(loop_id = self.id, "callback scheduled on a closed loop; dropped");
            handle.cancel();
            return handle;
        }
        self.ready.borrow_mut().push_back(handle.clone());
        if !self.dispatching.get() {
            self.schedule_dispatch();
        }
        handle
    }

    fn call_later_once(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> Handle {
        if delay.is_zero() {
            return self.call_soon_once(callback);
        }
        if self.closed.get() {
            tracing::warn!(loop_id = self.id, "timer scheduled on a closed loop; dropped");
            let handle = Handle::deferred(self, Box::new(|| {}));
            handle.cancel();
            return handle;
        }

        let mut callback = Some(callback);
        let source = self.backend.timer_watch(delay, false);
        Handle::with_source(
            self,
            source,
            false,
            RegistrationSlot::None,
            Box::new(move || {
                if let Some(callback) = callback.take() {
                    callback();
                }
            }),
            None,
        )
    }

    fn add_fd_watch(&self, fd: RawFd, interest: FdInterest, callback: Box<dyn FnMut()>) {
        if self.closed.get() {
            tracing::warn!(loop_id = self.id, fd, "fd watch on a closed loop; dropped");
            return;
        }
        let (table, slot) = match interest {
            FdInterest::Read => (&self.readers, RegistrationSlot::Reader(fd)),
            FdInterest::Write => (&self.writers, RegistrationSlot::Writer(fd)),
        };

        let previous = table.borrow_mut().remove(&fd);
        if let Some(previous) = previous {
            previous.cancel();
        }

        let source = self.backend.fd_watch(fd, interest);
        let handle = Handle::with_source(self, source, true, slot, callback, None);
        table.borrow_mut().insert(fd, handle);
    }

    fn add_signal(&self, signum: i32, callback: Box<dyn FnMut()>) -> Result<(), LoopError> {
        if self.closed.get() {
            return Err(LoopError::Closed);
        }
        check_signal(signum)?;

        let previous = self.signal_handlers.borrow_mut().remove(&signum);
        if let Some(previous) = previous {
            previous.cancel();
        }

        let source = match self.backend.signal_watch(signum) {
            Some(source) => source,
            None if signum == libc::SIGKILL || signum == libc::SIGSTOP => {
                return Err(LoopError::UncatchableSignal(signum));
            }
            None => return Err(LoopError::UnsupportedSignal(signum)),
        };

        let handle = Handle::with_source(
            self,
            source,
            true,
            RegistrationSlot::Signal(signum),
            callback,
            None,
        );
        self.signal_handlers.borrow_mut().insert(signum, handle);
        Ok(())
    }

    /// Id of the handle currently registered for `signum`, if any.
    pub(crate) fn signal_handle_id(&self, signum: i32) -> Option<u64> {
        self.signal_handlers.borrow().get(&signum).map(Handle::id)
    }

    /// Removes the handler for `signum` only while `handle_id` still owns
    /// the registration.
    pub(crate) fn remove_signal_if(&self, signum: i32, handle_id: u64) -> bool {
        let owned = self
            .signal_handlers
            .borrow()
            .get(&signum)
            .is_some_and(|handle| handle.id() == handle_id);
        if owned {
            remove_keyed(&self.signal_handlers, signum)
        } else {
            false
        }
    }

    fn add_child(
        &self,
        pid: u32,
        mut callback: Box<dyn FnMut(Option<i32>)>,
    ) -> Result<(), LoopError> {
        if self.closed.get() {
            return Err(LoopError::Closed);
        }
        if !self.context.is_default() {
            return Err(LoopError::ChildWatchOutsideDefault);
        }

        let previous = self.child_handlers.borrow_mut().remove(&pid);
        if let Some(previous) = previous {
            previous.cancel();
        }

        // The trampoline decodes the raw status into this stash before the
        // handle is queued; the wrapper hands it to the callback when the
        // pass runs.
        let code: ChildCodeCell = Rc::new(Cell::new(None));
        let stash = Rc::clone(&code);
        let wrapped = Box::new(move || {
            if let Some(decoded) = stash.take() {
                callback(decoded);
            }
        });

        let source = self.backend.child_watch(pid);
        let handle = Handle::with_source(
            self,
            source,
            false,
            RegistrationSlot::Child(pid),
            wrapped,
            Some(code),
        );
        self.child_handlers.borrow_mut().insert(pid, handle);
        Ok(())
    }

    /// Drains the wake-up pipe and turns queued messages into ready-queue
    /// work. Runs as an ordinary repeating fd watch, so everything it
    /// queues obeys the next-pass rule.
    fn install_inbox_watch(&self) {
        let raw = self.inbox_pipe.as_raw_fd();
        let weak = self.weak();
        let callback = Box::new(move || {
            let mut buf = [0u8; 64];
            loop {
                match unistd::read(raw, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.process_inbox();
            }
        });
        let source = self.backend.fd_watch(raw, FdInterest::Read);
        Handle::with_source(self, source, true, RegistrationSlot::None, callback, None);
    }

    fn process_inbox(&self) {
        for message in self.inbox.drain() {
            match message {
                Message::Run(callback) => {
                    let callback: Box<dyn FnOnce()> = callback;
                    self.call_soon_once(callback);
                }
                Message::WakeTask(task_id) => {
                    crate::task::schedule_poll(self, task_id);
                }
                Message::Interrupt => {
                    let weak = self.weak();
                    self.call_soon_once(Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.interrupted.set(true);
                            inner.driver.request_stop();
                        }
                    }));
                }
            }
        }
    }

    /// Reads and clears the interrupt flag; the run drivers call this once
    /// per finished run.
    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.replace(false)
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        // Cut remotes off first; the drain watch dies below and anything
        // they queued from here on could never run.
        self.inbox.close();
        if self.context.is_default() {
            interrupt::detach(self.context.id(), self.id);
        }

        let live: Vec<Handle> = self.handles.borrow().values().cloned().collect();
        tracing::debug!(loop_id = self.id, handles = live.len(), "closing event loop");
        for handle in live {
            handle.cancel();
        }

        let queued: Vec<Handle> = self.ready.borrow_mut().drain(..).collect();
        for handle in queued {
            handle.cancel();
        }

        let wakeup = self.wakeup.borrow_mut().take();
        if let Some(mut wakeup) = wakeup {
            wakeup.destroy();
        }

        // Futures are dropped outside the borrow; their destructors may
        // call back into the loop.
        let abandoned = std::mem::take(&mut *self.tasks.borrow_mut());
        drop(abandoned);
    }
}

fn check_signal(signum: i32) -> Result<(), LoopError> {
    Signal::try_from(signum)
        .map(|_| ())
        .map_err(|_| LoopError::UnsupportedSignal(signum))
}

fn remove_keyed<K: Eq + Hash>(table: &RefCell<HashMap<K, Handle>>, key: K) -> bool {
    let removed = table.borrow_mut().remove(&key);
    match removed {
        Some(handle) => {
            handle.cancel();
            true
        }
        None => false,
    }
}

fn release_if_owner<K: Eq + Hash>(table: &RefCell<HashMap<K, Handle>>, key: K, id: u64) {
    let mut table = table.borrow_mut();
    if table.get(&key).is_some_and(|handle| handle.id() == id) {
        table.remove(&key);
    }
}
