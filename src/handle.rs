//! Cancellation handles for scheduled callbacks and installed watches.
//!
//! Every scheduling call on the loop hands back a [`Handle`]. Dropping a
//! handle does nothing; the registration lives until it is cancelled, runs
//! its course (one-shot timers, child watches), or the loop is closed.
//!
//! ## Rules
//! - A handle enters the ready queue at most once per firing; the ready
//!   flag dedups bursts from the foreign library between dispatch passes.
//! - `cancel` is idempotent. A cancelled handle still sitting in the ready
//!   queue is skipped by dispatch, not removed eagerly.
//! - The callback slot is taken out for the duration of the call, so a
//!   callback may cancel its own handle without tripping a borrow.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::backend::{WatchAction, WatchEvent, WatchSource};
use crate::core::child::decode_wait_status;
use crate::core::event_loop::LoopInner;

/// Where a handle is filed in the loop's registration tables, if anywhere.
///
/// Used on cancel to drop the table entry, guarded by handle id so a
/// replacement registered under the same key survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegistrationSlot {
    None,
    Reader(RawFd),
    Writer(RawFd),
    Signal(i32),
    Child(u32),
}

/// Exit code stash for child watches.
///
/// The trampoline decodes the raw wait status before enqueueing the handle;
/// the callback wrapper picks the decoded value up when it runs. The outer
/// `Option` distinguishes "not fired yet" from a decoded `None`.
pub(crate) type ChildCodeCell = Rc<Cell<Option<Option<i32>>>>;

pub(crate) struct HandleInner {
    id: u64,
    owner: Weak<LoopInner>,
    cancelled: Cell<bool>,
    ready: Cell<bool>,
    repeat: bool,
    slot: RegistrationSlot,
    callback: RefCell<Option<Box<dyn FnMut()>>>,
    source: RefCell<Option<Box<dyn WatchSource>>>,
    child_code: Option<ChildCodeCell>,
}

/// A cancellable registration: a queued callback, timer, fd watch, signal
/// handler, or child watch.
///
/// Cloning is cheap and shares the underlying registration.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

impl Handle {
    /// Builds a plain ready-queue handle with no foreign source behind it.
    pub(crate) fn deferred(owner: &LoopInner, callback: Box<dyn FnMut()>) -> Handle {
        Handle {
            inner: Rc::new(HandleInner {
                id: owner.next_handle_id(),
                owner: owner.weak(),
                cancelled: Cell::new(false),
                ready: Cell::new(false),
                repeat: false,
                slot: RegistrationSlot::None,
                callback: RefCell::new(Some(callback)),
                source: RefCell::new(None),
                child_code: None,
            }),
        }
    }

    /// Builds a handle backed by a foreign watch source and installs it.
    ///
    /// The source gets the trampoline as its callback and is attached to
    /// the owning loop's context before this returns, so it may fire from
    /// the next iteration on.
    pub(crate) fn with_source(
        owner: &LoopInner,
        mut source: Box<dyn WatchSource>,
        repeat: bool,
        slot: RegistrationSlot,
        callback: Box<dyn FnMut()>,
        child_code: Option<ChildCodeCell>,
    ) -> Handle {
        let inner = Rc::new(HandleInner {
            id: owner.next_handle_id(),
            owner: owner.weak(),
            cancelled: Cell::new(false),
            ready: Cell::new(false),
            repeat,
            slot,
            callback: RefCell::new(Some(callback)),
            source: RefCell::new(None),
            child_code,
        });

        let weak = Rc::downgrade(&inner);
        source.set_callback(Box::new(move |event| trampoline(&weak, event)));
        source.attach(owner.context());
        *inner.source.borrow_mut() = Some(source);

        let handle = Handle { inner };
        owner.register_handle(&handle);
        handle
    }

    /// Cancels the registration.
    ///
    /// The foreign source is destroyed immediately; a callback already
    /// queued for the current or a later pass will not run. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }
        let source = self.inner.source.borrow_mut().take();
        if let Some(mut source) = source {
            source.destroy();
        }
        *self.inner.callback.borrow_mut() = None;
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.forget_handle(self.inner.id);
            owner.release_slot(self.inner.slot, self.inner.id);
        }
    }

    /// Whether [`Handle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Runs the callback once, clearing the ready flag first so the source
    /// can queue the handle again while the callback is still executing.
    pub(crate) fn run(&self) {
        self.inner.ready.set(false);
        let callback = self.inner.callback.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback();
            if !self.inner.cancelled.get() {
                *self.inner.callback.borrow_mut() = Some(callback);
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("cancelled", &self.inner.cancelled.get())
            .field("repeat", &self.inner.repeat)
            .field("slot", &self.inner.slot)
            .finish()
    }
}

/// Shared callback installed on every foreign source the adapter creates.
///
/// Mirrors the firing protocol the rest of the crate depends on: dedup via
/// the ready flag, enqueue, run a dispatch pass, then tell the foreign
/// library whether to keep the source.
fn trampoline(weak: &Weak<HandleInner>, event: WatchEvent) -> WatchAction {
    let Some(inner) = weak.upgrade() else {
        return WatchAction::Remove;
    };
    let Some(owner) = inner.owner.upgrade() else {
        return WatchAction::Remove;
    };

    if let WatchEvent::ChildExited { status } = event {
        if let Some(cell) = &inner.child_code {
            cell.set(Some(decode_wait_status(status)));
        }
    }

    if !inner.ready.get() {
        inner.ready.set(true);
        owner.enqueue(Handle {
            inner: Rc::clone(&inner),
        });
    }

    owner.dispatch();

    if inner.repeat && !inner.cancelled.get() {
        WatchAction::Continue
    } else {
        owner.forget_handle(inner.id);
        WatchAction::Remove
    }
}
