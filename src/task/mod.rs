//! # Minimal future driver on top of the dispatch passes.
//!
//! This module provides the task-related types:
//! - [`TaskHandle`] - completion state of a spawned future
//! - [`SignalFuture`] - future resolving on the next delivery of a signal
//! - `spawn_local` / `run_until_complete` on [`EventLoop`]
//!
//! Futures are polled inside ordinary dispatch passes. A waker routes
//! through the loop's inbox, so wakes from any thread (channel sends,
//! timers owned elsewhere) land as a queued poll on the loop thread.

mod signal_future;

pub use signal_future::{next_signal, SignalFuture};

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::core::event_loop::{EventLoop, LoopInner};
use crate::core::remote::LoopRemote;
use crate::error::LoopError;

/// A spawned future parked in the loop's task table.
pub(crate) struct TaskEntry {
    /// Taken out for the duration of a poll so the table is never borrowed
    /// while user future code runs.
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
}

/// Completion state shared between a spawned future and its observers.
struct TaskShared<T> {
    result: RefCell<Option<T>>,
    done: Cell<bool>,
    callbacks: RefCell<Vec<(u64, Box<dyn FnOnce()>)>>,
    next_callback: Cell<u64>,
}

impl<T> TaskShared<T> {
    fn finish(&self, value: T) {
        *self.result.borrow_mut() = Some(value);
        self.done.set(true);
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        for (_, callback) in callbacks {
            callback();
        }
    }
}

/// Handle to a future spawned with [`EventLoop::spawn_local`].
///
/// Cloning shares the completion state. The output is held until someone
/// takes it; the loop never consumes it on its own.
pub struct TaskHandle<T> {
    shared: Rc<TaskShared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        TaskHandle {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Whether the future has run to completion.
    pub fn done(&self) -> bool {
        self.shared.done.get()
    }

    /// Takes the output if the future completed; `None` before completion
    /// or after a previous take.
    pub fn take_result(&self) -> Option<T> {
        self.shared.result.borrow_mut().take()
    }

    /// Registers a callback invoked when the future completes.
    ///
    /// Runs synchronously inside the completing dispatch pass. If the
    /// future is already done the callback runs right here. Returns a
    /// token for [`TaskHandle::remove_done_callback`].
    pub fn add_done_callback(&self, callback: impl FnOnce() + 'static) -> u64 {
        let token = self.shared.next_callback.get();
        self.shared.next_callback.set(token + 1);
        if self.shared.done.get() {
            callback();
            return token;
        }
        self.shared
            .callbacks
            .borrow_mut()
            .push((token, Box::new(callback)));
        token
    }

    /// Drops a registered completion callback; reports whether it was
    /// still pending.
    pub fn remove_done_callback(&self, token: u64) -> bool {
        let mut callbacks = self.shared.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != token);
        callbacks.len() != before
    }
}

impl EventLoop {
    /// Spawns a future onto this loop.
    ///
    /// The future is polled in dispatch passes, starting with the next
    /// one. It stays `!Send`; only its wakes may come from other threads.
    pub fn spawn_local<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let shared = Rc::new(TaskShared {
            result: RefCell::new(None),
            done: Cell::new(false),
            callbacks: RefCell::new(Vec::new()),
            next_callback: Cell::new(1),
        });

        let state = Rc::clone(&shared);
        let driver = async move {
            let value = future.await;
            state.finish(value);
        };

        let inner = self.inner();
        let task_id = inner.next_task_id();
        inner.tasks.borrow_mut().insert(
            task_id,
            TaskEntry {
                future: Some(Box::pin(driver)),
            },
        );
        schedule_poll(inner, task_id);

        TaskHandle { shared }
    }

    /// Runs the loop until `future` completes and returns its output.
    ///
    /// Equivalent to spawning the future, running forever, and stopping
    /// the loop from a completion callback. A `stop` from elsewhere ends
    /// the run early with [`LoopError::StoppedBeforeComplete`]; an
    /// interrupt surfaces as [`LoopError::Interrupted`].
    pub fn run_until_complete<F>(&self, future: F) -> Result<F::Output, LoopError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let task = self.spawn_local(future);
        let stopper = self.clone();
        let token = task.add_done_callback(move || stopper.stop());

        let run = self.run_forever();
        task.remove_done_callback(token);
        run?;

        task.take_result().ok_or(LoopError::StoppedBeforeComplete)
    }
}

/// Queues a poll of `task_id` for the next dispatch pass.
pub(crate) fn schedule_poll(inner: &LoopInner, task_id: u64) {
    if !inner.tasks.borrow().contains_key(&task_id) {
        return;
    }
    let weak = inner.weak();
    inner.call_soon_once(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            poll_task(&inner, task_id);
        }
    }));
}

/// Polls one task. The future is moved out of the table for the duration,
/// so the poll itself may spawn, wake, or close without re-entering the
/// table borrow.
fn poll_task(inner: &LoopInner, task_id: u64) {
    let future = {
        let mut tasks = inner.tasks.borrow_mut();
        match tasks.get_mut(&task_id) {
            Some(entry) => entry.future.take(),
            None => return,
        }
    };
    let Some(mut future) = future else {
        return;
    };

    let waker = Waker::from(Arc::new(TaskWaker {
        remote: inner.make_remote(),
        task_id,
    }));
    let mut context = Context::from_waker(&waker);

    match future.as_mut().poll(&mut context) {
        Poll::Ready(()) => {
            // Bind before dropping: the entry's destructor may run user
            // code that touches the task table.
            let finished = inner.tasks.borrow_mut().remove(&task_id);
            drop(finished);
        }
        Poll::Pending => {
            if let Some(entry) = inner.tasks.borrow_mut().get_mut(&task_id) {
                entry.future = Some(future);
            }
        }
    }
}

/// Waker that turns `wake` into a poll request on the loop's remote,
/// whatever thread it is called from. Wakes after the loop closed or died
/// fall through silently.
struct TaskWaker {
    remote: LoopRemote,
    task_id: u64,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.remote.wake_task(self.task_id);
    }
}
