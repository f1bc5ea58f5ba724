//! Cross-thread entry into a single-threaded loop.
//!
//! The loop proper is `!Send`; the only thing allowed to cross threads is a
//! [`LoopRemote`]. It pushes messages into a mutex-guarded inbox and pokes
//! a self-pipe so a loop blocked inside the foreign library wakes up. A
//! permanent fd watch on the pipe's read end drains the inbox on the loop
//! thread, inside an ordinary dispatch pass.
//!
//! ## Rules
//! - One pipe byte per wake-up burst; the `notified` flag collapses
//!   repeated pushes between drains into a single write.
//! - Messages never run on the sending thread. Delivery is FIFO per inbox.
//! - A remote outlives its loop gracefully: pushes after the loop closed
//!   or dropped report `false` instead of panicking.

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use nix::fcntl::OFlag;
use nix::unistd;

/// Work item delivered to the loop thread.
pub(crate) enum Message {
    /// Run a closure in the next dispatch pass.
    Run(Box<dyn FnOnce() + Send>),
    /// Poll the task with this id again.
    WakeTask(u64),
    /// The default interrupt signal arrived for this loop.
    Interrupt,
}

/// Shared mailbox between remotes and the owning loop.
pub(crate) struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    notified: AtomicBool,
    closed: AtomicBool,
    pipe_w: OwnedFd,
}

impl Inbox {
    /// Creates the inbox and its wake-up pipe.
    ///
    /// Returns the read end separately; the loop installs a permanent
    /// read watch on it and keeps it open for its own lifetime.
    pub(crate) fn new() -> io::Result<(Arc<Inbox>, OwnedFd)> {
        let (pipe_r, pipe_w) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(io::Error::from)?;
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(VecDeque::new()),
            notified: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pipe_w,
        });
        Ok((inbox, pipe_r))
    }

    /// Stops accepting remote messages. The owning loop calls this when
    /// it closes, before tearing down the drain watch.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues a message and wakes the loop if it is not already pending.
    pub(crate) fn push(&self, message: Message) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
        if !self.notified.swap(true, Ordering::AcqRel) {
            // A full pipe means a wake-up byte is already in flight.
            let _ = unistd::write(&self.pipe_w, &[1u8]);
        }
    }

    /// Takes everything queued so far.
    ///
    /// Clears the notified flag before taking the queue, so a push racing
    /// with the drain either lands in the returned batch or writes a fresh
    /// wake-up byte for the next one.
    pub(crate) fn drain(&self) -> VecDeque<Message> {
        self.notified.store(false, Ordering::Release);
        std::mem::take(
            &mut *self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Sendable handle for scheduling work onto a loop from other threads.
///
/// Obtained from [`EventLoop::remote`](crate::EventLoop::remote). Holds the
/// loop weakly; every method reports whether the loop was still open to
/// receive the message.
#[derive(Clone)]
pub struct LoopRemote {
    loop_id: u64,
    inbox: Weak<Inbox>,
}

impl LoopRemote {
    pub(crate) fn new(loop_id: u64, inbox: Weak<Inbox>) -> Self {
        LoopRemote { loop_id, inbox }
    }

    /// Schedules a closure to run on the loop thread in its next pass.
    ///
    /// Safe to call from any thread, including the loop's own. Returns
    /// `false` when the loop has been closed or dropped; the closure is
    /// discarded in that case.
    pub fn call_soon(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        self.push(Message::Run(Box::new(callback)))
    }

    /// Whether the loop behind this remote still exists.
    pub fn is_alive(&self) -> bool {
        self.inbox.strong_count() > 0
    }

    /// Identity of the loop this remote points at.
    pub(crate) fn loop_id(&self) -> u64 {
        self.loop_id
    }

    /// Forwards the default interrupt to the loop thread.
    pub(crate) fn interrupt(&self) -> bool {
        self.push(Message::Interrupt)
    }

    /// Requests another poll of a spawned task.
    pub(crate) fn wake_task(&self, task_id: u64) -> bool {
        self.push(Message::WakeTask(task_id))
    }

    fn push(&self, message: Message) -> bool {
        match self.inbox.upgrade() {
            Some(inbox) if !inbox.is_closed() => {
                inbox.push(message);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for LoopRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRemote")
            .field("loop_id", &self.loop_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
