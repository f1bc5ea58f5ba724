//! Per-thread loop selection policy.
//!
//! Applications with threads need an answer to "which loop does this
//! thread use". The policy anchors itself to the thread that created it
//! (normally the main thread) and hands out:
//!
//! - the thread's shared default loop on the anchor thread, iterating the
//!   foreign default context,
//! - a dedicated private-context loop on other threads when `full` is
//!   set,
//! - nothing ([`ThreadLoop::Unmanaged`]) otherwise, meaning the thread
//!   should bring its own scheduling.
//!
//! Default loops are kept per thread. A host that runs the foreign loop
//! itself (a GUI toolkit) builds the loop with [`EventLoop::external`]
//! and installs it via [`LoopPolicy::install_default`]; from then on the
//! policy hands that loop out as the thread's default.

use std::cell::RefCell;
use std::thread::{self, ThreadId};

use crate::backend::BackendRef;
use crate::core::event_loop::EventLoop;
use crate::error::LoopError;

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Tuning knobs for [`LoopPolicy`].
#[derive(Clone, Copy, Debug)]
pub struct PolicyConfig {
    /// Hand every thread an adapter loop, not just the anchor thread.
    ///
    /// Set this when code on worker threads must interact with foreign
    /// components that expect a context of their own.
    pub full: bool,

    /// Let the anchor thread use the foreign default context.
    ///
    /// When unset the policy never creates a shared default loop and
    /// [`LoopPolicy::default_loop`] refuses.
    pub use_default_context: bool,
}

impl Default for PolicyConfig {
    /// Defaults: only the anchor thread is managed, on the default
    /// context.
    fn default() -> Self {
        PolicyConfig {
            full: false,
            use_default_context: true,
        }
    }
}

impl PolicyConfig {
    /// Sets [`PolicyConfig::full`].
    #[inline]
    pub fn with_full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    /// Sets [`PolicyConfig::use_default_context`].
    #[inline]
    pub fn with_default_context(mut self, use_default_context: bool) -> Self {
        self.use_default_context = use_default_context;
        self
    }
}

/// What the policy assigned to the calling thread.
#[derive(Debug)]
pub enum ThreadLoop {
    /// The thread's shared default loop, on the foreign default context.
    Shared(EventLoop),
    /// A dedicated loop on a private context (`full` mode).
    Dedicated(EventLoop),
    /// The policy does not manage this thread.
    Unmanaged,
}

/// Thread-aware loop provider.
///
/// Create one early, on the thread that will drive the foreign default
/// context, and share it with the rest of the application.
#[derive(Debug)]
pub struct LoopPolicy {
    config: PolicyConfig,
    anchor: ThreadId,
}

impl LoopPolicy {
    /// Builds a policy anchored to the calling thread.
    pub fn new(config: PolicyConfig) -> Self {
        LoopPolicy {
            config,
            anchor: thread::current().id(),
        }
    }

    /// Returns the loop assigned to the calling thread, creating it on
    /// first use.
    pub fn event_loop(&self, backend: &BackendRef) -> Result<ThreadLoop, LoopError> {
        if self.config.use_default_context && thread::current().id() == self.anchor {
            return Ok(ThreadLoop::Shared(self.default_loop(backend)?));
        }
        if self.config.full {
            return Ok(ThreadLoop::Dedicated(EventLoop::new(backend.clone())?));
        }
        Ok(ThreadLoop::Unmanaged)
    }

    /// Returns the calling thread's default loop, creating one on the
    /// foreign default context on first use.
    pub fn default_loop(&self, backend: &BackendRef) -> Result<EventLoop, LoopError> {
        if !self.config.use_default_context {
            return Err(LoopError::PolicyDisabledDefault);
        }
        THREAD_DEFAULT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                return Ok(existing.clone());
            }
            let event_loop =
                EventLoop::with_context(backend.clone(), backend.default_context())?;
            tracing::debug!("created thread default loop");
            *slot = Some(event_loop.clone());
            Ok(event_loop)
        })
    }

    /// Installs `event_loop` as the calling thread's default.
    ///
    /// This is how an externally driven loop becomes the default; build it
    /// with [`EventLoop::external`] first. Fails when the slot is already
    /// occupied.
    pub fn install_default(&self, event_loop: EventLoop) -> Result<(), LoopError> {
        THREAD_DEFAULT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(LoopError::DefaultLoopInstalled);
            }
            *slot = Some(event_loop);
            Ok(())
        })
    }

    /// The default loop already created or installed for this thread, if
    /// any. Never creates one.
    pub fn installed_default() -> Option<EventLoop> {
        THREAD_DEFAULT.with(|slot| slot.borrow().clone())
    }
}
