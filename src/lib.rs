//! # loopbridge
//!
//! **Loopbridge** is a callback-level event loop adapter for Rust.
//!
//! It runs handle-based scheduling (deferred callbacks, timers, fd
//! readiness, Unix signals, child exits, locally spawned futures) on top
//! of a foreign C main loop such as GLib's, reached through a small set
//! of traits a binding crate implements once. The crate is designed as a
//! building block for programs that must share their main loop with a
//! GUI toolkit or another C library.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!    user callbacks             spawned futures           other threads
//!  call_soon / call_later      spawn_local(fut)        LoopRemote::call_soon
//!         │                          │                          │
//!         ▼                          ▼                          ▼
//! ┌───────────────────────────────────────────────┐   ┌──────────────────┐
//! │  EventLoop (single-threaded)                  │◄──│  Inbox + wake-up │
//! │  - ready queue of Handles                     │   │  pipe (Send edge)│
//! │  - dispatch pump (zero-interval timer,        │   └──────────────────┘
//! │    armed only while callbacks are queued)     │
//! │  - watch tables: readers / writers /          │
//! │    signal handlers / child handlers           │
//! │  - run driver: owned main loop, or piggyback  │
//! │    on a host toolkit's blocking run           │
//! └──────┬───────────────────────────────▲────────┘
//!        │ timer_watch / fd_watch /      │ trampoline: enqueue handle,
//!        │ signal_watch / child_watch    │ run a dispatch pass
//!        ▼                               │
//! ┌──────────────────┐    fires     ┌────┴────────────────────────┐
//! │  Backend traits  │◄─────────────│  foreign C main loop        │
//! │  (the seam a     │              │  (contexts, sources,        │
//! │   binding fills) │─────────────►│   MainLoop::run)            │
//! └──────────────────┘ attach/      └─────────────────────────────┘
//!                      destroy
//! ```
//!
//! ### Lifecycle
//! ```text
//! EventLoop::new(backend) ──► wake-up pipe watch installed
//!                             (default context: joins the Ctrl-C
//!                              multiplexer shared by the process)
//!
//! run_forever():
//!   ├─► refuse when already running or closed
//!   ├─► create the foreign MainLoop (it starts in the running state)
//!   ├─► dispatch() once: drain callbacks queued before the run
//!   ├─► MainLoop::run() blocks; while it runs:
//!   │      source fires ──► trampoline ──► handle onto the ready queue
//!   │                                 ──► dispatch(): run up to the
//!   │                                     queue length at entry,
//!   │                                     skipping cancelled handles
//!   │      remote message ──► wake pipe ──► inbox drained on the loop
//!   │      Ctrl-C ──► multiplexer ──► interrupt flag, then stop()
//!   ├─► stop() ──► MainLoop::quit() ──► run() returns
//!   └─► interrupted? ──► Err(LoopError::Interrupted) (flag cleared)
//! ```
//!
//! ## Features
//! | Area             | Description                                                         | Key types / traits                         |
//! |------------------|---------------------------------------------------------------------|--------------------------------------------|
//! | **Scheduling**   | Callbacks now, after a delay, or at an absolute loop time.          | [`EventLoop`], [`Handle`]                  |
//! | **OS events**    | Fd readiness, Unix signals, and child exits routed as callbacks.    | [`EventLoop`]                              |
//! | **Futures**      | Single-threaded tasks polled on the loop; a blocking run helper.    | [`TaskHandle`], [`SignalFuture`]           |
//! | **Cross-thread** | `Send + Sync` handle injecting work through a wake-up pipe.         | [`LoopRemote`]                             |
//! | **Policy**       | Per-thread default loop management and installation.                | [`LoopPolicy`], [`PolicyConfig`]           |
//! | **Backend seam** | Traits a foreign-loop binding implements once.                      | [`backend::Backend`], [`backend::WatchSource`] |
//! | **Errors**       | Typed refusals with stable labels for logs.                         | [`LoopError`]                              |
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use loopbridge::{BackendRef, EventLoop, LoopError};
//!
//! // `backend` comes from a binding crate wrapping the real C loop.
//! fn run(backend: BackendRef) -> Result<(), LoopError> {
//!     let event_loop = EventLoop::new(backend)?;
//!
//!     let tick = event_loop.clone();
//!     event_loop.call_later(Duration::from_millis(250), move || {
//!         println!("tick");
//!         tick.stop();
//!     });
//!
//!     event_loop.run_forever()?;
//!     event_loop.close();
//!     Ok(())
//! }
//! ```
pub mod backend;

mod core;
mod error;
mod handle;
mod policy;
mod task;

#[cfg(test)]
mod testkit;

// ---- Public re-exports ----

pub use backend::BackendRef;
pub use core::{EventLoop, LoopRemote};
pub use error::LoopError;
pub use handle::Handle;
pub use policy::{LoopPolicy, PolicyConfig, ThreadLoop};
pub use task::{next_signal, SignalFuture, TaskHandle};
