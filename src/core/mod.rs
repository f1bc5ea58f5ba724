//! Runtime core: the loop, its drivers, and its cross-thread edge.
//!
//! The public API from this module is [`EventLoop`] and [`LoopRemote`];
//! everything else is plumbing behind them.
//!
//! Internal modules:
//! - [`event_loop`]: ready queue, dispatch protocol, and watch registration;
//! - [`driver`]: how `run_forever` blocks (owned main loop or piggyback);
//! - [`remote`]: thread-safe inbox plus the wake-up pipe behind it;
//! - [`interrupt`]: process-wide Ctrl-C multiplexer for default contexts;
//! - [`child`]: raw `wait(2)` status decoding.

mod driver;
mod interrupt;

pub(crate) mod child;
pub(crate) mod event_loop;
pub(crate) mod remote;

pub use event_loop::EventLoop;
pub use remote::LoopRemote;
