//! Error types raised by the loop adapter.
//!
//! Everything funnels into a single enum:
//!
//! - [`LoopError`] — failures of loop setup, registration, and run control.
//!
//! The type provides helper methods (`as_label`, `is_usage`) for logging and
//! for telling caller mistakes apart from environment failures.

use std::io;
use thiserror::Error;

/// # Errors produced by the event loop adapter.
///
/// These cover loop lifecycle misuse (running a loop twice, installing a
/// second default loop), registrations the underlying library cannot honor
/// (uncatchable or unknown signals, child watches outside the default
/// context), and run outcomes that end a blocking call early.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoopError {
    /// `run_forever` or `run_until_complete` was called on a loop that is
    /// already inside a blocking run.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The loop has been closed; runs and fallible registrations refuse.
    #[error("event loop is closed")]
    Closed,

    /// Child watches are delivered through the process-global default
    /// context; this loop iterates a private one.
    #[error("child processes can only be watched from the default context")]
    ChildWatchOutsideDefault,

    /// A shared default loop is already installed for this thread.
    #[error("a default event loop is already installed")]
    DefaultLoopInstalled,

    /// The policy was built with the shared default loop disabled.
    #[error("policy is configured without a shared default loop")]
    PolicyDisabledDefault,

    /// The signal number is valid but can never be caught (forced kill,
    /// forced stop).
    #[error("signal {0} cannot be caught")]
    UncatchableSignal(i32),

    /// The signal number is not a signal the platform knows about.
    #[error("signal {0} is not supported on this platform")]
    UnsupportedSignal(i32),

    /// The loop was stopped before the awaited future produced a value.
    #[error("event loop stopped before the future completed")]
    StoppedBeforeComplete,

    /// The run was ended by the default interrupt signal (Ctrl-C).
    #[error("interrupted")]
    Interrupted,

    /// Creating loop plumbing (the cross-thread wake-up channel) failed.
    #[error("event loop setup failed: {0}")]
    Setup(#[from] io::Error),
}

impl LoopError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use loopbridge::LoopError;
    ///
    /// let err = LoopError::AlreadyRunning;
    /// assert_eq!(err.as_label(), "loop_already_running");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            LoopError::AlreadyRunning => "loop_already_running",
            LoopError::Closed => "loop_closed",
            LoopError::ChildWatchOutsideDefault => "loop_child_watch_outside_default",
            LoopError::DefaultLoopInstalled => "loop_default_installed",
            LoopError::PolicyDisabledDefault => "loop_policy_disabled_default",
            LoopError::UncatchableSignal(_) => "loop_uncatchable_signal",
            LoopError::UnsupportedSignal(_) => "loop_unsupported_signal",
            LoopError::StoppedBeforeComplete => "loop_stopped_before_complete",
            LoopError::Interrupted => "loop_interrupted",
            LoopError::Setup(_) => "loop_setup_failed",
        }
    }

    /// Indicates whether the error is a caller mistake rather than an
    /// environment or delivery failure.
    ///
    /// Returns `true` for misuse of the API surface (double run, double
    /// install, registrations the adapter documents as unsupported),
    /// `false` for run outcomes and setup failures.
    ///
    /// # Example
    /// ```
    /// use loopbridge::LoopError;
    ///
    /// assert!(LoopError::AlreadyRunning.is_usage());
    /// assert!(!LoopError::Interrupted.is_usage());
    /// ```
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            LoopError::AlreadyRunning
                | LoopError::Closed
                | LoopError::ChildWatchOutsideDefault
                | LoopError::DefaultLoopInstalled
                | LoopError::PolicyDisabledDefault
                | LoopError::UncatchableSignal(_)
                | LoopError::UnsupportedSignal(_)
        )
    }
}
