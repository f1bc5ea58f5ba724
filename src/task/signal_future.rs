//! One-shot future over the loop's signal handling.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::core::event_loop::EventLoop;
use crate::error::LoopError;

/// Resolves on the next delivery of a signal.
///
/// Built by [`next_signal`]. The underlying registration is removed when
/// the future is dropped, unless something else has replaced it in the
/// meantime; in that case (or after an explicit
/// [`EventLoop::remove_signal_handler`]) the future resolves right away,
/// since the delivery it waits for can no longer happen.
pub struct SignalFuture {
    receiver: oneshot::Receiver<()>,
    event_loop: EventLoop,
    signum: i32,
    handle_id: u64,
}

/// Installs a one-shot handler for `signum` and returns a future for its
/// next delivery.
///
/// Replaces any existing handler for that signal, like every registration
/// does. Typical use is waiting for a shutdown signal:
///
/// ```text
/// let interrupted = next_signal(&event_loop, libc::SIGUSR1)?;
/// event_loop.run_until_complete(interrupted)?;
/// ```
pub fn next_signal(event_loop: &EventLoop, signum: i32) -> Result<SignalFuture, LoopError> {
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    event_loop.add_signal_handler(signum, move || {
        if let Some(sender) = sender.take() {
            let _ = sender.send(());
        }
    })?;

    let handle_id = event_loop
        .inner()
        .signal_handle_id(signum)
        .unwrap_or_default();

    Ok(SignalFuture {
        receiver,
        event_loop: event_loop.clone(),
        signum,
        handle_id,
    })
}

impl Future for SignalFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(context) {
            // A closed channel means the registration went away; nothing
            // left to wait for.
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SignalFuture {
    fn drop(&mut self) {
        self.event_loop
            .inner()
            .remove_signal_if(self.signum, self.handle_id);
    }
}
