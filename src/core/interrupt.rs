//! Default-interrupt (Ctrl-C) multiplexer.
//!
//! The foreign library allows only one effective trap per signal and
//! context, so the adapter installs a single interrupt watch per context,
//! once, for the life of the process, and forwards deliveries to whichever
//! loop is currently attached. Loops sharing a context displace each other
//! on attach; that is inherent to the one-trap limit and is logged.
//!
//! ## Rules
//! - The watch is installed at most once per [`ContextId`] and is never
//!   torn down; its callback captures nothing loop-specific.
//! - Delivery goes through [`LoopRemote::interrupt`], so the attached
//!   loop's flag is set inside one of its own dispatch passes, never from
//!   foreign stack frames it does not expect.
//! - Detach is id-guarded: closing an old loop never detaches the loop
//!   that displaced it.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::backend::{BackendRef, ContextId, ContextRef, WatchAction};
use crate::core::remote::LoopRemote;

/// Loop currently receiving interrupts for a context.
struct Attached {
    remote: LoopRemote,
}

/// One entry per context that has an interrupt watch installed.
///
/// `None` means installed but no loop attached right now.
fn slots() -> &'static Mutex<HashMap<ContextId, Option<Attached>>> {
    static SLOTS: OnceLock<Mutex<HashMap<ContextId, Option<Attached>>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Installs the interrupt watch for `context` if it does not exist yet.
///
/// The watch source is leaked deliberately; it must survive every loop
/// that will ever iterate this context.
pub(crate) fn install(backend: &BackendRef, context: &ContextRef) {
    let id = context.id();
    let mut map = slots().lock().unwrap_or_else(PoisonError::into_inner);
    if map.contains_key(&id) {
        return;
    }

    let Some(mut source) = backend.signal_watch(libc::SIGINT) else {
        tracing::warn!(context = %id, "interrupt watch refused; Ctrl-C will not stop loops on this context");
        return;
    };
    source.set_callback(Box::new(move |_| {
        deliver(id);
        WatchAction::Continue
    }));
    source.attach(context);
    std::mem::forget(source);

    map.insert(id, None);
}

/// Routes an interrupt delivery to the loop attached to `id`, if any.
fn deliver(id: ContextId) {
    let map = slots().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(Some(attached)) = map.get(&id) {
        attached.remote.interrupt();
    }
}

/// Points the context's interrupt watch at `remote`'s loop.
///
/// Replaces any previous attachment. Two live loops on one context cannot
/// both receive interrupts; when that happens the displacement is logged
/// so the surprise is at least visible.
pub(crate) fn attach(context: &ContextRef, remote: LoopRemote) {
    let id = context.id();
    let mut map = slots().lock().unwrap_or_else(PoisonError::into_inner);
    let Some(slot) = map.get_mut(&id) else {
        return;
    };
    if let Some(previous) = slot {
        if previous.remote.loop_id() != remote.loop_id() && previous.remote.is_alive() {
            tracing::warn!(
                context = %id,
                "multiple event loops share this context; interrupts now go to the newest one"
            );
        }
    }
    *slot = Some(Attached { remote });
}

/// Clears the attachment if it still belongs to `loop_id`.
pub(crate) fn detach(context_id: ContextId, loop_id: u64) {
    let mut map = slots().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = map.get_mut(&context_id) {
        let owned = matches!(slot, Some(attached) if attached.remote.loop_id() == loop_id);
        if owned {
            *slot = None;
        }
    }
}
