//! In-tree backend used by the test suite.
//!
//! [`MiniLoop`] implements the full [`Backend`] contract over `ppoll(2)`:
//! real clocks, real fd readiness, and a wake-up pipe. Signals and child
//! exits are not trapped from the kernel; tests inject them with
//! [`MiniLoop::deliver_signal`] and [`MiniLoop::deliver_child_exit`],
//! usually from a callback already running on the loop.
//!
//! The contract subtleties the adapter depends on are honored here the
//! way the real library honors them:
//!
//! - destroy is idempotent and legal from inside the source's own
//!   callback (dead sources are swept lazily),
//! - a pending signal is delivered to the first matching watch in attach
//!   order,
//! - main loops are created in the running state,
//! - quits are counted so tests can assert how a run ended.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::unistd;

use crate::backend::{
    Backend, BackendRef, Context, ContextId, ContextRef, ExternalDriver, FdInterest, MainLoop,
    WatchAction, WatchCallback, WatchEvent, WatchSource,
};

enum SourceKind {
    Timer {
        deadline: Cell<Instant>,
        interval: Duration,
        repeat: bool,
    },
    Fd {
        fd: RawFd,
        interest: FdInterest,
    },
    Signal(i32),
    Child(u32),
}

struct MiniSource {
    kind: SourceKind,
    context: Cell<Option<ContextId>>,
    callback: RefCell<Option<WatchCallback>>,
    dead: Cell<bool>,
}

struct MiniContext {
    id: ContextId,
    default: bool,
}

impl Context for MiniContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn is_default(&self) -> bool {
        self.default
    }
}

struct MiniState {
    start: Instant,
    default_context: ContextRef,
    sources: RefCell<Vec<Rc<MiniSource>>>,
    pending_signals: RefCell<Vec<i32>>,
    pending_children: RefCell<Vec<(u32, i32)>>,
    wake_r: OwnedFd,
    wake_w: OwnedFd,
    main_quits: Cell<u32>,
    external_quits: Cell<u32>,
}

/// Test backend; clone freely, clones share the state.
#[derive(Clone)]
pub(crate) struct MiniLoop {
    state: Rc<MiniState>,
}

impl MiniLoop {
    pub(crate) fn new() -> MiniLoop {
        let (wake_r, wake_w) =
            unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).expect("wake pipe");
        MiniLoop {
            state: Rc::new(MiniState {
                start: Instant::now(),
                default_context: Rc::new(MiniContext {
                    id: ContextId::next(),
                    default: true,
                }),
                sources: RefCell::new(Vec::new()),
                pending_signals: RefCell::new(Vec::new()),
                pending_children: RefCell::new(Vec::new()),
                wake_r,
                wake_w,
                main_quits: Cell::new(0),
                external_quits: Cell::new(0),
            }),
        }
    }

    pub(crate) fn backend(&self) -> BackendRef {
        Rc::new(self.clone())
    }

    pub(crate) fn external_driver(&self) -> Rc<dyn ExternalDriver> {
        Rc::new(MiniExternal {
            state: Rc::clone(&self.state),
            running: Cell::new(false),
        })
    }

    /// Marks a signal as delivered; the next iteration routes it.
    pub(crate) fn deliver_signal(&self, signum: i32) {
        self.state.pending_signals.borrow_mut().push(signum);
        self.state.wake();
    }

    /// Marks a child exit with a raw wait status; the next iteration
    /// routes it.
    pub(crate) fn deliver_child_exit(&self, pid: u32, status: i32) {
        self.state.pending_children.borrow_mut().push((pid, status));
        self.state.wake();
    }

    /// How many owned main loops have been quit so far.
    pub(crate) fn main_quit_count(&self) -> u32 {
        self.state.main_quits.get()
    }

    /// How many external-driver runs have been quit so far.
    pub(crate) fn external_quit_count(&self) -> u32 {
        self.state.external_quits.get()
    }

    /// Attached, not-yet-destroyed sources on `context`.
    pub(crate) fn live_sources(&self, context: &ContextRef) -> usize {
        self.state
            .sources
            .borrow()
            .iter()
            .filter(|source| !source.dead.get() && source.context.get() == Some(context.id()))
            .count()
    }

    fn watch(&self, kind: SourceKind) -> Box<dyn WatchSource> {
        Box::new(MiniSourceHandle {
            state: Rc::clone(&self.state),
            source: Rc::new(MiniSource {
                kind,
                context: Cell::new(None),
                callback: RefCell::new(None),
                dead: Cell::new(false),
            }),
        })
    }
}

impl Backend for MiniLoop {
    fn default_context(&self) -> ContextRef {
        Rc::clone(&self.state.default_context)
    }

    fn new_context(&self) -> ContextRef {
        Rc::new(MiniContext {
            id: ContextId::next(),
            default: false,
        })
    }

    fn monotonic_time(&self) -> Duration {
        // Truncate to whole microseconds, like the clock being imitated.
        Duration::from_micros(self.state.start.elapsed().as_micros() as u64)
    }

    fn timer_watch(&self, interval: Duration, repeat: bool) -> Box<dyn WatchSource> {
        self.watch(SourceKind::Timer {
            deadline: Cell::new(Instant::now() + interval),
            interval,
            repeat,
        })
    }

    fn fd_watch(&self, fd: RawFd, interest: FdInterest) -> Box<dyn WatchSource> {
        self.watch(SourceKind::Fd { fd, interest })
    }

    fn signal_watch(&self, signum: i32) -> Option<Box<dyn WatchSource>> {
        if signum == libc::SIGKILL || signum == libc::SIGSTOP {
            return None;
        }
        Some(self.watch(SourceKind::Signal(signum)))
    }

    fn child_watch(&self, pid: u32) -> Box<dyn WatchSource> {
        self.watch(SourceKind::Child(pid))
    }

    fn main_loop(&self, context: &ContextRef) -> Rc<dyn MainLoop> {
        Rc::new(MiniMainLoop {
            state: Rc::clone(&self.state),
            context: context.id(),
            running: Cell::new(true),
        })
    }
}

struct MiniSourceHandle {
    state: Rc<MiniState>,
    source: Rc<MiniSource>,
}

impl WatchSource for MiniSourceHandle {
    fn set_callback(&mut self, callback: WatchCallback) {
        *self.source.callback.borrow_mut() = Some(callback);
    }

    fn attach(&mut self, context: &ContextRef) {
        self.source.context.set(Some(context.id()));
        self.state.sources.borrow_mut().push(Rc::clone(&self.source));
    }

    fn destroy(&mut self) {
        self.source.dead.set(true);
    }
}

struct MiniMainLoop {
    state: Rc<MiniState>,
    context: ContextId,
    running: Cell<bool>,
}

impl MainLoop for MiniMainLoop {
    fn run(&self) {
        while self.running.get() {
            self.state.iterate(self.context, true);
        }
    }

    fn quit(&self) {
        if self.running.replace(false) {
            self.state.main_quits.set(self.state.main_quits.get() + 1);
            self.state.wake();
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }
}

struct MiniExternal {
    state: Rc<MiniState>,
    running: Cell<bool>,
}

impl ExternalDriver for MiniExternal {
    fn run(&self) {
        self.running.set(true);
        let context = self.state.default_context.id();
        while self.running.get() {
            self.state.iterate(context, true);
        }
    }

    fn quit(&self) {
        if self.running.replace(false) {
            self.state
                .external_quits
                .set(self.state.external_quits.get() + 1);
            self.state.wake();
        }
    }
}

impl MiniState {
    fn wake(&self) {
        let _ = unistd::write(&self.wake_w, &[1u8]);
    }

    /// One blocking iteration of `context`: poll, then fire due timers,
    /// ready fds, and injected signal/child deliveries.
    fn iterate(&self, context: ContextId, block: bool) {
        let snapshot: Vec<Rc<MiniSource>> = self
            .sources
            .borrow()
            .iter()
            .filter(|source| !source.dead.get() && source.context.get() == Some(context))
            .cloned()
            .collect();

        let now = Instant::now();
        let mut timeout = if block { None } else { Some(Duration::ZERO) };
        for source in &snapshot {
            if let SourceKind::Timer { deadline, .. } = &source.kind {
                let remaining = deadline.get().saturating_duration_since(now);
                timeout = Some(match timeout {
                    Some(current) => current.min(remaining),
                    None => remaining,
                });
            }
        }
        if self.has_deliverable_pending(&snapshot) {
            timeout = Some(Duration::ZERO);
        }

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(snapshot.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wake_r.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let mut fd_watches: Vec<(usize, Rc<MiniSource>)> = Vec::new();
        for source in &snapshot {
            if let SourceKind::Fd { fd, interest } = &source.kind {
                let events = match interest {
                    FdInterest::Read => libc::POLLIN,
                    FdInterest::Write => libc::POLLOUT,
                };
                fd_watches.push((fds.len(), Rc::clone(source)));
                fds.push(libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                });
            }
        }

        let _ = poll_fds(&mut fds, timeout);

        if fds[0].revents != 0 {
            let mut buf = [0u8; 64];
            while matches!(
                unistd::read(self.wake_r.as_raw_fd(), &mut buf),
                Ok(n) if n > 0
            ) {}
        }

        let now = Instant::now();
        for source in &snapshot {
            if source.dead.get() {
                continue;
            }
            if let SourceKind::Timer {
                deadline,
                interval,
                repeat,
            } = &source.kind
            {
                if deadline.get() <= now {
                    if *repeat {
                        deadline.set(now + *interval);
                    }
                    self.fire(source, WatchEvent::Ready, *repeat);
                }
            }
        }

        for (index, source) in &fd_watches {
            if source.dead.get() {
                continue;
            }
            let hot = libc::POLLIN | libc::POLLOUT | libc::POLLERR | libc::POLLHUP;
            if fds[*index].revents & hot != 0 {
                self.fire(source, WatchEvent::Ready, true);
            }
        }

        let pending_signals = std::mem::take(&mut *self.pending_signals.borrow_mut());
        for signum in pending_signals {
            let target = snapshot
                .iter()
                .find(|source| {
                    !source.dead.get()
                        && matches!(source.kind, SourceKind::Signal(s) if s == signum)
                })
                .cloned();
            match target {
                Some(source) => self.fire(&source, WatchEvent::Ready, true),
                // No watch on this context yet; keep it queued.
                None => self.pending_signals.borrow_mut().push(signum),
            }
        }

        let pending_children = std::mem::take(&mut *self.pending_children.borrow_mut());
        for (pid, status) in pending_children {
            let target = snapshot
                .iter()
                .find(|source| {
                    !source.dead.get() && matches!(source.kind, SourceKind::Child(p) if p == pid)
                })
                .cloned();
            match target {
                Some(source) => self.fire(&source, WatchEvent::ChildExited { status }, false),
                None => self.pending_children.borrow_mut().push((pid, status)),
            }
        }

        self.sources.borrow_mut().retain(|source| !source.dead.get());
    }

    /// Whether an injected delivery could land on this snapshot. Pendings
    /// with no matching watch must not zero the poll timeout, or an idle
    /// run would spin.
    fn has_deliverable_pending(&self, snapshot: &[Rc<MiniSource>]) -> bool {
        let signals = self.pending_signals.borrow();
        let children = self.pending_children.borrow();
        snapshot.iter().any(|source| {
            if source.dead.get() {
                return false;
            }
            match &source.kind {
                SourceKind::Signal(signum) => signals.contains(signum),
                SourceKind::Child(pid) => children.iter().any(|(p, _)| p == pid),
                _ => false,
            }
        })
    }

    /// Runs one source callback with the slot taken out, so the callback
    /// may destroy its own source or attach new ones.
    fn fire(&self, source: &Rc<MiniSource>, event: WatchEvent, default_keep: bool) {
        let callback = source.callback.borrow_mut().take();
        let Some(mut callback) = callback else {
            return;
        };
        let action = callback(event);
        if !source.dead.get() {
            *source.callback.borrow_mut() = Some(callback);
        }
        if !(default_keep && action == WatchAction::Continue) {
            source.dead.set(true);
        }
    }
}

fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timespec = timeout.map(|timeout| libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = timespec
        .as_ref()
        .map_or(std::ptr::null(), |spec| spec as *const libc::timespec);
    let code = unsafe {
        libc::ppoll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timespec_ptr,
            std::ptr::null(),
        )
    };
    if code >= 0 {
        Ok(code as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_repeats_until_removed() {
        let mini = MiniLoop::new();
        let backend = mini.backend();
        let context = backend.new_context();
        let main = backend.main_loop(&context);

        let hits = Rc::new(Cell::new(0u32));
        let mut source = backend.timer_watch(Duration::from_millis(1), true);
        let seen = Rc::clone(&hits);
        let quitter = Rc::clone(&main);
        source.set_callback(Box::new(move |_| {
            seen.set(seen.get() + 1);
            if seen.get() == 3 {
                quitter.quit();
                WatchAction::Remove
            } else {
                WatchAction::Continue
            }
        }));
        source.attach(&context);

        main.run();
        assert_eq!(hits.get(), 3);
        assert_eq!(mini.live_sources(&context), 0);
        assert_eq!(mini.main_quit_count(), 1);
    }

    #[test]
    fn test_injected_signal_goes_to_first_matching_watch() {
        let mini = MiniLoop::new();
        let backend = mini.backend();
        let context = backend.new_context();
        let main = backend.main_loop(&context);

        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&order);
        let quitter = Rc::clone(&main);
        let mut a = backend.signal_watch(libc::SIGUSR1).unwrap();
        a.set_callback(Box::new(move |_| {
            first.borrow_mut().push("first");
            quitter.quit();
            WatchAction::Continue
        }));
        a.attach(&context);

        let second = Rc::clone(&order);
        let mut b = backend.signal_watch(libc::SIGUSR1).unwrap();
        b.set_callback(Box::new(move |_| {
            second.borrow_mut().push("second");
            WatchAction::Continue
        }));
        b.attach(&context);

        mini.deliver_signal(libc::SIGUSR1);
        main.run();
        assert_eq!(*order.borrow(), vec!["first"]);
    }

    #[test]
    fn test_destroy_from_inside_own_callback() {
        let mini = MiniLoop::new();
        let backend = mini.backend();
        let context = backend.new_context();
        let main = backend.main_loop(&context);

        // A pipe's write end reports writable immediately.
        let (_pipe_r, pipe_w) =
            unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();

        let slot: Rc<RefCell<Option<Box<dyn WatchSource>>>> = Rc::new(RefCell::new(None));
        let mut source = backend.fd_watch(pipe_w.as_raw_fd(), FdInterest::Write);
        let own = Rc::clone(&slot);
        let quitter = Rc::clone(&main);
        source.set_callback(Box::new(move |_| {
            if let Some(mut source) = own.borrow_mut().take() {
                source.destroy();
                source.destroy();
            }
            quitter.quit();
            WatchAction::Continue
        }));
        source.attach(&context);
        *slot.borrow_mut() = Some(source);

        main.run();
        assert_eq!(mini.live_sources(&context), 0);
    }

    #[test]
    fn test_refuses_uncatchable_signals() {
        let mini = MiniLoop::new();
        let backend = mini.backend();
        assert!(backend.signal_watch(libc::SIGKILL).is_none());
        assert!(backend.signal_watch(libc::SIGSTOP).is_none());
        assert!(backend.signal_watch(libc::SIGINT).is_some());
    }

    #[test]
    fn test_pending_delivery_waits_for_a_matching_watch() {
        let mini = MiniLoop::new();
        let backend = mini.backend();
        let context = backend.new_context();

        // Inject before any watch exists; then attach one and run.
        mini.deliver_child_exit(7, 9);

        let main = backend.main_loop(&context);
        let seen: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
        let sink = Rc::clone(&seen);
        let quitter = Rc::clone(&main);
        let mut source = backend.child_watch(7);
        source.set_callback(Box::new(move |event| {
            if let WatchEvent::ChildExited { status } = event {
                sink.set(Some(status));
            }
            quitter.quit();
            WatchAction::Remove
        }));
        source.attach(&context);

        main.run();
        assert_eq!(seen.get(), Some(9));
        assert_eq!(mini.live_sources(&context), 0);
    }
}
