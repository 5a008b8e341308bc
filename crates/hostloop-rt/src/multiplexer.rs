use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;
use polling::{Events, PollMode, Poller};
use slab::Slab;

use crate::interest::Interest;
use crate::isolate::run_isolated;

/// Invoked on the loop thread with the descriptor that became ready.
pub type FdCallback = Box<dyn FnMut(RawFd) + Send + 'static>;

/// A descriptor the multiplexer watches.
pub struct Registration {
    fd: RawFd,
    interest: Interest,
    callback: FdCallback,
}

impl Registration {
    pub fn new<F>(fd: RawFd, interest: Interest, callback: F) -> Self
    where
        F: FnMut(RawFd) + Send + 'static,
    {
        Registration {
            fd,
            interest,
            callback: Box::new(callback),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .finish_non_exhaustive()
    }
}

/// A registration change waiting for the next apply point.
#[derive(Debug)]
pub enum PendingChange {
    Add(Registration),
    Remove(RawFd),
}

/// Registrations that dispatch passes iterate over. Only touched while holding
/// the dispatch lock, i.e. on the loop thread.
struct LiveSet {
    /// Slab key doubles as the poller event key.
    sources: Slab<Registration>,
    keys: HashMap<RawFd, usize>,
}

/// Watches a changing set of descriptors and runs their callbacks when ready.
///
/// Any thread may call [`register_callback`] and [`unregister_callback`]; the
/// change is queued and only becomes live at the start of the next dispatch
/// pass (or right after a callback returns, which ends that pass). A pass
/// therefore never sees the live set change underneath it.
///
/// [`register_callback`]: FdMultiplexer::register_callback
/// [`unregister_callback`]: FdMultiplexer::unregister_callback
pub struct FdMultiplexer {
    poller: Poller,
    pending: ConcurrentQueue<PendingChange>,
    live: Mutex<LiveSet>,
    /// Copy of the live set taken at each apply point, so it can be read
    /// while a pass holds `live`.
    snapshot: Mutex<Vec<(RawFd, Interest)>>,
    events: Mutex<Events>,
    dispatching: AtomicBool,
}

impl FdMultiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(FdMultiplexer {
            poller: Poller::new()?,
            pending: ConcurrentQueue::unbounded(),
            live: Mutex::new(LiveSet {
                sources: Slab::with_capacity(16),
                keys: HashMap::new(),
            }),
            snapshot: Mutex::new(Vec::new()),
            events: Mutex::new(Events::new()),
            dispatching: AtomicBool::new(false),
        })
    }

    // ── Registration (any thread) ──────────────────────────────────

    /// Queue `callback` to run whenever `fd` matches `interest`.
    ///
    /// Replaces any earlier registration for the same descriptor. The caller
    /// keeps ownership of `fd` and must unregister it before closing it.
    pub fn register_callback<F>(&self, fd: RawFd, interest: Interest, callback: F)
    where
        F: FnMut(RawFd) + Send + 'static,
    {
        self.submit(PendingChange::Add(Registration::new(fd, interest, callback)));
    }

    /// Queue removal of `fd`. Unknown descriptors are ignored at apply time.
    pub fn unregister_callback(&self, fd: RawFd) {
        self.submit(PendingChange::Remove(fd));
    }

    fn submit(&self, change: PendingChange) {
        // Unbounded and never closed, so push cannot fail.
        let _ = self.pending.push(change);
        // Break a sleeping loop thread out of its wait so the change lands now
        // instead of after the idle timeout.
        if let Err(err) = self.notify() {
            tracing::warn!(message = "failed to notify poller", ?err);
        }
    }

    /// Interrupt a concurrent [`sleep_until_next_event`](Self::sleep_until_next_event).
    pub fn notify(&self) -> io::Result<()> {
        self.poller.notify()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    // ── Dispatch (loop thread) ─────────────────────────────────────

    /// Run one dispatch pass. Returns true if any callback fired.
    ///
    /// If a callback queues registration changes, they are applied right after
    /// it returns and the pass ends early. Call again to pick up the remaining
    /// ready descriptors.
    ///
    /// Callbacks must not call back into `dispatch_pending_events`; a nested
    /// call is refused and returns `Ok(false)`.
    pub fn dispatch_pending_events(&self) -> io::Result<bool> {
        if self.dispatching.swap(true, Ordering::Acquire) {
            tracing::warn!(message = "nested dispatch_pending_events ignored");
            return Ok(false);
        }
        let result = self.dispatch_pass();
        self.dispatching.store(false, Ordering::Release);
        result
    }

    fn dispatch_pass(&self) -> io::Result<bool> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);

        // 1. Apply point.
        self.apply(&mut live);

        // 2. Non-blocking poll over the live set.
        let ready: Vec<usize> = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.clear();
            retry_interrupted(|| self.poller.wait(&mut events, Some(Duration::ZERO)))?;
            events.iter().map(|ev| ev.key).collect()
        };

        // 3. Nothing ready.
        if ready.is_empty() {
            return Ok(false);
        }

        // 4. Run callbacks for ready descriptors.
        let mut fired = false;
        for key in ready {
            let Some(registration) = live.sources.get_mut(key) else {
                continue;
            };
            let fd = registration.fd;
            let callback = &mut registration.callback;
            run_isolated("fd callback", || callback(fd));
            fired = true;

            // 5. The callback changed registrations: the ready list may now
            // point at removed or reused keys.
            if self.apply(&mut live) {
                return Ok(true);
            }
        }

        Ok(fired)
    }

    /// Block until a live descriptor is ready, a registration change is
    /// submitted, or `timeout` elapses. Does not apply pending changes.
    pub fn sleep_until_next_event(&self, timeout: Duration) -> io::Result<()> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.clear();
        match self.poller.wait(&mut events, Some(timeout)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Apply queued changes outside a dispatch pass. Used during teardown so
    /// removed callbacks (and whatever they capture) drop deterministically.
    pub fn apply_pending_changes(&self) -> bool {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply(&mut live)
    }

    /// Live registrations as of the last apply point, ordered by descriptor.
    /// Safe to call from any thread, including from inside a callback.
    pub fn registered_fds(&self) -> Vec<(RawFd, Interest)> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Apply point ────────────────────────────────────────────────

    /// Apply the changes queued so far, in submission order. Changes queued
    /// while applying (e.g. from a dropped callback) wait for the next apply
    /// point. Returns true if anything was applied.
    fn apply(&self, live: &mut LiveSet) -> bool {
        let batch = self.pending.len();
        let mut applied = 0;
        while applied < batch {
            let Ok(change) = self.pending.pop() else {
                break;
            };
            applied += 1;
            match change {
                PendingChange::Add(registration) => self.apply_add(live, registration),
                PendingChange::Remove(fd) => self.apply_remove(live, fd),
            }
        }

        if applied > 0 {
            let mut fds: Vec<_> = live
                .sources
                .iter()
                .map(|(_, reg)| (reg.fd, reg.interest))
                .collect();
            fds.sort_by_key(|(fd, _)| *fd);
            *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = fds;
        }
        applied > 0
    }

    fn apply_add(&self, live: &mut LiveSet, registration: Registration) {
        let fd = registration.fd;
        let interest = registration.interest;

        if let Some(&key) = live.keys.get(&fd) {
            // SAFETY: fd is live in the poller; the registrant keeps it open
            // until it unregisters.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(err) =
                self.poller
                    .modify_with_mode(&borrowed, interest.to_event(key), PollMode::Level)
            {
                tracing::warn!(message = "failed to update registration", fd, ?err);
            }
            live.sources[key] = registration;
            tracing::debug!(message = "replaced fd registration", fd, ?interest);
            return;
        }

        let entry = live.sources.vacant_entry();
        let key = entry.key();
        // SAFETY: the fd is deleted from the poller in apply_remove, which the
        // registrant triggers before closing it.
        let added =
            unsafe { self.poller.add_with_mode(fd, interest.to_event(key), PollMode::Level) };
        match added {
            Ok(()) => {
                entry.insert(registration);
                live.keys.insert(fd, key);
                tracing::debug!(message = "registered fd", fd, ?interest);
            }
            Err(err) => {
                tracing::warn!(message = "failed to register fd", fd, ?err);
            }
        }
    }

    fn apply_remove(&self, live: &mut LiveSet, fd: RawFd) {
        let Some(key) = live.keys.remove(&fd) else {
            return;
        };
        // SAFETY: only used for the delete call below.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        // Ignore errors: the fd may already be closed by its owner.
        let _ = self.poller.delete(&borrowed);
        // Last: the callback may own the fd and close it on drop.
        drop(live.sources.remove(key));
        tracing::debug!(message = "unregistered fd", fd);
    }
}

/// Run `op` again for as long as it fails with `Interrupted`.
fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

impl fmt::Debug for FdMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdMultiplexer")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Drop for FdMultiplexer {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, reg) in live.sources.iter() {
            // SAFETY: only used for the delete call below.
            let borrowed = unsafe { BorrowedFd::borrow_raw(reg.fd) };
            let _ = self.poller.delete(&borrowed);
        }
    }
}
