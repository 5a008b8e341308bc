use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::config::{LoopConfig, QuitCallback};
use crate::error::LoopError;
use crate::interest::Interest;
use crate::interrupt::InterruptFlag;
use crate::isolate::run_isolated;
use crate::multiplexer::FdMultiplexer;
use crate::queue::MessageQueue;

/// State reachable from [`LoopHandle`]s on other threads.
struct Shared {
    mux: FdMultiplexer,
    queue: Arc<MessageQueue>,
    quit_requested: AtomicBool,
}

impl Shared {
    fn request_quit(&self) {
        if !self.quit_requested.swap(true, Ordering::SeqCst) {
            // Cut a blocking dispatch's idle sleep short.
            if let Err(err) = self.mux.notify() {
                tracing::warn!(message = "failed to wake loop for quit", ?err);
            }
        }
    }
}

/// The loop context: one fd multiplexer plus the message queue wired into it.
///
/// Created on, and pumped by, the host's main thread. It never spawns a thread
/// of its own; the host calls [`dispatch_next`](Self::dispatch_next) from its
/// main loop. Other threads talk to it through a [`LoopHandle`].
///
/// ```no_run
/// use hostloop_rt::{EventLoop, LoopConfig};
///
/// let event_loop = EventLoop::create(LoopConfig::default())?;
/// let handle = event_loop.handle();
/// std::thread::spawn(move || {
///     handle.post(|| println!("hello from the loop thread"));
/// });
///
/// while !event_loop.is_quit_requested() {
///     event_loop.dispatch_next(false)?;
/// }
/// event_loop.shutdown();
/// # Ok::<(), hostloop_rt::LoopError>(())
/// ```
pub struct EventLoop {
    shared: Arc<Shared>,
    interrupt: Option<InterruptFlag>,
    on_quit: Mutex<Option<QuitCallback>>,
    quit_delivered: AtomicBool,
    idle_timeout: Duration,
    loop_thread: ThreadId,
    torn_down: bool,
}

impl EventLoop {
    /// Set up the multiplexer, the wakeup channel and, if configured, the
    /// SIGINT handler. The calling thread becomes the loop thread.
    pub fn create(config: LoopConfig) -> Result<Self, LoopError> {
        let LoopConfig {
            max_bytes_in_socket_queue,
            idle_timeout,
            install_interrupt_handler,
            on_quit,
        } = config;

        let mux = FdMultiplexer::new().map_err(LoopError::PollerCreation)?;
        let queue = MessageQueue::new(max_bytes_in_socket_queue)
            .map(Arc::new)
            .map_err(LoopError::ChannelCreation)?;

        let drain_queue = Arc::clone(&queue);
        mux.register_callback(queue.read_fd(), Interest::READABLE, move |_| {
            drain_queue.drain();
        });

        let interrupt = if install_interrupt_handler {
            Some(InterruptFlag::install()?)
        } else {
            None
        };

        tracing::debug!(
            message = "event loop created",
            max_bytes_in_socket_queue,
            ?idle_timeout
        );

        Ok(EventLoop {
            shared: Arc::new(Shared {
                mux,
                queue,
                quit_requested: AtomicBool::new(false),
            }),
            interrupt,
            on_quit: Mutex::new(on_quit),
            quit_delivered: AtomicBool::new(false),
            idle_timeout,
            loop_thread: thread::current().id(),
            torn_down: false,
        })
    }

    /// A `Send + Sync` handle for posting and registering from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ── Cross-thread entry points ──────────────────────────────────

    /// Queue `f` to run on the loop thread. Returns false once the loop is
    /// shutting down.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.post(f)
    }

    /// See [`FdMultiplexer::register_callback`].
    pub fn register_fd_callback<F>(&self, fd: RawFd, interest: Interest, callback: F)
    where
        F: FnMut(RawFd) + Send + 'static,
    {
        self.shared.mux.register_callback(fd, interest, callback);
    }

    /// See [`FdMultiplexer::unregister_callback`].
    pub fn unregister_fd_callback(&self, fd: RawFd) {
        self.shared.mux.unregister_callback(fd);
    }

    /// Ask the host to wind down. The quit callback runs on the loop thread
    /// during the next dispatch.
    pub fn request_quit(&self) {
        self.shared.request_quit();
    }

    pub fn is_quit_requested(&self) -> bool {
        self.shared.quit_requested.load(Ordering::SeqCst)
    }

    // ── Loop thread ────────────────────────────────────────────────

    /// Dispatch whatever is ready. Returns `Ok(true)` if anything ran.
    ///
    /// With `return_if_idle` false, an idle loop sleeps in bounded steps of
    /// the configured idle timeout until something happens, or until a quit
    /// is requested (then it returns `Ok(false)`).
    ///
    /// Must not be called concurrently with itself, and only from the thread
    /// that created the loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::NotLoopThread`] from a foreign thread, [`LoopError::Poll`]
    /// if the OS poller fails.
    pub fn dispatch_next(&self, return_if_idle: bool) -> Result<bool, LoopError> {
        if !self.is_loop_thread() {
            return Err(LoopError::NotLoopThread);
        }

        loop {
            self.check_quit();

            if self
                .shared
                .mux
                .dispatch_pending_events()
                .map_err(LoopError::Poll)?
            {
                return Ok(true);
            }

            if return_if_idle || self.is_quit_requested() {
                return Ok(false);
            }

            self.shared
                .mux
                .sleep_until_next_event(self.idle_timeout)
                .map_err(LoopError::Poll)?;
        }
    }

    /// Turn a raised interrupt flag into a quit request and deliver the quit
    /// callback, once.
    fn check_quit(&self) {
        if self.interrupt.as_ref().is_some_and(InterruptFlag::take) {
            tracing::warn!(message = "interrupt received, requesting quit");
            self.shared.request_quit();
        }

        if self.is_quit_requested() && !self.quit_delivered.swap(true, Ordering::SeqCst) {
            let mut on_quit = self.on_quit.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(callback) = on_quit.as_mut() {
                run_isolated("quit callback", callback);
            }
        }
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Live descriptor registrations as of the last apply point, including
    /// the loop's own wakeup socket. Callable from callbacks and messages.
    pub fn registered_fds(&self) -> Vec<(RawFd, Interest)> {
        self.shared.mux.registered_fds()
    }

    pub fn pending_messages(&self) -> usize {
        self.shared.queue.len()
    }

    /// Descriptor of the wakeup socket, for hosts that want to fold it into
    /// their own poll set.
    pub fn wakeup_fd(&self) -> RawFd {
        self.shared.queue.read_fd()
    }

    /// Tear the loop down: refuse further posts, drop queued messages and
    /// registrations, remove the signal handler.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let discarded = self.shared.queue.close();
        self.shared.mux.unregister_callback(self.shared.queue.read_fd());
        self.shared.mux.apply_pending_changes();
        self.interrupt = None;

        tracing::debug!(message = "event loop shut down", discarded);
    }

    #[cfg(test)]
    fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("queue", &self.shared.queue)
            .field("quit_requested", &self.is_quit_requested())
            .field("idle_timeout", &self.idle_timeout)
            .field("loop_thread", &self.loop_thread)
            .finish_non_exhaustive()
    }
}

/// Cross-thread handle to an [`EventLoop`].
///
/// Holds no strong reference; every call fails fast once the loop has been
/// shut down.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Weak<Shared>,
}

impl LoopHandle {
    /// Queue `f` to run on the loop thread. Returns false if the loop is gone
    /// or shutting down.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.queue.post(f),
            None => false,
        }
    }

    /// # Errors
    ///
    /// [`LoopError::ShutDown`] if the loop is gone.
    pub fn register_fd_callback<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: F,
    ) -> Result<(), LoopError>
    where
        F: FnMut(RawFd) + Send + 'static,
    {
        let shared = self.upgrade()?;
        shared.mux.register_callback(fd, interest, callback);
        Ok(())
    }

    /// # Errors
    ///
    /// [`LoopError::ShutDown`] if the loop is gone.
    pub fn unregister_fd_callback(&self, fd: RawFd) -> Result<(), LoopError> {
        self.upgrade()?.mux.unregister_callback(fd);
        Ok(())
    }

    /// # Errors
    ///
    /// [`LoopError::ShutDown`] if the loop is gone.
    pub fn request_quit(&self) -> Result<(), LoopError> {
        self.upgrade()?.request_quit();
        Ok(())
    }

    /// See [`EventLoop::registered_fds`].
    ///
    /// # Errors
    ///
    /// [`LoopError::ShutDown`] if the loop is gone.
    pub fn registered_fds(&self) -> Result<Vec<(RawFd, Interest)>, LoopError> {
        Ok(self.upgrade()?.mux.registered_fds())
    }

    pub fn is_alive(&self) -> bool {
        self.upgrade().is_ok_and(|shared| !shared.queue.is_closed())
    }

    fn upgrade(&self) -> Result<Arc<Shared>, LoopError> {
        self.shared.upgrade().ok_or(LoopError::ShutDown)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
