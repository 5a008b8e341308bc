use std::fmt;
use std::time::Duration;

/// Default cap on unread wakeup bytes sitting in the socket pair.
pub const MAX_BYTES_IN_SOCKET_QUEUE: usize = 128;

/// How long an idle blocking dispatch sleeps before re-checking the
/// interrupt flag.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Called on the loop thread when an orderly shutdown is requested.
pub type QuitCallback = Box<dyn FnMut() + Send + 'static>;

/// Settings for [`EventLoop::create`](crate::EventLoop::create).
///
/// ```
/// use std::time::Duration;
/// use hostloop_rt::LoopConfig;
///
/// let config = LoopConfig::new()
///     .idle_timeout(Duration::from_millis(100))
///     .install_interrupt_handler(true);
/// assert_eq!(config.max_bytes(), 128);
/// ```
pub struct LoopConfig {
    pub(crate) max_bytes_in_socket_queue: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) install_interrupt_handler: bool,
    pub(crate) on_quit: Option<QuitCallback>,
}

impl LoopConfig {
    pub fn new() -> Self {
        Self {
            max_bytes_in_socket_queue: MAX_BYTES_IN_SOCKET_QUEUE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            install_interrupt_handler: false,
            on_quit: None,
        }
    }

    /// Cap on outstanding one-byte wakeup tokens. Posts beyond the cap still
    /// enqueue, they just skip the socket write.
    pub fn max_bytes_in_socket_queue(mut self, n: usize) -> Self {
        assert!(n > 0, "max_bytes_in_socket_queue must be > 0");

        self.max_bytes_in_socket_queue = n;
        self
    }

    /// Upper bound on a single idle sleep inside a blocking dispatch.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Capture SIGINT into a flag that the dispatch driver turns into a quit
    /// request. Standalone applications want this; plugins leave signals to
    /// the host.
    pub fn install_interrupt_handler(mut self, enabled: bool) -> Self {
        self.install_interrupt_handler = enabled;
        self
    }

    /// Run `f` on the loop thread when a quit is requested.
    pub fn on_quit<F>(mut self, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_quit = Some(Box::new(f));
        self
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes_in_socket_queue
    }

    pub fn timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopConfig")
            .field("max_bytes_in_socket_queue", &self.max_bytes_in_socket_queue)
            .field("idle_timeout", &self.idle_timeout)
            .field("install_interrupt_handler", &self.install_interrupt_handler)
            .field("on_quit", &self.on_quit.is_some())
            .finish()
    }
}
