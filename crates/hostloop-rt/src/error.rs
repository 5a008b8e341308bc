//! Error type for the event loop.

use std::io;

/// Errors surfaced to the host.
///
/// Failures inside one descriptor callback or one posted message never show up
/// here; they are caught and logged by the dispatch pass. Only initialization
/// failures, OS poll failures and invalid-state misuse propagate.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LoopError {
    /// The OS poller (epoll/kqueue) could not be created.
    #[error("failed to create the OS poller")]
    #[diagnostic(
        code(hostloop::poller_creation),
        help("Check the open file descriptor limit with `ulimit -n`")
    )]
    PollerCreation(#[source] io::Error),

    /// The socket pair used to wake the loop could not be created.
    #[error("failed to create the wakeup channel")]
    #[diagnostic(
        code(hostloop::channel_creation),
        help("Check the open file descriptor limit with `ulimit -n`")
    )]
    ChannelCreation(#[source] io::Error),

    /// Installing or removing the SIGINT handler failed.
    #[error("failed to install the interrupt signal handler")]
    #[diagnostic(code(hostloop::signal_handler))]
    SignalHandler(#[source] io::Error),

    /// Waiting on the OS poller failed with something other than EINTR.
    #[error("polling registered descriptors failed")]
    #[diagnostic(code(hostloop::poll))]
    Poll(#[source] io::Error),

    /// A loop-thread-only operation was called from another thread.
    #[error("dispatch called from a thread that does not own the event loop")]
    #[diagnostic(
        code(hostloop::not_loop_thread),
        help("Only the thread that created the EventLoop may pump it")
    )]
    NotLoopThread,

    /// The event loop has already been shut down.
    #[error("the event loop has been shut down")]
    #[diagnostic(code(hostloop::shut_down))]
    ShutDown,
}
