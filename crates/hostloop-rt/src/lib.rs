//! hostloop-rt: a single-threaded event loop for code that lives inside
//! somebody else's main loop (a plugin inside a DAW, an extension inside an
//! editor).
//!
//! Two pieces, wired together by [`EventLoop`]:
//!
//! - [`FdMultiplexer`] watches a changing set of file descriptors and runs
//!   their callbacks. Registration changes from any thread are buffered and
//!   applied only between dispatch passes.
//! - [`MessageQueue`] lets any thread post closures to the loop thread. A
//!   socket pair, registered with the multiplexer, wakes the loop.
//!
//! The host pumps the loop by calling [`EventLoop::dispatch_next`]; nothing
//! here spawns a thread. Hosts that are not written in Rust use the C ABI in
//! `ffi.rs` (`hostloop_create`, `hostloop_dispatch_next`, ...).

mod config;
mod error;
mod event_loop;
mod ffi;
mod interest;
mod interrupt;
mod isolate;
mod multiplexer;
mod queue;

pub use config::{LoopConfig, QuitCallback, DEFAULT_IDLE_TIMEOUT, MAX_BYTES_IN_SOCKET_QUEUE};
pub use error::LoopError;
pub use event_loop::{EventLoop, LoopHandle};
pub use ffi::{HostloopCallback, HostloopFdCallback};
pub use interest::Interest;
pub use interrupt::InterruptFlag;
pub use multiplexer::{FdCallback, FdMultiplexer, PendingChange, Registration};
pub use queue::{Message, MessageQueue};
