//! SIGINT capture for standalone hosts.
//!
//! The signal handler only stores `true` into an atomic flag (via
//! [`signal_hook::flag`]). Reacting to it is the dispatch driver's job, on the
//! loop thread, outside signal context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::SIGINT;
use signal_hook::SigId;

use crate::error::LoopError;

#[derive(Debug)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
    sig_id: Option<SigId>,
}

impl InterruptFlag {
    /// Install a SIGINT handler that raises this flag.
    pub fn install() -> Result<Self, LoopError> {
        let flag = Arc::new(AtomicBool::new(false));
        let sig_id = signal_hook::flag::register(SIGINT, Arc::clone(&flag))
            .map_err(LoopError::SignalHandler)?;
        tracing::debug!(message = "installed SIGINT handler");
        Ok(InterruptFlag {
            flag,
            sig_id: Some(sig_id),
        })
    }

    /// A flag with no signal handler attached; only [`raise`](Self::raise)
    /// sets it.
    pub fn detached() -> Self {
        InterruptFlag {
            flag: Arc::new(AtomicBool::new(false)),
            sig_id: None,
        }
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

impl Drop for InterruptFlag {
    fn drop(&mut self) {
        if let Some(sig_id) = self.sig_id.take() {
            signal_hook::low_level::unregister(sig_id);
        }
    }
}
