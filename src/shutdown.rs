//! Process-wide shutdown signal
//!
//! A cheap, cloneable context handed to everything that has to stop: the
//! signal task only calls [`ShutdownContext::request`], async tasks await
//! [`ShutdownContext::cancelled`], and the blocking reader thread sleeps
//! through [`ShutdownContext::sleep`] so a pending reconnect delay ends early.
//!
//! Requesting shutdown performs no device I/O. Unblocking a reader parked in
//! the kernel is the orchestrator's job (see `ConnectionManager::wake_reader`).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
struct Flag {
    requested: Mutex<bool>,
    changed: Condvar,
}

#[derive(Clone, Debug, Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    flag: Arc<Flag>,
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread-safe and idempotent.
    pub fn request(&self) {
        let mut requested = self.flag.requested.lock().unwrap_or_else(|e| e.into_inner());
        if !*requested {
            info!("Shutdown requested");
            *requested = true;
        }
        self.flag.changed.notify_all();
        drop(requested);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Blocks for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the sleep ended because of a shutdown request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let requested = self.flag.requested.lock().unwrap_or_else(|e| e.into_inner());
        let (requested, _) = self
            .flag
            .changed
            .wait_timeout_while(requested, duration, |requested| !*requested)
            .unwrap_or_else(|e| e.into_inner());
        *requested
    }
}
