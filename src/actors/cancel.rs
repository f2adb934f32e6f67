//! Cooperative cancellation of long-running flushes
//!
//! Every flush runs under its own child token, so a cancel only reaches the
//! flush that is running when it is requested.

use std::sync::{Arc, Mutex};

pub use tokio_util::sync::CancellationToken;

/// Hands out one token per flush and cancels the running one on request
#[derive(Debug, Clone, Default)]
pub struct FlushCancellation {
    root: CancellationToken,
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl FlushCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the flush about to start.
    pub fn begin(&self) -> CancellationToken {
        let token = self.root.child_token();
        *self.slot() = Some(token.clone());
        token
    }

    /// Forget the token of the flush that just ended.
    pub fn finish(&self) {
        self.slot().take();
    }

    /// Cancel the running flush. Returns false when none is running.
    pub fn cancel_running(&self) -> bool {
        match self.slot().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_cancel_does_not_reach_next_flush() {
        let cancellation = FlushCancellation::new();
        assert!(!cancellation.cancel_running());

        let token = cancellation.begin();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_only_reaches_running_flush() {
        let cancellation = FlushCancellation::new();
        let first = cancellation.begin();
        assert!(cancellation.clone().cancel_running());
        assert!(first.is_cancelled());
        cancellation.finish();

        let second = cancellation.begin();
        assert!(!second.is_cancelled());
        cancellation.finish();
        assert!(!cancellation.cancel_running());
        assert!(!second.is_cancelled());
    }
}
