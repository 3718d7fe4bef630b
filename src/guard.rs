/// Concurrency Guard
///
/// Single-slot async mutex serializing sync passes, plus a cancellation
/// token backing every interruptible delay. `abort()` cancels the token,
/// then waits for the slot to become free: once it returns no pass is
/// running and none can start on this guard.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IndexerError, Result};

#[derive(Debug, Default)]
pub struct ProcessorGuard {
    slot: Mutex<()>,
    cancel: CancellationToken,
}

/// Held for the duration of a pass
pub type PassPermit<'a> = MutexGuard<'a, ()>;

impl ProcessorGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the slot. Fails with `Aborted` if the guard was aborted
    /// before or while waiting.
    pub async fn enter(&self) -> Result<PassPermit<'_>> {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IndexerError::Aborted),
            permit = self.slot.lock() => permit,
        };
        if self.cancel.is_cancelled() {
            return Err(IndexerError::Aborted);
        }
        Ok(permit)
    }

    /// Sleep for `duration`, or fail with `Aborted` as soon as the guard is aborted
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(IndexerError::Aborted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A pass currently holds the slot
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Cancel outstanding delays and wait for the running pass to finish
    pub async fn abort(&self) {
        self.cancel.cancel();
        let _idle = self.slot.lock().await;
        debug!("Processor guard idle after abort");
    }
}
