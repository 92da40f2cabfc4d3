//! Readiness board: bounded waits for collaborators declaring themselves ready.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Timed out after {timeout_ms}ms waiting for {id} to become ready")]
    Timeout { id: String, timeout_ms: u64 },
}

/// Tracks which components have declared themselves ready.
#[derive(Default)]
pub struct ReadinessBoard {
    slots: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ReadinessBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> watch::Receiver<bool> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Declare `id` ready, waking every waiter.
    pub fn mark_ready(&self, id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(false).0);
        tx.send_replace(true);
        debug!(component = %id, "Component ready");
    }

    pub fn is_ready(&self, id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(id).map(|tx| *tx.borrow()).unwrap_or(false)
    }

    /// Forget `id`. Pending waiters keep waiting until their timeout.
    pub fn forget(&self, id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(id);
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.clear();
    }

    /// Wait until `id` is ready, or fail with [`ReadinessError::Timeout`].
    pub async fn wait_ready(&self, id: &str, timeout: Duration) -> Result<(), ReadinessError> {
        let mut rx = self.slot(id);
        let wait = async {
            // A dropped sender (forget/clear) leaves the waiter pending until the deadline.
            let closed = rx.wait_for(|ready| *ready).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ReadinessError::Timeout {
                id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }
}
