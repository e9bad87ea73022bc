use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admits one nonce-consuming call at a time against a chain. Later callers queue in FIFO order.
#[derive(Debug, Clone)]
pub struct MutationGate {
    permits: Arc<Semaphore>,
}

impl Default for MutationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationGate {
    pub fn new() -> Self {
        MutationGate {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for our turn. The call is admitted until the returned permit is dropped.
    pub async fn enter(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed, so acquiring cannot fail.
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("mutation gate semaphore closed"),
        }
    }
}
