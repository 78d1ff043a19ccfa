use std::future::Future;

use tokio::sync::Semaphore;

use super::ProtocolError;

/// Serializes calls into a worker.
///
/// Holders run one at a time. Waiters are served in arrival order.
#[derive(Debug)]
pub struct CallQueue {
    permits: Semaphore,
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallQueue {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    /// Run `call` once every earlier caller has finished.
    pub async fn lock<F, T>(&self, call: F) -> Result<T, ProtocolError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| ProtocolError::Disposed)?;
        Ok(call.await)
    }

    /// Whether a caller currently holds the queue.
    pub fn is_locked(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Reject every queued and future caller.
    pub fn dispose(&self) {
        self.permits.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.permits.is_closed()
    }
}
