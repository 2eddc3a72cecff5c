//! Counter of outstanding supervision tasks for one CLI invocation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable wait-group. Every clone observes the same counter.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn add(&self, n: usize) {
        self.count.send_modify(|count| *count += n);
    }

    /// Decrement by one. Saturates at zero.
    pub fn done(&self) {
        self.count
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once the counter reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Wait for zero, giving up after `timeout`. Returns true if drained.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
