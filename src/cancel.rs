//! Session-wide cancellation signal.
//!
//! One `Cancellation` is created per seeding run and handed to the bridge,
//! the worker pool and the event consumer. It wraps a `watch` channel in the
//! same `watch::Receiver<bool>` shutdown style the background workers use.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once `rx` observes cancellation (immediately if it already has).
///
/// A dropped sender counts as cancelled.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_subscribers() {
        let cancel = Cancellation::new();
        let mut rx = cancel.subscribe();

        let waiter = tokio::spawn(async move {
            cancelled(&mut rx).await;
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_cancel() {
        let cancel = Cancellation::new();
        cancel.cancel();
        cancel.cancel();

        let mut rx = cancel.subscribe();
        tokio::time::timeout(Duration::from_millis(100), cancelled(&mut rx))
            .await
            .expect("already cancelled");
    }
}
