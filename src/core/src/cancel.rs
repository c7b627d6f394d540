//! Cancellation signalling for builds and publishes.
//!
//! A `CancelToken` is a cheap-to-clone broadcast flag threaded through
//! every build/publish call. Cancelling it wakes all waiters; child
//! processes observing it are killed by their owners.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable, broadcast cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation. All current and future waiters observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the token is cancelled. Returns immediately if it
    /// already was. Pends forever on a token that is never cancelled,
    /// so callers race it against real work in a `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside every clone of this token, so wait_for
        // only errors once every token is gone; pend in that case.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
