//! Cooperative cancellation
//!
//! An [`AbortHandle`] lives with whoever wants to cancel, the matching
//! [`AbortSignal`] travels with the transfer. Aborting sends one ERROR packet
//! to the peer and ends the transfer with [`crate::Error::Aborted`].

use std::future::pending;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ErrorKind;

/// Create a connected handle and signal
///
/// # Examples
/// ```
/// let (handle, signal) = tftp::abort_pair();
/// assert!(!signal.is_aborted());
/// handle.abort();
/// assert_eq!(signal.reason().as_deref(), Some("Aborted"));
/// ```
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl AbortHandle {
    /// Abort with the default message
    pub fn abort(&self) {
        self.abort_with(ErrorKind::Abort.message());
    }

    /// Abort with a custom message for the peer
    ///
    /// Only the first reason sticks.
    pub fn abort_with(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve once an abort is requested
    ///
    /// Never resolves if every handle is dropped without aborting.
    pub async fn aborted(&mut self) -> String {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                pending::<()>().await;
            }
        }
    }
}
