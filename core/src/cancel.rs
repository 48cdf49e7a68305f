//! Cooperative cancellation primitive.
//!
//! An `AbortHandle`/`AbortSignal` pair built on a `tokio::sync::watch`
//! channel. The handle records an abort reason exactly once (the first
//! abort wins; later calls are no-ops); any number of signal clones can
//! poll the state or await it. Cancellation is cooperative: the transport
//! is expected to check the signal and stop delivering data early, and the
//! facade additionally races the signal so a transport that ignores it
//! still resolves as aborted.

use std::sync::Arc;

use tokio::sync::watch;

/// Reason recorded when an abort is requested without one.
pub const DEFAULT_ABORT_REASON: &str = "Aborted";

/// Create a connected handle/signal pair.
pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

/// Requests cancellation. Cheap to clone; all clones refer to the same
/// operation.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl AbortHandle {
    /// Request cancellation. `None` records [`DEFAULT_ABORT_REASON`].
    /// Idempotent: only the first call's reason is kept.
    pub fn abort(&self, reason: Option<&str>) {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.unwrap_or(DEFAULT_ABORT_REASON).to_string());
            true
        });
    }
}

/// Observes cancellation. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The recorded abort reason, if cancellation has been requested.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// handle is dropped without aborting.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
