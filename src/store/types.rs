//! Public types for the store façade.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::keys::KeyError;
use crate::storage::traits::StorageError;

/// Store lifecycle state.
///
/// Use [`super::Store::lifecycle()`] to check the current state or
/// [`super::Store::lifecycle_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLifecycle {
    /// Constructed; writes queue up, connections stay pending
    Created,
    /// Loading keys and default states
    Initializing,
    /// Writer running, connections live
    Ready,
    /// Disposed; every operation fails
    Disposed,
}

impl std::fmt::Display for StoreLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::Disposed => write!(f, "Disposed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Persistent store failed: {0}")]
    PersistentStore(#[from] StorageError),
    #[error("Store has been disposed")]
    Disposed,
}

pub(crate) type WriteWaiter = oneshot::Sender<Result<(), StoreError>>;

/// Outcome of the durable side of a write.
///
/// The in-memory cache and notifications are already applied when this is
/// returned. Awaiting [`settled`](Self::settled) reports whether the
/// backend accepted the write; nothing is retried or rolled back.
#[derive(Debug)]
#[must_use = "drop it to ignore durability, or await `settled()`"]
pub struct PendingWrite {
    inner: PendingInner,
}

#[derive(Debug)]
enum PendingInner {
    Settled(Result<(), StoreError>),
    Waiting(oneshot::Receiver<Result<(), StoreError>>),
}

impl PendingWrite {
    /// A write with nothing to persist (e.g. an unchanged value).
    pub(crate) fn settled_ok() -> Self {
        Self {
            inner: PendingInner::Settled(Ok(())),
        }
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<Result<(), StoreError>>) -> Self {
        Self {
            inner: PendingInner::Waiting(rx),
        }
    }

    /// Wait for the backend to accept or reject the write.
    pub async fn settled(self) -> Result<(), StoreError> {
        match self.inner {
            PendingInner::Settled(result) => result,
            PendingInner::Waiting(rx) => rx.await.unwrap_or(Err(StoreError::Disposed)),
        }
    }
}
