//! Write-behind writer.
//!
//! One task drains the write queue in call order, so durable writes reach
//! the backend in the same order their in-memory updates were applied.
//! After each job the writer releases the cache pins it held and reports
//! the outcome to every waiter.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::merge::{deep_merge, MergeOptions, NullPatch};
use crate::storage::traits::{PersistentStore, StorageError};

use super::types::WriteWaiter;
use super::StoreState;

/// A merged key in a batch: the partial as given plus its null patches.
#[derive(Debug, Clone)]
pub(crate) struct MergeWrite {
    pub key: String,
    pub partial: Value,
    pub null_patches: Vec<NullPatch>,
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Set { key: String, value: Value },
    Remove { key: String },
    Merge { entries: Vec<MergeWrite> },
    Clear { defaults: Vec<(String, Value)>, session: u64 },
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set_item",
            Self::Remove { .. } => "remove_item",
            Self::Merge { .. } => "merge",
            Self::Clear { .. } => "clear",
        }
    }
}

#[derive(Debug)]
pub(crate) struct WriteJob {
    pub op: WriteOp,
    /// Keys pinned in the cache until this job settles
    pub pinned: Vec<String>,
    pub waiters: Vec<WriteWaiter>,
    /// Released once a clear has reached the backend
    pub barrier: Option<oneshot::Sender<()>>,
}

impl WriteJob {
    pub(crate) fn new(op: WriteOp) -> Self {
        Self {
            op,
            pinned: Vec::new(),
            waiters: Vec::new(),
            barrier: None,
        }
    }
}

pub(crate) async fn run(
    storage: Arc<dyn PersistentStore>,
    state: Weak<Mutex<StoreState>>,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    debug!("Writer started");
    while let Some(job) = rx.recv().await {
        let start = Instant::now();
        let result = apply(storage.as_ref(), &job.op).await;
        let operation = job.op.name();
        crate::metrics::record_latency(operation, start.elapsed());
        crate::metrics::record_durable_write(operation, result.is_ok());
        if let Err(e) = &result {
            warn!(operation, error = %e, "Durable write failed; in-memory state kept");
        }

        if let Some(state) = state.upgrade() {
            let mut state = state.lock();
            for key in &job.pinned {
                let evicted = state.cache.settle_write(key);
                state.record_evictions(&evicted);
            }
            if let WriteOp::Clear { session, .. } = &job.op {
                if state.clear_barrier.as_ref().is_some_and(|(pending, _)| pending == session) {
                    state.clear_barrier = None;
                }
            }
        }

        if let Some(barrier) = job.barrier {
            let _ = barrier.send(());
        }
        for waiter in job.waiters {
            let _ = waiter.send(result.clone().map_err(Into::into));
        }
    }
    debug!("Writer drained, exiting");
}

async fn apply(storage: &dyn PersistentStore, op: &WriteOp) -> Result<(), StorageError> {
    match op {
        WriteOp::Set { key, value } => storage.set_item(key, value).await,
        WriteOp::Remove { key } => storage.remove_item(key).await,
        WriteOp::Merge { entries } => merge(storage, entries).await,
        WriteOp::Clear { defaults, .. } => {
            storage.clear().await?;
            if defaults.is_empty() {
                return Ok(());
            }
            storage.multi_set(defaults).await
        }
    }
}

async fn merge(storage: &dyn PersistentStore, entries: &[MergeWrite]) -> Result<(), StorageError> {
    if storage.supports_multi_merge() {
        let pairs: Vec<(String, Value)> = entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.partial.clone()))
            .collect();
        let patches: HashMap<String, Vec<NullPatch>> = entries
            .iter()
            .filter(|entry| !entry.null_patches.is_empty())
            .map(|entry| (entry.key.clone(), entry.null_patches.clone()))
            .collect();
        return storage.multi_merge(&pairs, &patches).await;
    }

    // Read-merge-write fallback
    for entry in entries {
        let stored = storage.get_item(&entry.key).await?.unwrap_or(Value::Null);
        let merged = deep_merge(&stored, &entry.partial, MergeOptions::for_cache()).result;
        if merged.is_null() {
            storage.remove_item(&entry.key).await?;
        } else {
            storage.set_item(&entry.key, &merged).await?;
        }
    }
    Ok(())
}
