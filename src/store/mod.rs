// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store façade.
//!
//! The [`Store`] ties the components together:
//! - key algebra for collection keys
//! - the cache with LRU eviction and single-flight read-through
//! - the notification hub with the configured fan-out strategy
//! - the connection manager deduplicating subscribers
//! - a write-behind writer in front of the [`PersistentStore`]
//!
//! # Write path
//!
//! ```text
//! set/merge ─▶ MergeEngine ─▶ Cache ─▶ writer queue (not awaited)
//!                                  └─▶ NotificationHub ─▶ ConnectionManager ─▶ callbacks
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready → Disposed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactive_store::{ConnectOptions, InMemoryStore, Store, StoreConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), reactive_store::StoreError> {
//! let store = Store::new(StoreConfig::default(), Arc::new(InMemoryStore::new()));
//! store.init().await?;
//!
//! let _ = store.set("session", json!({"id": 1}))?;
//! store.merge("session", json!({"name": "a"})).await?;
//! assert_eq!(store.get("session").await?, json!({"id": 1, "name": "a"}));
//!
//! let handle = store.connect(ConnectOptions::key("session", |value| {
//!     println!("session is now {value}");
//! }))?;
//! store.disconnect(handle);
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;
mod writer;

pub use types::{PendingWrite, StoreError, StoreLifecycle};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::cache::{Cache, CacheStats, Presence};
use crate::config::StoreConfig;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionState, Dispatch};
use crate::keys::KeyRegistry;
use crate::merge::{deep_merge, merge_partials, MergeOptions};
use crate::notify::{Change, FanOutKind, NotificationHub, SubscriptionId, Target};
use crate::storage::traits::PersistentStore;

use types::WriteWaiter;
use writer::{MergeWrite, WriteJob, WriteOp};

type Barrier = Shared<BoxFuture<'static, ()>>;

/// Partials queued for a key whose value is still being read through.
#[derive(Default)]
pub(crate) struct MergeQueue {
    partials: Vec<Value>,
    waiters: Vec<WriteWaiter>,
}

/// In-memory state, owned by one lock. Never held across an await.
pub(crate) struct StoreState {
    pub(crate) keys: KeyRegistry,
    pub(crate) cache: Cache,
    pub(crate) hub: NotificationHub,
    pub(crate) connections: ConnectionManager,
    /// Keys known to exist durably
    pub(crate) known_keys: BTreeSet<String>,
    pub(crate) keys_loaded: bool,
    pub(crate) merge_queues: HashMap<String, MergeQueue>,
    /// Outstanding backend clear, tagged with the session that issued it
    pub(crate) clear_barrier: Option<(u64, Barrier)>,
    /// Bumped by every clear; read-throughs started earlier are discarded
    pub(crate) session: u64,
    pub(crate) ready: bool,
    pub(crate) writer_tx: Option<mpsc::UnboundedSender<WriteJob>>,
}

impl StoreState {
    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        if self.writer_tx.is_none() {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }

    /// Start a durable write: its keys are pinned in the cache from now
    /// until the writer settles the job.
    fn begin_job(&mut self, op: WriteOp, pinned: Vec<String>) -> WriteJob {
        for key in &pinned {
            self.cache.begin_write(key);
        }
        let mut job = WriteJob::new(op);
        job.pinned = pinned;
        job
    }

    fn enqueue(&mut self, job: WriteJob) -> Result<(), StoreError> {
        let sent = match self.writer_tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|mpsc::error::SendError(job)| job),
            None => Err(job),
        };
        if let Err(job) = sent {
            for key in &job.pinned {
                let evicted = self.cache.settle_write(key);
                self.record_evictions(&evicted);
            }
            return Err(StoreError::Disposed);
        }
        Ok(())
    }

    /// Queue a durable write and hand back its [`PendingWrite`].
    fn enqueue_pending(&mut self, mut job: WriteJob) -> Result<PendingWrite, StoreError> {
        let (tx, rx) = oneshot::channel();
        job.waiters.push(tx);
        self.enqueue(job)?;
        Ok(PendingWrite::waiting(rx))
    }

    /// Route applied changes through the hub and connections.
    fn publish(&mut self, changes: Vec<Change>) -> Vec<Dispatch> {
        if changes.is_empty() {
            return Vec::new();
        }
        let notifications = self.hub.publish(&changes, &self.cache);
        self.connections.fan_out(notifications)
    }

    /// Write a whole value (`null` removes). Unchanged values short-circuit.
    fn write_value(&mut self, key: &str, value: Value) -> Result<(PendingWrite, Vec<Dispatch>), StoreError> {
        let previous = self.cache.peek(key).cloned();
        if previous.as_ref() == Some(&value) {
            return Ok((PendingWrite::settled_ok(), Vec::new()));
        }

        let op = if value.is_null() {
            self.known_keys.remove(key);
            WriteOp::Remove { key: key.to_string() }
        } else {
            self.known_keys.insert(key.to_string());
            WriteOp::Set {
                key: key.to_string(),
                value: value.clone(),
            }
        };
        let job = self.begin_job(op, vec![key.to_string()]);
        let evicted = self.cache.set(key, value.clone());
        self.record_evictions(&evicted);
        let pending = self.enqueue_pending(job)?;

        let change = Change::new(key, previous.unwrap_or(Value::Null), value);
        Ok((pending, self.publish(vec![change])))
    }

    /// Merge partials into a key's current value. Waiters settle with the
    /// durable write, or immediately if nothing changed.
    fn apply_merge(&mut self, key: &str, partials: &[Value], waiters: Vec<WriteWaiter>) -> Result<Vec<Dispatch>, StoreError> {
        let partial = merge_partials(partials);
        let current = self.cache.peek(key).cloned().unwrap_or(Value::Null);
        let merged = deep_merge(&current, &partial, MergeOptions::for_cache());
        if merged.result == current {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return Ok(Vec::new());
        }

        let op = if merged.result.is_null() {
            self.known_keys.remove(key);
            WriteOp::Remove { key: key.to_string() }
        } else {
            self.known_keys.insert(key.to_string());
            WriteOp::Merge {
                entries: vec![MergeWrite {
                    key: key.to_string(),
                    partial,
                    null_patches: merged.null_patches.clone(),
                }],
            }
        };
        let mut job = self.begin_job(op, vec![key.to_string()]);
        job.waiters = waiters;
        let evicted = self.cache.set(key, merged.result.clone());
        self.record_evictions(&evicted);
        self.enqueue(job)?;

        let change = Change::new(key, current, merged.result).with_patches(merged.null_patches);
        Ok(self.publish(vec![change]))
    }

    pub(crate) fn record_evictions(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        crate::metrics::record_eviction(evicted.len());
        crate::metrics::set_cached_keys(self.cache.len());
        debug!(count = evicted.len(), "Evicted keys from cache");
    }

    /// Queue a partial for a key whose value is still being read. The key
    /// stays resident until its queue is applied.
    fn queue_merge(&mut self, key: &str, partial: Value, waiter: WriteWaiter) {
        if !self.merge_queues.contains_key(key) {
            self.cache.block_eviction(key);
        }
        let queue = self.merge_queues.entry(key.to_string()).or_default();
        queue.partials.push(partial);
        queue.waiters.push(waiter);
    }

    /// Take a key's queue. The caller releases its eviction block once the
    /// queue has been dealt with.
    fn take_merge_queue(&mut self, key: &str) -> Option<MergeQueue> {
        self.merge_queues.remove(key)
    }

    fn drain_merge_queues(&mut self) -> Vec<(String, MergeQueue)> {
        let queues: Vec<_> = self.merge_queues.drain().collect();
        for (key, _) in &queues {
            self.release_eviction_block(key);
        }
        queues
    }

    fn release_eviction_block(&mut self, key: &str) {
        let evicted = self.cache.unblock_eviction(key);
        self.record_evictions(&evicted);
    }

    /// Drop queued merges for a key; a later set or remove supersedes them.
    /// Returns `true` if there were any, in which case the caller releases
    /// the key's eviction block after writing.
    fn supersede_merges(&mut self, key: &str) -> bool {
        let Some(queue) = self.take_merge_queue(key) else {
            return false;
        };
        debug!(key, superseded = queue.partials.len(), "Superseded queued merges");
        for waiter in queue.waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Merge partials into members of one collection with a single capacity
    /// check, durable write and notification pass.
    fn merge_members(&mut self, partials: Map<String, Value>) -> Result<(PendingWrite, Vec<Dispatch>), StoreError> {
        self.ensure_open()?;
        let mut entries = Vec::new();
        let mut writes = Vec::new();
        let mut changes = Vec::new();
        for (key, partial) in partials {
            let current = self.cache.peek(&key).cloned().unwrap_or(Value::Null);
            let merged = deep_merge(&current, &partial, MergeOptions::for_cache());
            if merged.result == current {
                continue;
            }
            if merged.result.is_null() {
                self.known_keys.remove(&key);
            } else {
                self.known_keys.insert(key.clone());
            }
            entries.push((key.clone(), merged.result.clone()));
            writes.push(MergeWrite {
                key: key.clone(),
                partial,
                null_patches: merged.null_patches.clone(),
            });
            changes.push(Change::new(key, current, merged.result).with_patches(merged.null_patches));
        }
        if entries.is_empty() {
            return Ok((PendingWrite::settled_ok(), Vec::new()));
        }

        let pinned = entries.iter().map(|(key, _)| key.clone()).collect();
        let job = self.begin_job(WriteOp::Merge { entries: writes }, pinned);
        let evicted = self.cache.merge_batch(entries);
        self.record_evictions(&evicted);
        let pending = self.enqueue_pending(job)?;
        Ok((pending, self.publish(changes)))
    }

    /// Register a hub subscription for a pending target.
    fn bind(&mut self, target: &Target) -> SubscriptionId {
        let subscription = self.hub.subscribe(target.clone());
        self.connections.bind(target, subscription);
        subscription
    }

    fn disconnect(&mut self, handle: ConnectionHandle) {
        let Some(teardown) = self.connections.disconnect(handle) else {
            return;
        };
        if let Some(subscription) = teardown.subscription {
            self.hub.unsubscribe(subscription);
        }
        let evicted = self.cache.unblock_eviction(&teardown.target.key);
        self.record_evictions(&evicted);
        self.connections.close(&teardown);
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) storage: Arc<dyn PersistentStore>,
    pub(crate) state: Arc<Mutex<StoreState>>,
    pub(crate) lifecycle: watch::Sender<StoreLifecycle>,
    pub(crate) writer_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteJob>>>,
}

/// Embedded reactive key-value store.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store. Nothing runs until [`init()`](Self::init); writes
    /// made before then are applied in memory and persisted once the
    /// writer starts.
    pub fn new(config: StoreConfig, storage: Arc<dyn PersistentStore>) -> Self {
        let keys = KeyRegistry::with_collections(config.collection_delimiter, &config.collection_keys);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(StoreLifecycle::Created);

        let state = StoreState {
            keys,
            cache: Cache::new(config.max_cached_keys_count),
            hub: NotificationHub::new(config.fan_out),
            connections: ConnectionManager::default(),
            known_keys: BTreeSet::new(),
            keys_loaded: false,
            merge_queues: HashMap::new(),
            clear_barrier: None,
            session: 0,
            ready: false,
            writer_tx: Some(writer_tx),
        };

        Self {
            inner: Arc::new(StoreInner {
                config,
                storage,
                state: Arc::new(Mutex::new(state)),
                lifecycle,
                writer_rx: Mutex::new(Some(writer_rx)),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn lifecycle(&self) -> StoreLifecycle {
        *self.inner.lifecycle.borrow()
    }

    #[must_use]
    pub fn lifecycle_receiver(&self) -> watch::Receiver<StoreLifecycle> {
        self.inner.lifecycle.subscribe()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lifecycle() == StoreLifecycle::Ready
    }

    #[must_use]
    pub fn fan_out_kind(&self) -> FanOutKind {
        self.inner.state.lock().hub.kind()
    }

    /// What the cache knows about a key, without touching recency.
    #[must_use]
    pub fn presence(&self, key: &str) -> Presence {
        self.inner.state.lock().cache.presence(key)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.state.lock().cache.stats()
    }

    #[must_use]
    pub fn connection_state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.inner.state.lock().connections.state(handle)
    }

    fn set_lifecycle(&self, next: StoreLifecycle) {
        self.inner.lifecycle.send_replace(next);
        crate::metrics::set_store_state(&next.to_string());
    }
}

/// Run callbacks. Must be called with the state lock released.
fn deliver(dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        dispatch.deliver();
    }
}
