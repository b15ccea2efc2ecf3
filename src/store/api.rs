//! Public read/write API.
//!
//! Reads are read-through and single-flighted; writes update the cache and
//! notify synchronously, then hand the durable write to the writer.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::Presence;
use crate::connection::{ConnectOptions, ConnectionHandle};
use crate::keys::{is_member_key, KeyError};
use crate::merge::remove_nested_nulls;
use crate::metrics::LatencyTimer;
use crate::notify::{aggregate, Change, SubscriptionId, Target};

use super::{deliver, PendingWrite, Store, StoreError, StoreState};

fn rejected(operation: &str, message: String) -> StoreError {
    crate::metrics::record_operation(operation, "rejected");
    StoreError::InvalidOperation(message)
}

fn reject_collection_key(state: &StoreState, operation: &str, key: &str) -> Result<(), StoreError> {
    if state.keys.is_collection_key(key) {
        return Err(rejected(
            operation,
            format!("'{key}' is a collection key; write its members or use merge_collection"),
        ));
    }
    Ok(())
}

/// A batch member must sit directly in `collection_key` and must not be a
/// collection key itself.
fn validate_member(state: &StoreState, collection_key: &str, key: &str) -> Result<(), StoreError> {
    if state.keys.is_collection_key(key) {
        return Err(rejected(
            "merge_collection",
            format!("'{key}' is a collection key and cannot be written as a member"),
        ));
    }
    let stray = || {
        crate::metrics::record_operation("merge_collection", "rejected");
        StoreError::from(KeyError::InvalidKey(key.to_string()))
    };
    match state.keys.split_member_key(key, Some(collection_key)) {
        Ok((collection, _)) if collection == collection_key => Ok(()),
        _ => Err(stray()),
    }
}

impl Store {
    /// Read a key. A collection key returns the mapping of its present
    /// members. Misses are read through from the backend, once per key no
    /// matter how many callers are waiting.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Value, StoreError> {
        let _timer = LatencyTimer::new("get");
        let is_collection = {
            let state = self.inner.state.lock();
            state.ensure_open()?;
            state.keys.is_collection_key(key)
        };
        if is_collection {
            self.get_collection(key).await
        } else {
            self.read_key(key).await
        }
    }

    pub(super) async fn read_key(&self, key: &str) -> Result<Value, StoreError> {
        loop {
            let (session, barrier) = {
                let mut state = self.inner.state.lock();
                state.ensure_open()?;
                if let Some(value) = state.cache.get(key) {
                    let value = value.clone();
                    crate::metrics::record_cache_lookup(if value.is_null() { "tombstone" } else { "hit" });
                    return Ok(value);
                }
                // The key index says it was never stored
                if state.keys_loaded && !state.known_keys.contains(key) {
                    crate::metrics::record_cache_lookup("tombstone");
                    let evicted = state.cache.set(key, Value::Null);
                    state.record_evictions(&evicted);
                    return Ok(Value::Null);
                }
                (state.session, state.clear_barrier.as_ref().map(|(_, barrier)| barrier.clone()))
            };

            // Reads issued after a clear wait for the backend to be cleared
            if let Some(barrier) = barrier {
                barrier.await;
                continue;
            }

            crate::metrics::record_cache_lookup("miss");
            let captured = {
                let mut state = self.inner.state.lock();
                let storage = Arc::clone(&self.inner.storage);
                let owned = key.to_string();
                state
                    .cache
                    .capture_read(key, move || async move { storage.get_item(&owned).await })
            };
            crate::metrics::record_single_flight(captured.joined);
            let result = captured.task.await;

            let (value, dispatches) = {
                let mut state = self.inner.state.lock();
                let fresh = state.cache.finish_read(key, captured.ticket);
                if state.session != session {
                    debug!(key, "Discarding read-through issued before clear");
                    continue;
                }
                if !fresh {
                    debug!(key, "Discarding read-through overtaken by a write");
                    continue;
                }
                let fetched = result?;
                // A write that landed meanwhile wins over what was fetched
                if let Some(value) = state.cache.get(key) {
                    return Ok(value.clone());
                }

                let value = fetched.unwrap_or(Value::Null);
                let evicted = state.cache.set(key, value.clone());
                state.record_evictions(&evicted);
                let dispatches = if value.is_null() {
                    Vec::new()
                } else {
                    state.known_keys.insert(key.to_string());
                    state.publish(vec![Change::new(key, Value::Null, value.clone())])
                };
                (value, dispatches)
            };
            deliver(dispatches);
            return Ok(value);
        }
    }

    async fn get_collection(&self, collection_key: &str) -> Result<Value, StoreError> {
        let loaded = {
            let mut state = self.inner.state.lock();
            state.keys.register(collection_key);
            // Members read below must still be resident when selected
            state.cache.block_eviction(collection_key);
            state.keys_loaded
        };
        let selected = self.select_collection(collection_key, loaded).await;
        self.inner.state.lock().release_eviction_block(collection_key);
        selected
    }

    async fn select_collection(&self, collection_key: &str, loaded: bool) -> Result<Value, StoreError> {
        if !loaded {
            self.get_all_keys().await?;
        }
        let missing: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .known_keys
                .iter()
                .filter(|key| is_member_key(key, collection_key))
                .filter(|key| state.cache.presence(key) == Presence::Unknown)
                .cloned()
                .collect()
        };
        for result in join_all(missing.iter().map(|key| self.read_key(key))).await {
            result?;
        }

        let state = self.inner.state.lock();
        Ok(aggregate::select(&Target::collection(collection_key), &state.cache))
    }

    /// Replace a key's value. Nested `null` members are dropped; a `null`
    /// value removes the key. Applied in memory and notified before this
    /// returns; the durable write is reported by the returned
    /// [`PendingWrite`].
    #[tracing::instrument(skip(self, value))]
    pub fn set(&self, key: &str, value: Value) -> Result<PendingWrite, StoreError> {
        let _timer = LatencyTimer::new("set");
        let (pending, dispatches) = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            reject_collection_key(&state, "set", key)?;
            let superseded = state.supersede_merges(key);
            let written = state.write_value(key, remove_nested_nulls(&value));
            if superseded {
                state.release_eviction_block(key);
            }
            written?
        };
        deliver(dispatches);
        crate::metrics::record_operation("set", "success");
        Ok(pending)
    }

    /// Tombstone a key and remove it from the backend.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, key: &str) -> Result<PendingWrite, StoreError> {
        let _timer = LatencyTimer::new("remove");
        let (pending, dispatches) = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            reject_collection_key(&state, "remove", key)?;
            let superseded = state.supersede_merges(key);
            let written = state.write_value(key, Value::Null);
            if superseded {
                state.release_eviction_block(key);
            }
            written?
        };
        deliver(dispatches);
        crate::metrics::record_operation("remove", "success");
        Ok(pending)
    }

    /// Deep-merge a partial into a key. `null` members delete paths.
    ///
    /// A key the cache has never seen is read through first; merges arriving
    /// meanwhile are batched and applied together on top of the stored value.
    /// A later `set`/`remove` on the key supersedes still-queued merges.
    #[tracing::instrument(skip(self, partial))]
    pub async fn merge(&self, key: &str, partial: Value) -> Result<PendingWrite, StoreError> {
        let _timer = LatencyTimer::new("merge");
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            reject_collection_key(&state, "merge", key)?;
            if state.cache.presence(key) != Presence::Unknown {
                let dispatches = state.apply_merge(key, &[partial], vec![tx])?;
                drop(state);
                deliver(dispatches);
                crate::metrics::record_operation("merge", "success");
                return Ok(PendingWrite::waiting(rx));
            }
            state.queue_merge(key, partial, tx);
        }

        // Whoever finishes the read first applies the whole queue
        if let Err(e) = self.read_key(key).await {
            let mut state = self.inner.state.lock();
            if let Some(queue) = state.take_merge_queue(key) {
                for waiter in queue.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                state.release_eviction_block(key);
            }
            crate::metrics::record_operation("merge", "error");
            return Err(e);
        }

        let dispatches = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            match state.take_merge_queue(key) {
                Some(queue) => {
                    debug!(key, batched = queue.partials.len(), "Applying queued merges");
                    let applied = state.apply_merge(key, &queue.partials, queue.waiters);
                    state.release_eviction_block(key);
                    applied?
                }
                None => Vec::new(),
            }
        };
        deliver(dispatches);
        crate::metrics::record_operation("merge", "success");
        Ok(PendingWrite::waiting(rx))
    }

    /// Merge many members of one collection as a batch: one capacity check,
    /// one durable write and one notification pass.
    #[tracing::instrument(skip(self, partials), fields(members = partials.len()))]
    pub async fn merge_collection(&self, collection_key: &str, partials: Map<String, Value>) -> Result<PendingWrite, StoreError> {
        let _timer = LatencyTimer::new("merge_collection");
        let unknown: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            if !state.keys.is_collection_key(collection_key) {
                return Err(rejected(
                    "merge_collection",
                    format!("'{collection_key}' is not a collection key"),
                ));
            }
            for key in partials.keys() {
                validate_member(&state, collection_key, key)?;
            }
            state.keys.register(collection_key);
            if partials.is_empty() {
                return Ok(PendingWrite::settled_ok());
            }
            state.cache.block_eviction(collection_key);
            partials
                .keys()
                .filter(|key| state.cache.presence(key) == Presence::Unknown)
                .cloned()
                .collect()
        };

        // Partials land on stored values, so unseen members are read first
        let reads = join_all(unknown.iter().map(|key| self.read_key(key))).await;

        let (pending, dispatches) = {
            let mut state = self.inner.state.lock();
            let merged = match reads.into_iter().find_map(Result::err) {
                Some(e) => Err(e),
                None => state.merge_members(partials),
            };
            state.release_eviction_block(collection_key);
            merged?
        };
        deliver(dispatches);
        crate::metrics::record_operation("merge_collection", "success");
        Ok(pending)
    }

    /// Every key known to the store.
    pub async fn get_all_keys(&self) -> Result<Vec<String>, StoreError> {
        {
            let state = self.inner.state.lock();
            state.ensure_open()?;
            if state.keys_loaded {
                return Ok(state.known_keys.iter().cloned().collect());
            }
        }
        let stored = self.inner.storage.get_all_keys().await?;
        let mut state = self.inner.state.lock();
        if !state.keys_loaded {
            state.known_keys.extend(stored);
            state.keys_loaded = true;
        }
        Ok(state.known_keys.iter().cloned().collect())
    }

    /// Connect a callback to a key or collection.
    ///
    /// The callback first fires on a later scheduler turn with the current
    /// value, then on every change to it. Connecting before
    /// [`init()`](Self::init) leaves the connection pending until init.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, options: ConnectOptions) -> Result<ConnectionHandle, StoreError> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        let target = options.target.clone();
        let is_collection = state.keys.is_collection_key(&target.key);
        if target.collection != is_collection {
            return Err(rejected(
                "connect",
                format!("collection mode does not match key '{}'", target.key),
            ));
        }
        if target.collection {
            state.keys.register(&target.key);
        }

        let connected = state.connections.connect(options);
        if connected.new_registration {
            state.cache.block_eviction(&target.key);
            if state.ready {
                let subscription = state.bind(&target);
                self.spawn_prime(target, subscription);
            }
        } else {
            self.spawn_replay(connected.handle);
        }
        Ok(connected.handle)
    }

    /// Remove one callback. Idempotent.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        self.inner.state.lock().disconnect(handle);
    }

    /// Deliver a new registration's first payload on a later turn.
    pub(super) fn spawn_prime(&self, target: Target, subscription: SubscriptionId) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if let Err(e) = store.get(&target.key).await {
                warn!(target = %target, error = %e, "Initial read failed; delivering cached state");
            }
            let dispatches = {
                let mut state = store.inner.state.lock();
                let state = &mut *state;
                match state.hub.prime(subscription, &state.cache) {
                    Some(notification) => state.connections.fan_out(vec![notification]),
                    None => Vec::new(),
                }
            };
            deliver(dispatches);
        });
    }

    /// Replay the last payload to a callback joining a live registration.
    fn spawn_replay(&self, handle: ConnectionHandle) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let replay = store.inner.state.lock().connections.take_replay(handle);
            if let Some(dispatch) = replay {
                dispatch.deliver();
            }
        });
    }
}
