//! Store lifecycle: init, clear, dispose.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::merge::{deep_merge, remove_nested_nulls, MergeOptions};
use crate::notify::{Change, SubscriptionId, Target};

use super::writer::{self, WriteJob, WriteOp};
use super::{deliver, PendingWrite, Store, StoreError, StoreLifecycle};

impl Store {
    /// Start the store.
    ///
    /// Startup flow:
    /// 1. Start the writer, which drains writes made before init
    /// 2. Load the durable key index
    /// 3. Merge default key states under stored values (memory only)
    /// 4. Register connections made before init and prime them
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        match self.lifecycle() {
            StoreLifecycle::Created => {}
            StoreLifecycle::Disposed => return Err(StoreError::Disposed),
            other => {
                return Err(StoreError::InvalidOperation(format!("init called while {other}")));
            }
        }
        self.set_lifecycle(StoreLifecycle::Initializing);
        info!("Initializing store...");

        if let Some(rx) = self.inner.writer_rx.lock().take() {
            tokio::spawn(writer::run(
                Arc::clone(&self.inner.storage),
                Arc::downgrade(&self.inner.state),
                rx,
            ));
        }

        let (stored_keys, stored_defaults) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "Failed to load key index; store stays uninitialized");
                self.set_lifecycle(StoreLifecycle::Created);
                return Err(e);
            }
        };

        let (dispatches, primes) = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            state.known_keys.extend(stored_keys);
            state.keys_loaded = true;

            let mut entries = Vec::new();
            let mut changes = Vec::new();
            for (key, default) in &self.inner.config.initial_keys {
                let cached = state.cache.peek(key).cloned();
                let value = match (&cached, stored_defaults.get(key)) {
                    // Removed before init
                    (Some(Value::Null), _) => continue,
                    (Some(overlay), _) | (None, Some(overlay)) => {
                        deep_merge(default, overlay, MergeOptions::for_cache()).result
                    }
                    (None, None) => remove_nested_nulls(default),
                };
                state.cache.block_eviction(key);
                if cached.as_ref() == Some(&value) {
                    continue;
                }
                if !value.is_null() {
                    state.known_keys.insert(key.clone());
                }
                changes.push(Change::new(key.clone(), cached.unwrap_or(Value::Null), value.clone()));
                entries.push((key.clone(), value));
            }
            let evicted = state.cache.merge_batch(entries);
            state.record_evictions(&evicted);
            let dispatches = state.publish(changes);

            state.ready = true;
            let primes: Vec<(Target, SubscriptionId)> = state
                .connections
                .pending_targets()
                .into_iter()
                .map(|target| {
                    let subscription = state.bind(&target);
                    (target, subscription)
                })
                .collect();
            (dispatches, primes)
        };
        deliver(dispatches);
        let pending = primes.len();
        for (target, subscription) in primes {
            self.spawn_prime(target, subscription);
        }

        self.set_lifecycle(StoreLifecycle::Ready);
        crate::metrics::set_cached_keys(self.inner.state.lock().cache.len());
        info!(
            defaults = self.inner.config.initial_keys.len(),
            pending_connections = pending,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Store ready"
        );
        Ok(())
    }

    async fn load(&self) -> Result<(Vec<String>, HashMap<String, Value>), StoreError> {
        let stored_keys = self.inner.storage.get_all_keys().await?;
        let default_keys: Vec<String> = self.inner.config.initial_keys.keys().cloned().collect();
        if default_keys.is_empty() {
            return Ok((stored_keys, HashMap::new()));
        }
        let stored_defaults = self
            .inner
            .storage
            .multi_get(&default_keys)
            .await?
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect();
        Ok((stored_keys, stored_defaults))
    }

    /// Reset every key to its default state.
    ///
    /// Subscribers are notified immediately. Reads issued afterwards wait
    /// until the backend has been cleared, and read-throughs started before
    /// the clear are discarded.
    #[tracing::instrument(skip(self))]
    pub fn clear(&self) -> Result<PendingWrite, StoreError> {
        let (pending, dispatches) = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            state.session += 1;
            let session = state.session;

            let defaults: Vec<(String, Value)> = self
                .inner
                .config
                .initial_keys
                .iter()
                .map(|(key, value)| (key.clone(), remove_nested_nulls(value)))
                .filter(|(_, value)| !value.is_null())
                .collect();
            let next: HashMap<&str, &Value> = defaults.iter().map(|(key, value)| (key.as_str(), value)).collect();

            let mut affected: BTreeSet<String> = state.cache.keys().map(str::to_string).collect();
            affected.extend(state.known_keys.iter().cloned());
            affected.extend(next.keys().map(|key| key.to_string()));
            let mut changes = Vec::new();
            for key in affected {
                let value = next.get(key.as_str()).map_or(Value::Null, |value| (*value).clone());
                match state.cache.peek(&key) {
                    Some(current) if *current == value => {}
                    current => {
                        let previous = current.cloned().unwrap_or(Value::Null);
                        changes.push(Change::new(key, previous, value));
                    }
                }
            }

            for (key, queue) in state.drain_merge_queues() {
                debug!(key = %key, "Dropping queued merges on clear");
                for waiter in queue.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }

            state.cache.clear();
            let evicted = state.cache.merge_batch(defaults.clone());
            state.record_evictions(&evicted);
            state.known_keys = defaults.iter().map(|(key, _)| key.clone()).collect();
            state.keys_loaded = true;

            let (barrier_tx, barrier_rx) = oneshot::channel::<()>();
            let barrier = async move {
                let _ = barrier_rx.await;
            }
            .boxed()
            .shared();
            state.clear_barrier = Some((session, barrier));

            let mut job = WriteJob::new(WriteOp::Clear { defaults, session });
            job.barrier = Some(barrier_tx);
            let pending = state.enqueue_pending(job)?;
            let notified = changes.len();
            let dispatches = state.publish(changes);
            info!(session, changed = notified, "Store cleared");
            (pending, dispatches)
        };
        deliver(dispatches);
        crate::metrics::record_operation("clear", "success");
        crate::metrics::set_cached_keys(self.inner.state.lock().cache.len());
        Ok(pending)
    }

    /// Shut the store down. Every connection is closed and later calls fail
    /// with [`StoreError::Disposed`]. Writes already queued still reach the
    /// backend. Idempotent.
    #[tracing::instrument(skip(self))]
    pub fn dispose(&self) {
        if self.lifecycle() == StoreLifecycle::Disposed {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            let handles: Vec<_> = state.connections.handles().collect();
            let closed = handles.len();
            for handle in handles {
                state.disconnect(handle);
            }
            for (_, queue) in state.drain_merge_queues() {
                for waiter in queue.waiters {
                    let _ = waiter.send(Err(StoreError::Disposed));
                }
            }
            state.writer_tx = None;
            state.ready = false;
            debug!(connections = closed, "Closed connections");
        }
        // Never initialized: queued writes are dropped with the receiver
        drop(self.inner.writer_rx.lock().take());
        self.set_lifecycle(StoreLifecycle::Disposed);
        info!("Store disposed");
    }
}
