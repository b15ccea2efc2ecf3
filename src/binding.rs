// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Framework-neutral consumer binding.
//!
//! A [`Binding`] owns one connection and exposes the latest payload through
//! a watch channel, so a UI layer can poll [`snapshot()`](Binding::snapshot)
//! on render and await [`changed()`](Binding::changed) to schedule the next.
//!
//! A [`KeyHold`] is the read-only counterpart: a direct reader of one key
//! that keeps the key's notification node alive under the dependency-nodes
//! strategy without subscribing to it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::connection::{ConnectOptions, ConnectionHandle};
use serde_json::Value;

use crate::notify::{Payload, Target};
use crate::store::{Store, StoreError};

pub struct Binding {
    store: Store,
    handle: ConnectionHandle,
    rx: watch::Receiver<Option<Payload>>,
}

impl Binding {
    /// Connect to `target`. The snapshot is `None` until the first payload
    /// arrives.
    pub fn new(store: &Store, target: Target) -> Result<Self, StoreError> {
        let (tx, rx) = watch::channel(None);
        let handle = store.connect(ConnectOptions {
            target,
            callback: Arc::new(move |payload: &Payload| {
                tx.send_replace(Some(Arc::clone(payload)));
            }),
        })?;
        Ok(Self {
            store: store.clone(),
            handle,
            rx,
        })
    }

    /// Latest delivered payload.
    #[must_use]
    pub fn snapshot(&self) -> Option<Payload> {
        self.rx.borrow().clone()
    }

    /// Wait for the next payload. Returns `None` once the connection is gone.
    pub async fn changed(&mut self) -> Option<Payload> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.store.disconnect(self.handle);
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Direct reader of one key. Released on drop.
pub struct KeyHold {
    store: Store,
    key: String,
}

impl KeyHold {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the held key.
    pub async fn get(&self) -> Result<Value, StoreError> {
        self.store.get(&self.key).await
    }
}

impl Drop for KeyHold {
    fn drop(&mut self) {
        self.store.inner.state.lock().hub.release(&self.key);
    }
}

impl std::fmt::Debug for KeyHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHold").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Store {
    /// Connect a [`Binding`] to `target`.
    pub fn binding(&self, target: Target) -> Result<Binding, StoreError> {
        Binding::new(self, target)
    }

    /// Hold `key` for direct reads. Collection keys are read through
    /// [`binding`](Self::binding) instead.
    pub fn hold(&self, key: &str) -> Result<KeyHold, StoreError> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        if state.keys.is_collection_key(key) {
            crate::metrics::record_operation("hold", "rejected");
            return Err(StoreError::InvalidOperation(format!(
                "'{key}' is a collection key; hold one of its members"
            )));
        }
        let state = &mut *state;
        state.hub.hold(key, &state.cache);
        Ok(KeyHold {
            store: self.clone(),
            key: key.to_string(),
        })
    }

    /// Whether the fan-out strategy keeps per-key notification state for
    /// `key`. Only the dependency-nodes strategy does.
    #[must_use]
    pub fn is_tracked(&self, key: &str) -> bool {
        self.inner.state.lock().hub.tracks(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_binding_tracks_latest_payload() {
        let store = Store::new(StoreConfig::default(), Arc::new(InMemoryStore::new()));
        store.init().await.unwrap();
        let _ = store.set("a", json!(1)).unwrap();

        let mut binding = store.binding(Target::key("a")).unwrap();
        assert_eq!(binding.changed().await.as_deref(), Some(&json!(1)));

        let _ = store.set("a", json!(2)).unwrap();
        assert_eq!(binding.snapshot().as_deref(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_key_hold_reads_and_rejects_collections() {
        let store = Store::new(StoreConfig::default(), Arc::new(InMemoryStore::new()));
        store.init().await.unwrap();
        let _ = store.set("a", json!(1)).unwrap();

        let hold = store.hold("a").unwrap();
        assert_eq!(hold.key(), "a");
        assert_eq!(hold.get().await.unwrap(), json!(1));
        assert!(matches!(store.hold("a_"), Err(StoreError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_drop_disconnects() {
        let store = Store::new(StoreConfig::default(), Arc::new(InMemoryStore::new()));
        store.init().await.unwrap();
        let handle = {
            let binding = store.binding(Target::key("a")).unwrap();
            binding.handle()
        };
        assert_eq!(store.connection_state(handle), crate::connection::ConnectionState::Closed);
    }
}
