use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::traits::{PersistentStore, StorageError};
use crate::merge::{deep_merge, mark_replacements, MergeOptions, NullPatch};

/// Reference [`PersistentStore`] holding everything in a `DashMap`.
pub struct InMemoryStore {
    data: DashMap<String, Value>,
    multi_merge: AtomicBool,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            multi_merge: AtomicBool::new(true),
        }
    }

    /// Store without `multi_merge`, forcing the read-merge-write path.
    #[must_use]
    pub fn without_multi_merge() -> Self {
        let store = Self::new();
        store.multi_merge.store(false, Ordering::Relaxed);
        store
    }

    /// Seed a value directly, bypassing the store.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Read a value directly, bypassing the store.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|r| r.value().clone())
    }

    /// Get current item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.peek(key))
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    fn supports_multi_merge(&self) -> bool {
        self.multi_merge.load(Ordering::Relaxed)
    }

    async fn multi_merge(
        &self,
        pairs: &[(String, Value)],
        null_patches: &HashMap<String, Vec<NullPatch>>,
    ) -> Result<(), StorageError> {
        if !self.supports_multi_merge() {
            return Err(StorageError::Unsupported("multi_merge".into()));
        }
        for (key, partial) in pairs {
            let patches = null_patches.get(key).map(Vec::as_slice).unwrap_or_default();
            let marked = mark_replacements(partial, patches);
            let stored = self.peek(key).unwrap_or(Value::Null);
            let merged = deep_merge(&stored, &marked, MergeOptions::for_backend()).result;
            if merged.is_null() {
                self.data.remove(key);
            } else {
                self.data.insert(key.clone(), merged);
            }
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.data.iter().map(|r| r.key().clone()).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }
}
