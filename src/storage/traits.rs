// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::merge::NullPatch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation not supported by backend: {0}")]
    Unsupported(String),
}

/// Durable key-value backend behind the store.
///
/// The store never retries: a failure is reported once, to whoever awaits
/// the write.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Read many keys. Default implementation falls back to sequential gets.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>, StorageError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get_item(key).await?));
        }
        Ok(out)
    }

    /// Write many keys. Default implementation falls back to sequential sets.
    async fn multi_set(&self, pairs: &[(String, Value)]) -> Result<(), StorageError> {
        for (key, value) in pairs {
            self.set_item(key, value).await?;
        }
        Ok(())
    }

    /// Whether [`multi_merge`](Self::multi_merge) is implemented. When it is
    /// not, the store merges in memory and writes whole values instead.
    fn supports_multi_merge(&self) -> bool {
        false
    }

    /// Merge partial values into stored ones. Subtrees named by the null
    /// patches must be replaced whole rather than merged into.
    async fn multi_merge(
        &self,
        pairs: &[(String, Value)],
        null_patches: &HashMap<String, Vec<NullPatch>>,
    ) -> Result<(), StorageError> {
        let _ = (pairs, null_patches);
        Err(StorageError::Unsupported("multi_merge".into()))
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}
