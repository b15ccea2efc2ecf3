// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the reactive store.
//!
//! # Example
//!
//! ```
//! use reactive_store::{FanOutKind, StoreConfig};
//! use serde_json::json;
//!
//! // Minimal config (uses defaults)
//! let config = StoreConfig::default();
//! assert_eq!(config.max_cached_keys_count, 1000);
//!
//! // Full config
//! let config = StoreConfig {
//!     max_cached_keys_count: 250,
//!     collection_keys: vec!["report_".into()],
//!     fan_out: FanOutKind::DependencyNodes,
//!     ..Default::default()
//! }
//! .with_initial_key("session", json!({"id": 0}));
//! assert!(config.initial_keys.contains_key("session"));
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::keys::DEFAULT_DELIMITER;
use crate::notify::FanOutKind;

/// Configuration for a [`Store`](crate::Store).
///
/// All fields have defaults, so an empty JSON/TOML table deserializes into a
/// working configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of resident cache keys before LRU eviction (default: 1000)
    #[serde(default = "default_max_cached_keys_count")]
    pub max_cached_keys_count: usize,

    /// Default key states, merged under stored values at init and restored by clear
    #[serde(default)]
    pub initial_keys: Map<String, Value>,

    /// Collection keys registered up front (more are registered on first use)
    #[serde(default)]
    pub collection_keys: Vec<String>,

    /// Reserved trailing delimiter that marks a collection key (default: `_`)
    #[serde(default = "default_collection_delimiter")]
    pub collection_delimiter: char,

    /// Notification fan-out strategy
    #[serde(default)]
    pub fan_out: FanOutKind,
}

fn default_max_cached_keys_count() -> usize { 1000 }
fn default_collection_delimiter() -> char { DEFAULT_DELIMITER }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_cached_keys_count: default_max_cached_keys_count(),
            initial_keys: Map::new(),
            collection_keys: Vec::new(),
            collection_delimiter: default_collection_delimiter(),
            fan_out: FanOutKind::default(),
        }
    }
}

impl StoreConfig {
    /// Add a default key state.
    #[must_use]
    pub fn with_initial_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_keys.insert(key.into(), value);
        self
    }

    /// Select the notification fan-out strategy.
    #[must_use]
    pub fn with_fan_out(mut self, kind: FanOutKind) -> Self {
        self.fan_out = kind;
        self
    }

    /// Set the resident key budget.
    #[must_use]
    pub fn with_max_cached_keys(mut self, count: usize) -> Self {
        self.max_cached_keys_count = count;
        self
    }
}
