//! # Reactive Store
//!
//! An embedded, reactive key-value cache in front of a durable backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store API                           │
//! │  • get / set / merge / merge_collection / remove / clear    │
//! │  • connect / disconnect, Binding                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Merge Engine + Cache                    │
//! │  • Deep merge, null-as-delete, replacement patches          │
//! │  • LRU eviction with pinned and blocked keys                │
//! │  • Single-flight read-through                               │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!      (write-behind queue)             (applied changes)
//!                 ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │     PersistentStore      │   │  NotificationHub             │
//! │  • any async backend     │   │  • pluggable fan-out         │
//! │  • optional multi_merge  │   │  • ConnectionManager dedup   │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactive_store::{ConnectOptions, FanOutKind, InMemoryStore, Store, StoreConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StoreConfig::default()
//!         .with_fan_out(FanOutKind::DependencyNodes)
//!         .with_initial_key("settings", json!({"theme": "dark"}));
//!     let store = Store::new(config, Arc::new(InMemoryStore::new()));
//!     store.init().await.expect("Failed to init");
//!
//!     let handle = store
//!         .connect(ConnectOptions::collection("report_", |reports| {
//!             println!("reports: {reports}");
//!         }))
//!         .expect("Failed to connect");
//!
//!     let write = store.set("report_1", json!({"total": 3})).expect("Failed to set");
//!     write.settled().await.expect("Backend rejected write");
//!
//!     store.disconnect(handle);
//!     store.dispose();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: The [`Store`] façade and its lifecycle
//! - [`keys`]: Collection-key algebra
//! - [`merge`]: Deep merge engine
//! - [`cache`]: LRU cache with single-flight read-through
//! - [`notify`]: Notification hub and fan-out strategies
//! - [`connection`]: Subscriber deduplication
//! - [`storage`]: Durable backend boundary

pub mod binding;
pub mod cache;
pub mod config;
pub mod connection;
pub mod keys;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod storage;
pub mod store;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use binding::{Binding, KeyHold};
pub use cache::{CacheStats, Presence};
pub use config::StoreConfig;
pub use connection::{ConnectOptions, ConnectionHandle, ConnectionState};
pub use keys::KeyError;
pub use metrics::LatencyTimer;
pub use notify::{FanOutKind, Payload, Target};
pub use storage::{InMemoryStore, PersistentStore, StorageError};
pub use store::{PendingWrite, Store, StoreError, StoreLifecycle};
