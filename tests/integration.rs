//! Integration Tests for Reactive Store
//!
//! End-to-end behavior of the store façade over an in-memory backend. Every
//! notification test runs once per fan-out strategy, since all four must be
//! observably identical.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Run only one group
//! cargo test --test integration happy_eviction
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: reads, writes, collections, lifecycle
//! - `reject_*` - Invalid calls that must fail without side effects

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use reactive_store::merge::NullPatch;
use reactive_store::{
    ConnectOptions, ConnectionState, FanOutKind, InMemoryStore, KeyError, Payload, PersistentStore, Presence,
    StorageError, Store, StoreConfig, StoreError, StoreLifecycle,
};

// =============================================================================
// Helpers
// =============================================================================

/// In-memory backend that counts reads and can slow them down.
struct CountingStore {
    inner: InMemoryStore,
    gets: AtomicUsize,
    delay: Duration,
}

impl CountingStore {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            gets: AtomicUsize::new(0),
            delay,
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistentStore for CountingStore {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove_item(key).await
    }

    fn supports_multi_merge(&self) -> bool {
        self.inner.supports_multi_merge()
    }

    async fn multi_merge(
        &self,
        pairs: &[(String, Value)],
        null_patches: &HashMap<String, Vec<NullPatch>>,
    ) -> Result<(), StorageError> {
        self.inner.multi_merge(pairs, null_patches).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.get_all_keys().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}

type Calls = Arc<Mutex<Vec<Value>>>;

/// Callback that records every payload it receives.
fn recorder() -> (Calls, impl Fn(&Payload) + Send + Sync + 'static) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    (calls, move |payload: &Payload| sink.lock().push((**payload).clone()))
}

async fn wait_for(calls: &Calls, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while calls.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("callbacks did not arrive in time");
}

/// Give spawned callback turns a chance to run.
async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn ready_store(config: StoreConfig) -> (Store, Arc<CountingStore>) {
    let storage = Arc::new(CountingStore::new());
    let store = Store::new(config, storage.clone());
    store.init().await.expect("init failed");
    (store, storage)
}

fn members(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
}

// =============================================================================
// Happy Path Tests
// =============================================================================

#[tokio::test]
async fn happy_end_to_end_session_and_reports() {
    for kind in FanOutKind::ALL {
        let (store, storage) = ready_store(StoreConfig::default().with_fan_out(kind)).await;

        let _ = store.set("session", json!({"id": 1})).unwrap();
        store.merge("session", json!({"name": "a"})).await.unwrap().settled().await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), json!({"id": 1, "name": "a"}), "{kind}");

        store.set("session", Value::Null).unwrap().settled().await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), Value::Null, "{kind}");
        assert_eq!(store.presence("session"), Presence::KnownNullish, "{kind}");
        assert_eq!(storage.gets(), 0, "{kind}: tombstone must not re-fetch");

        let partials = members(&[("report_1", json!({"t": 1})), ("report_2", json!({"t": 2}))]);
        store.merge_collection("report_", partials).await.unwrap().settled().await.unwrap();

        let (calls, callback) = recorder();
        store.connect(ConnectOptions::collection("report_", callback)).unwrap();
        assert!(calls.lock().is_empty(), "{kind}: first delivery is never synchronous");
        wait_for(&calls, 1).await;
        assert_eq!(
            calls.lock()[0],
            json!({"report_1": {"t": 1}, "report_2": {"t": 2}}),
            "{kind}"
        );
        store.dispose();
    }
}

#[tokio::test]
async fn happy_set_is_visible_before_persistence() {
    let (store, storage) = ready_store(StoreConfig::default()).await;
    let pending = store.set("k", json!({"v": 1})).unwrap();
    assert_eq!(store.get("k").await.unwrap(), json!({"v": 1}));
    pending.settled().await.unwrap();
    assert_eq!(storage.inner.peek("k"), Some(json!({"v": 1})));
}

#[tokio::test]
async fn happy_set_drops_nested_nulls() {
    let (store, storage) = ready_store(StoreConfig::default()).await;
    store.set("k", json!({"a": 1, "b": null, "c": {"d": null}})).unwrap().settled().await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), json!({"a": 1, "c": {}}));
    assert_eq!(storage.inner.peek("k"), Some(json!({"a": 1, "c": {}})));
}

#[tokio::test]
async fn happy_suppression_of_equal_values() {
    for kind in FanOutKind::ALL {
        let (store, _) = ready_store(StoreConfig::default().with_fan_out(kind)).await;
        let _ = store.set("k", json!({"a": 1})).unwrap();

        let (first, callback) = recorder();
        store.connect(ConnectOptions::key("k", callback)).unwrap();
        let (second, callback) = recorder();
        store.connect(ConnectOptions::key("k", callback)).unwrap();
        wait_for(&first, 1).await;
        wait_for(&second, 1).await;

        let _ = store.set("k", json!({"a": 1})).unwrap();
        store.merge("k", json!({"a": 1})).await.unwrap().settled().await.unwrap();
        quiesce().await;
        assert_eq!(first.lock().len(), 1, "{kind}");
        assert_eq!(second.lock().len(), 1, "{kind}");

        let _ = store.set("k", json!({"a": 2})).unwrap();
        assert_eq!(*first.lock(), vec![json!({"a": 1}), json!({"a": 2})], "{kind}");
        assert_eq!(*second.lock(), vec![json!({"a": 1}), json!({"a": 2})], "{kind}");
    }
}

#[tokio::test]
async fn happy_collection_member_stability() {
    for kind in FanOutKind::ALL {
        let (store, _) = ready_store(StoreConfig::default().with_fan_out(kind)).await;
        store
            .merge_collection("x_", members(&[("x_1", json!({"v": 1}))]))
            .await
            .unwrap();

        let (member, callback) = recorder();
        store.connect(ConnectOptions::key("x_1", callback)).unwrap();
        let (collection, callback) = recorder();
        store.connect(ConnectOptions::collection("x_", callback)).unwrap();
        wait_for(&member, 1).await;
        wait_for(&collection, 1).await;

        store
            .merge_collection("x_", members(&[("x_2", json!({"v": 2}))]))
            .await
            .unwrap();
        quiesce().await;

        assert_eq!(*member.lock(), vec![json!({"v": 1})], "{kind}");
        assert_eq!(
            *collection.lock(),
            vec![json!({"x_1": {"v": 1}}), json!({"x_1": {"v": 1}, "x_2": {"v": 2}})],
            "{kind}"
        );
    }
}

#[tokio::test]
async fn happy_member_removal_updates_collection() {
    for kind in FanOutKind::ALL {
        let (store, _) = ready_store(StoreConfig::default().with_fan_out(kind)).await;
        store
            .merge_collection("x_", members(&[("x_1", json!(1)), ("x_2", json!(2))]))
            .await
            .unwrap();
        let (collection, callback) = recorder();
        store.connect(ConnectOptions::collection("x_", callback)).unwrap();
        wait_for(&collection, 1).await;

        let _ = store.remove("x_1").unwrap();
        assert_eq!(collection.lock().last(), Some(&json!({"x_2": 2})), "{kind}");
        assert_eq!(store.get("x_").await.unwrap(), json!({"x_2": 2}), "{kind}");
    }
}

#[tokio::test]
async fn happy_eviction_and_single_flight() {
    let storage = Arc::new(CountingStore::with_delay(Duration::from_millis(20)));
    let store = Store::new(StoreConfig::default().with_max_cached_keys(3), storage.clone());
    store.init().await.unwrap();

    let pending: Vec<_> = (1..=5)
        .map(|n| store.set(&format!("k{n}"), json!(n)).unwrap())
        .collect();
    for write in pending {
        write.settled().await.unwrap();
    }

    assert_eq!(store.presence("k1"), Presence::Unknown);
    assert_eq!(store.presence("k2"), Presence::Unknown);
    for key in ["k3", "k4", "k5"] {
        assert_eq!(store.presence(key), Presence::Present, "{key}");
    }
    let stats = store.cache_stats();
    assert_eq!(stats.resident, 3);
    assert_eq!(stats.evicted_total, 2);

    let reads = join_all((0..8).map(|_| store.get("k1"))).await;
    assert!(reads.iter().all(|read| read.as_ref() == Ok(&json!(1))));
    assert_eq!(storage.gets(), 1);
    assert_eq!(store.presence("k1"), Presence::Present);
    assert_eq!(store.presence("k3"), Presence::Unknown);
}

#[tokio::test]
async fn happy_read_through_never_returns_value_older_than_overlapping_write() {
    let storage = Arc::new(CountingStore::with_delay(Duration::from_millis(30)));
    storage.inner.insert("k", json!("old"));
    let store = Store::new(StoreConfig::default().with_max_cached_keys(1), storage.clone());
    store.init().await.unwrap();

    let reading = {
        let store = store.clone();
        tokio::spawn(async move { store.get("k").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Written, persisted and evicted while the first fetch is still in flight
    store.set("k", json!("new")).unwrap().settled().await.unwrap();
    store.set("other", json!(1)).unwrap().settled().await.unwrap();
    assert_eq!(store.presence("k"), Presence::Unknown);

    assert_eq!(reading.await.unwrap().unwrap(), json!("new"));
    assert_eq!(storage.gets(), 2);
}

#[tokio::test]
async fn happy_connected_keys_are_not_evicted() {
    let (store, _) = ready_store(StoreConfig::default().with_max_cached_keys(2)).await;
    store.set("watched", json!(0)).unwrap().settled().await.unwrap();
    let (calls, callback) = recorder();
    let handle = store.connect(ConnectOptions::key("watched", callback)).unwrap();
    wait_for(&calls, 1).await;

    for n in 1..=4 {
        store.set(&format!("k{n}"), json!(n)).unwrap().settled().await.unwrap();
    }
    assert_eq!(store.presence("watched"), Presence::Present);

    store.disconnect(handle);
    store.set("k5", json!(5)).unwrap().settled().await.unwrap();
    assert_eq!(store.presence("watched"), Presence::Unknown);
}

#[tokio::test]
async fn happy_queued_merges_apply_on_stored_value() {
    let storage = Arc::new(CountingStore::with_delay(Duration::from_millis(10)));
    storage.inner.insert("doc", json!({"a": 1, "b": {"c": 1}}));
    let store = Store::new(StoreConfig::default(), storage.clone());
    store.init().await.unwrap();

    let (first, second) = tokio::join!(
        store.merge("doc", json!({"b": {"d": 2}})),
        store.merge("doc", json!({"a": null})),
    );
    first.unwrap().settled().await.unwrap();
    second.unwrap().settled().await.unwrap();

    assert_eq!(storage.gets(), 1);
    assert_eq!(store.get("doc").await.unwrap(), json!({"b": {"c": 1, "d": 2}}));
    assert_eq!(storage.inner.peek("doc"), Some(json!({"b": {"c": 1, "d": 2}})));
}

#[tokio::test]
async fn happy_merge_null_replaces_subtree_in_backend() {
    let storage = Arc::new(CountingStore::new());
    storage.inner.insert("doc", json!({"a": {"x": 1, "y": 2}}));
    let store = Store::new(StoreConfig::default(), storage.clone());
    store.init().await.unwrap();
    assert_eq!(store.get("doc").await.unwrap(), json!({"a": {"x": 1, "y": 2}}));

    store.merge("doc", json!({"a": null})).await.unwrap().settled().await.unwrap();
    store.merge("doc", json!({"a": {"z": 3}})).await.unwrap().settled().await.unwrap();

    assert_eq!(store.get("doc").await.unwrap(), json!({"a": {"z": 3}}));
    assert_eq!(storage.inner.peek("doc"), Some(json!({"a": {"z": 3}})));
}

#[tokio::test]
async fn happy_set_supersedes_queued_merges() {
    let storage = Arc::new(CountingStore::with_delay(Duration::from_millis(10)));
    storage.inner.insert("doc", json!({"a": 1}));
    let store = Store::new(StoreConfig::default(), storage.clone());
    store.init().await.unwrap();

    let merging = store.merge("doc", json!({"b": 2}));
    let setting = async {
        tokio::task::yield_now().await;
        store.set("doc", json!({"c": 3})).unwrap()
    };
    let (merged, set) = tokio::join!(merging, setting);
    merged.unwrap().settled().await.unwrap();
    set.settled().await.unwrap();

    assert_eq!(store.get("doc").await.unwrap(), json!({"c": 3}));
    assert_eq!(storage.inner.peek("doc"), Some(json!({"c": 3})));
}

#[tokio::test]
async fn happy_clear_resets_to_defaults() {
    for kind in FanOutKind::ALL {
        let config = StoreConfig::default()
            .with_fan_out(kind)
            .with_initial_key("settings", json!({"theme": "dark"}));
        let (store, storage) = ready_store(config).await;

        let _ = store.set("settings", json!({"theme": "light"})).unwrap();
        let _ = store.set("other", json!(1)).unwrap();
        let (calls, callback) = recorder();
        store.connect(ConnectOptions::key("other", callback)).unwrap();
        wait_for(&calls, 1).await;

        store.clear().unwrap().settled().await.unwrap();
        assert_eq!(store.get("settings").await.unwrap(), json!({"theme": "dark"}), "{kind}");
        assert_eq!(store.get("other").await.unwrap(), Value::Null, "{kind}");
        assert_eq!(*calls.lock(), vec![json!(1), Value::Null], "{kind}");
        assert_eq!(storage.inner.peek("other"), None, "{kind}");
        assert_eq!(storage.inner.peek("settings"), Some(json!({"theme": "dark"})), "{kind}");
        assert_eq!(store.get_all_keys().await.unwrap(), vec!["settings"], "{kind}");
    }
}

#[tokio::test]
async fn happy_clear_discards_reads_started_before_it() {
    for kind in FanOutKind::ALL {
        let storage = Arc::new(CountingStore::with_delay(Duration::from_millis(30)));
        storage.inner.insert("k", json!("old"));
        let store = Store::new(StoreConfig::default().with_fan_out(kind), storage.clone());
        store.init().await.unwrap();

        // Initial delivery and a direct read are both fetching "old"
        let (calls, callback) = recorder();
        store.connect(ConnectOptions::key("k", callback)).unwrap();
        let reading = {
            let store = store.clone();
            tokio::spawn(async move { store.get("k").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cleared = store.clear().unwrap();
        assert_eq!(reading.await.unwrap().unwrap(), Value::Null, "{kind}");
        cleared.settled().await.unwrap();
        wait_for(&calls, 1).await;
        quiesce().await;

        let seen = calls.lock().clone();
        assert!(seen.iter().all(Value::is_null), "{kind}: {seen:?}");
        assert_eq!(store.get("k").await.unwrap(), Value::Null, "{kind}");
        assert_eq!(storage.inner.peek("k"), None, "{kind}");
    }
}

#[tokio::test]
async fn happy_defaults_merge_under_stored_values() {
    let storage = Arc::new(CountingStore::new());
    storage.inner.insert("settings", json!({"theme": "light"}));
    let config = StoreConfig::default().with_initial_key("settings", json!({"theme": "dark", "font": 12}));
    let store = Store::new(config, storage.clone());
    store.init().await.unwrap();

    assert_eq!(store.get("settings").await.unwrap(), json!({"theme": "light", "font": 12}));
    assert_eq!(storage.inner.peek("settings"), Some(json!({"theme": "light"})));
}

#[tokio::test]
async fn happy_get_all_keys_tracks_writes() {
    let storage = Arc::new(CountingStore::new());
    storage.inner.insert("b", json!(1));
    let store = Store::new(StoreConfig::default(), storage);
    store.init().await.unwrap();

    let _ = store.set("a", json!(1)).unwrap();
    let _ = store.set("c", json!(1)).unwrap();
    let _ = store.remove("b").unwrap();
    assert_eq!(store.get_all_keys().await.unwrap(), vec!["a", "c"]);
}

#[tokio::test]
async fn happy_connect_before_init_waits_for_init() {
    let storage = Arc::new(CountingStore::new());
    storage.inner.insert("a", json!("stored"));
    let store = Store::new(StoreConfig::default(), storage);

    let (calls, callback) = recorder();
    let handle = store.connect(ConnectOptions::key("a", callback)).unwrap();
    quiesce().await;
    assert!(calls.lock().is_empty());
    assert_eq!(store.connection_state(handle), ConnectionState::Pending);

    store.init().await.unwrap();
    wait_for(&calls, 1).await;
    assert_eq!(*calls.lock(), vec![json!("stored")]);
    assert_eq!(store.connection_state(handle), ConnectionState::Active);
}

#[tokio::test]
async fn happy_writes_before_init_are_persisted() {
    let storage = Arc::new(CountingStore::new());
    let store = Store::new(StoreConfig::default(), storage.clone());
    let pending = store.set("early", json!(1)).unwrap();
    assert_eq!(storage.inner.peek("early"), None);

    store.init().await.unwrap();
    pending.settled().await.unwrap();
    assert_eq!(storage.inner.peek("early"), Some(json!(1)));
}

#[tokio::test]
async fn happy_disconnect_is_idempotent() {
    let (store, _) = ready_store(StoreConfig::default()).await;
    let (calls, callback) = recorder();
    let handle = store.connect(ConnectOptions::key("k", callback)).unwrap();
    wait_for(&calls, 1).await;
    assert_eq!(store.connection_state(handle), ConnectionState::Active);

    store.disconnect(handle);
    store.disconnect(handle);
    assert_eq!(store.connection_state(handle), ConnectionState::Closed);

    let _ = store.set("k", json!(1)).unwrap();
    quiesce().await;
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn happy_held_key_outlives_its_last_listener() {
    for kind in FanOutKind::ALL {
        let (store, _) = ready_store(StoreConfig::default().with_fan_out(kind)).await;
        let _ = store.set("k", json!(1)).unwrap();
        let per_key_nodes = kind == FanOutKind::DependencyNodes;

        let (calls, callback) = recorder();
        let handle = store.connect(ConnectOptions::key("k", callback)).unwrap();
        wait_for(&calls, 1).await;
        assert_eq!(store.is_tracked("k"), per_key_nodes, "{kind}");

        let hold = store.hold("k").unwrap();
        store.disconnect(handle);
        assert_eq!(store.is_tracked("k"), per_key_nodes, "{kind}");
        let _ = store.set("k", json!(2)).unwrap();
        assert_eq!(hold.get().await.unwrap(), json!(2), "{kind}");

        drop(hold);
        assert!(!store.is_tracked("k"), "{kind}");

        // With no holder the node goes with its last listener
        let (calls, callback) = recorder();
        let handle = store.connect(ConnectOptions::key("k", callback)).unwrap();
        wait_for(&calls, 1).await;
        store.disconnect(handle);
        assert!(!store.is_tracked("k"), "{kind}");
    }
}

#[tokio::test]
async fn happy_late_subscriber_gets_current_value() {
    for kind in FanOutKind::ALL {
        let (store, _) = ready_store(StoreConfig::default().with_fan_out(kind)).await;
        let _ = store.set("k", json!(1)).unwrap();
        let (first, callback) = recorder();
        store.connect(ConnectOptions::key("k", callback)).unwrap();
        wait_for(&first, 1).await;
        let _ = store.set("k", json!(2)).unwrap();

        let (late, callback) = recorder();
        store.connect(ConnectOptions::key("k", callback)).unwrap();
        wait_for(&late, 1).await;
        assert_eq!(*late.lock(), vec![json!(2)], "{kind}");
        assert_eq!(*first.lock(), vec![json!(1), json!(2)], "{kind}");
    }
}

#[tokio::test]
async fn happy_lifecycle_transitions() {
    let store = Store::new(StoreConfig::default(), Arc::new(InMemoryStore::new()));
    let mut lifecycle = store.lifecycle_receiver();
    assert_eq!(store.lifecycle(), StoreLifecycle::Created);

    store.init().await.unwrap();
    assert!(store.is_ready());
    assert!(lifecycle.has_changed().unwrap());
    assert_eq!(*lifecycle.borrow_and_update(), StoreLifecycle::Ready);
    assert!(matches!(store.init().await, Err(StoreError::InvalidOperation(_))));

    store.dispose();
    store.dispose();
    assert_eq!(store.lifecycle(), StoreLifecycle::Disposed);
    assert_eq!(store.get("k").await, Err(StoreError::Disposed));
    assert!(matches!(store.set("k", json!(1)), Err(StoreError::Disposed)));
    assert_eq!(store.init().await, Err(StoreError::Disposed));
}

// =============================================================================
// Rejected Calls
// =============================================================================

#[tokio::test]
async fn reject_writes_to_collection_keys() {
    let (store, _) = ready_store(StoreConfig::default()).await;
    assert!(matches!(store.set("report_", json!({})), Err(StoreError::InvalidOperation(_))));
    assert!(matches!(store.remove("report_"), Err(StoreError::InvalidOperation(_))));
    assert!(matches!(
        store.merge("report_", json!({})).await,
        Err(StoreError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn reject_merge_collection_with_stray_member() {
    let (store, _) = ready_store(StoreConfig::default()).await;
    let partials = members(&[("report_1", json!(1)), ("other", json!(2))]);
    let result = store.merge_collection("report_", partials).await;
    assert_eq!(
        result.err(),
        Some(StoreError::InvalidKey(KeyError::InvalidKey("other".into())))
    );
    assert_eq!(store.presence("report_1"), Presence::Unknown);

    // Resolves to a different registered collection
    store.merge_collection("report_", members(&[("report_1", json!(1))])).await.unwrap();
    let result = store.merge_collection("report_draft_", members(&[("report_2", json!(2))])).await;
    assert_eq!(
        result.err(),
        Some(StoreError::InvalidKey(KeyError::InvalidKey("report_2".into())))
    );
    assert_eq!(store.presence("report_2"), Presence::Unknown);

    let result = store.merge_collection("report", members(&[("report1", json!(1))])).await;
    assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
}

#[tokio::test]
async fn reject_connect_with_mismatched_collection_mode() {
    let (store, _) = ready_store(StoreConfig::default()).await;
    let result = store.connect(ConnectOptions::key("report_", |_| {}));
    assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
    let result = store.connect(ConnectOptions::collection("report", |_| {}));
    assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
}

#[tokio::test]
async fn reject_merge_collection_with_collection_key_member() {
    let (store, storage) = ready_store(StoreConfig::default()).await;
    let partials = members(&[("report_1", json!(1)), ("report_draft_", json!({"v": 1}))]);
    let result = store.merge_collection("report_", partials).await;

    assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
    store.set("report_2", json!(2)).unwrap().settled().await.unwrap();
    assert_eq!(storage.inner.peek("report_draft_"), None);
    assert_eq!(store.presence("report_1"), Presence::Unknown);
}
