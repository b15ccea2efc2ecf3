// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authoritative in-memory cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Cache                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  entries   key → CacheEntry { value, rank }                  │
//! │  order     rank → key          (oldest rank = LRU victim)    │
//! │  pinned    key → in-flight durable writes (never evicted)    │
//! │  doomed    pinned keys past capacity, evicted on settle      │
//! │  blocked   keys/collections with live connections            │
//! │  flights   single-flight read-through tasks                  │
//! │  reads     flight ticket → waiters, overtaken by a write?    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `null` value is a tombstone: the key is known to be empty
//! ([`Presence::KnownNullish`]) and is never re-fetched. A key with no entry
//! is [`Presence::Unknown`].
//!
//! Eviction keeps at most `max_keys` live entries, always choosing the
//! least-recently-touched key. A key with a durable write still in flight is
//! not removed; it is *doomed* instead and leaves the cache the moment its
//! last write settles, unless it is touched again first.
//!
//! A write to a key with a read-through in flight retires that flight: its
//! result predates the write and must not be cached.

pub mod single_flight;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::keys::is_member_key;
use crate::storage::traits::StorageError;

pub use single_flight::{Captured, SharedTask, SingleFlight};

/// Result type of a read-through fetch shared by single-flight waiters.
pub type FetchResult = Result<Option<Value>, StorageError>;

/// What the cache knows about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// A non-null value is resident
    Present,
    /// The key is confirmed empty (tombstone)
    KnownNullish,
    /// Never seen, evicted, or cleared
    Unknown,
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present => write!(f, "Present"),
            Self::KnownNullish => write!(f, "KnownNullish"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// Recency rank; larger is more recent
    pub rank: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn presence(&self) -> Presence {
        if self.value.is_null() {
            Presence::KnownNullish
        } else {
            Presence::Present
        }
    }
}

/// Snapshot of cache bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub resident: usize,
    pub capacity: usize,
    pub pinned: usize,
    pub doomed: usize,
    pub evicted_total: u64,
}

#[derive(Default)]
struct ReadMark {
    waiters: usize,
    overtaken: bool,
}

pub struct Cache {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    tick: u64,
    max_keys: usize,
    pinned: HashMap<String, usize>,
    doomed: HashSet<String>,
    blocked: HashMap<String, usize>,
    flights: SingleFlight<FetchResult>,
    reads: HashMap<u64, ReadMark>,
    evicted_total: u64,
}

impl Cache {
    #[must_use]
    pub fn new(max_keys: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            max_keys,
            pinned: HashMap::new(),
            doomed: HashSet::new(),
            blocked: HashMap::new(),
            flights: SingleFlight::default(),
            reads: HashMap::new(),
            evicted_total: 0,
        }
    }

    /// Look up a key and mark it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Look up a key without affecting eviction order.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn presence(&self, key: &str) -> Presence {
        self.entries.get(key).map_or(Presence::Unknown, CacheEntry::presence)
    }

    /// Store a value (`null` stores a tombstone) and enforce capacity.
    /// Returns the keys evicted as a result.
    pub fn set(&mut self, key: &str, value: Value) -> Vec<String> {
        debug_assert!(!crate::merge::has_marker(&value), "replace marker reached the cache");
        self.insert(key, value);
        self.enforce_capacity()
    }

    /// Store many values with a single capacity check.
    pub fn merge_batch(&mut self, entries: Vec<(String, Value)>) -> Vec<String> {
        for (key, value) in entries {
            debug_assert!(!crate::merge::has_marker(&value), "replace marker reached the cache");
            self.insert(&key, value);
        }
        self.enforce_capacity()
    }

    /// Drop a key entirely (its presence becomes Unknown).
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.rank);
        self.doomed.remove(key);
        Some(entry.value)
    }

    /// Drop every entry and in-flight read. Pins and eviction blocks survive,
    /// since the writes and connections behind them are still live.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.doomed.clear();
        self.flights.clear();
        self.reads.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_keys
    }

    /// Present (non-tombstoned) members of a collection, sorted by key.
    #[must_use]
    pub fn members(&self, collection_key: &str) -> Vec<(&str, &Value)> {
        let mut members: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, entry)| is_member_key(key, collection_key) && !entry.value.is_null())
            .map(|(key, entry)| (key.as_str(), &entry.value))
            .collect();
        members.sort_unstable_by(|a, b| a.0.cmp(b.0));
        members
    }

    /// Keys from least to most recently used.
    pub fn lru_order(&self) -> impl Iterator<Item = &str> {
        self.order.values().map(String::as_str)
    }

    // --- In-flight durable writes ---

    /// Pin a key while a durable write for it is outstanding. Any read of
    /// the key still in flight is overtaken.
    pub fn begin_write(&mut self, key: &str) {
        *self.pinned.entry(key.to_string()).or_insert(0) += 1;
        let name = read_task_name(key);
        if let Some(ticket) = self.flights.ticket(&name) {
            self.flights.finish(&name, ticket);
            if let Some(mark) = self.reads.get_mut(&ticket) {
                mark.overtaken = true;
            }
        }
    }

    /// Release one pin. A doomed key with no pins left is evicted now.
    /// Returns the keys evicted.
    pub fn settle_write(&mut self, key: &str) -> Vec<String> {
        let released = match self.pinned.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.pinned.remove(key);
                true
            }
            None => false,
        };

        if released && self.doomed.remove(key) && self.remove(key).is_some() {
            self.evicted_total += 1;
            debug!(key, "Evicted doomed key after its write settled");
            return vec![key.to_string()];
        }
        Vec::new()
    }

    #[must_use]
    pub fn is_pinned(&self, key: &str) -> bool {
        self.pinned.contains_key(key)
    }

    #[must_use]
    pub fn is_doomed(&self, key: &str) -> bool {
        self.doomed.contains(key)
    }

    // --- Eviction block list ---

    /// Exempt a key, or every member of a collection key, from eviction.
    pub fn block_eviction(&mut self, key: &str) {
        *self.blocked.entry(key.to_string()).or_insert(0) += 1;
        self.doomed.retain(|doomed| doomed != key && !is_member_key(doomed, key));
    }

    pub fn unblock_eviction(&mut self, key: &str) -> Vec<String> {
        match self.blocked.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.blocked.remove(key);
            }
            None => return Vec::new(),
        }
        self.enforce_capacity()
    }

    fn is_blocked(&self, key: &str) -> bool {
        self.blocked.contains_key(key)
            || self.blocked.keys().any(|blocked| is_member_key(key, blocked))
    }

    // --- Single-flight read-through ---

    #[must_use]
    pub fn has_pending_read(&self, key: &str) -> bool {
        self.flights.has_pending(&read_task_name(key))
    }

    /// Join the read-through in flight for `key`, or start one with
    /// `producer`.
    pub fn capture_read<F, Fut>(&mut self, key: &str, producer: F) -> Captured<FetchResult>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = FetchResult> + Send + 'static,
    {
        let captured = self.flights.capture(&read_task_name(key), producer);
        self.reads.entry(captured.ticket).or_default().waiters += 1;
        captured
    }

    /// Retire a finished read. Returns `false` if a write overtook it, in
    /// which case its result must be discarded.
    pub fn finish_read(&mut self, key: &str, ticket: u64) -> bool {
        self.flights.finish(&read_task_name(key), ticket);
        let Some(mark) = self.reads.get_mut(&ticket) else {
            return true;
        };
        let overtaken = mark.overtaken;
        mark.waiters = mark.waiters.saturating_sub(1);
        if mark.waiters == 0 {
            self.reads.remove(&ticket);
        }
        !overtaken
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resident: self.entries.len(),
            capacity: self.max_keys,
            pinned: self.pinned.len(),
            doomed: self.doomed.len(),
            evicted_total: self.evicted_total,
        }
    }

    // --- Internal helpers ---

    fn next_rank(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let rank = self.next_rank();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.rank);
            entry.rank = rank;
            self.order.insert(rank, key.to_string());
        }
        // Touched again, so no longer among the least recently used
        self.doomed.remove(key);
    }

    fn insert(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            self.touch(key);
            return;
        }
        let rank = self.next_rank();
        self.entries.insert(key.to_string(), CacheEntry { value, rank });
        self.order.insert(rank, key.to_string());
    }

    /// Evict least-recently-touched keys until at capacity. Doomed keys count
    /// as already gone; blocked keys are skipped.
    fn enforce_capacity(&mut self) -> Vec<String> {
        let live = self.entries.len() - self.doomed.len();
        if live <= self.max_keys {
            return Vec::new();
        }
        let mut excess = live - self.max_keys;

        let mut victims = Vec::new();
        let mut newly_doomed = Vec::new();
        for key in self.order.values() {
            if excess == 0 {
                break;
            }
            if self.doomed.contains(key) || self.is_blocked(key) {
                continue;
            }
            if self.pinned.contains_key(key) {
                newly_doomed.push(key.clone());
            } else {
                victims.push(key.clone());
            }
            excess -= 1;
        }

        self.doomed.extend(newly_doomed);
        for key in &victims {
            self.remove(key);
        }
        if !victims.is_empty() {
            self.evicted_total += victims.len() as u64;
            debug!(evicted = victims.len(), resident = self.entries.len(), "Evicted LRU keys");
        }
        victims
    }
}

fn read_task_name(key: &str) -> String {
    format!("get:{key}")
}
