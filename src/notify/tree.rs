// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy C: mutation-intercepted state tree.
//!
//! State is reached only through [`StateTree`] accessors. Reads are
//! recorded in a [`ReadSet`] as `(path, version)` pairs; writes are
//! intercepted and bump the version of the written leaf and of every
//! collection branch containing it, but only when the value actually
//! changed.
//!
//! Readers get an immutable deep copy, memoized per subtree and rebuilt
//! lazily the next time that subtree is read after its own version moved.
//!
//! Any intercepted write wakes every watcher (the same global listener set
//! as [`broadcast`](super::broadcast)); a watcher re-reads only if one of
//! its recorded versions is stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::aggregate::StateView;
use super::{Change, FanOut, FanOutKind, Payload, SubscriptionId, Target};
use crate::keys::is_member_key;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Path {
    Leaf(String),
    Branch(String),
}

/// Versions observed by one reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    versions: BTreeMap<Path, u64>,
}

impl ReadSet {
    fn record(&mut self, path: Path, version: u64) {
        self.versions.insert(path, version);
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.versions.keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

struct Leaf {
    value: Value,
    version: u64,
    memo: Option<(u64, Payload)>,
}

struct Branch {
    members: BTreeSet<String>,
    version: u64,
    memo: Option<(u64, Payload)>,
}

/// Accessor boundary over the mirrored state.
#[derive(Default)]
pub struct StateTree {
    leaves: HashMap<String, Leaf>,
    branches: HashMap<String, Branch>,
    clock: u64,
}

impl StateTree {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ensure_leaf(&mut self, key: &str, view: &dyn StateView) {
        if self.leaves.contains_key(key) {
            return;
        }
        let version = self.tick();
        let value = view.value(key).cloned().unwrap_or(Value::Null);
        self.leaves.insert(key.to_string(), Leaf { value, version, memo: None });
    }

    fn ensure_branch(&mut self, collection_key: &str, view: &dyn StateView) {
        if self.branches.contains_key(collection_key) {
            return;
        }
        let members: BTreeSet<String> = view.member_keys(collection_key).into_iter().collect();
        for member in &members {
            self.ensure_leaf(member, view);
        }
        let version = self.tick();
        self.branches.insert(
            collection_key.to_string(),
            Branch { members, version, memo: None },
        );
    }

    /// Read a key, recording the leaf version.
    pub fn read(&mut self, key: &str, view: &dyn StateView, reads: &mut ReadSet) -> Payload {
        self.ensure_leaf(key, view);
        let Some(leaf) = self.leaves.get_mut(key) else {
            return Arc::new(Value::Null);
        };
        reads.record(Path::Leaf(key.to_string()), leaf.version);
        match &leaf.memo {
            Some((version, payload)) if *version == leaf.version => payload.clone(),
            _ => {
                let payload = Arc::new(leaf.value.clone());
                leaf.memo = Some((leaf.version, payload.clone()));
                payload
            }
        }
    }

    /// Read the present-member mapping of a collection, recording the branch version.
    pub fn read_collection(&mut self, collection_key: &str, view: &dyn StateView, reads: &mut ReadSet) -> Payload {
        self.ensure_branch(collection_key, view);
        let Some(branch) = self.branches.get(collection_key) else {
            return Arc::new(Value::Object(Map::new()));
        };
        reads.record(Path::Branch(collection_key.to_string()), branch.version);
        if let Some((version, payload)) = &branch.memo {
            if *version == branch.version {
                return payload.clone();
            }
        }

        let mut copy = Map::new();
        for member in &branch.members {
            if let Some(leaf) = self.leaves.get(member) {
                copy.insert(member.clone(), leaf.value.clone());
            }
        }
        let payload = Arc::new(Value::Object(copy));
        if let Some(branch) = self.branches.get_mut(collection_key) {
            branch.memo = Some((branch.version, payload.clone()));
        }
        payload
    }

    pub fn read_target(&mut self, target: &Target, view: &dyn StateView, reads: &mut ReadSet) -> Payload {
        if target.collection {
            self.read_collection(&target.key, view, reads)
        } else {
            self.read(&target.key, view, reads)
        }
    }

    /// Intercepted write. Returns `true` if any version moved.
    pub fn write(&mut self, key: &str, value: &Value) -> bool {
        let covering: Vec<String> = self
            .branches
            .keys()
            .filter(|collection| is_member_key(key, collection))
            .cloned()
            .collect();

        let leaf_changed = match self.leaves.get(key) {
            Some(leaf) => leaf.value != *value,
            None => !covering.is_empty(),
        };
        if !leaf_changed {
            return false;
        }

        let version = self.tick();
        match self.leaves.get_mut(key) {
            Some(leaf) => {
                leaf.value = value.clone();
                leaf.version = version;
            }
            None => {
                self.leaves.insert(
                    key.to_string(),
                    Leaf { value: value.clone(), version, memo: None },
                );
            }
        }

        for collection in covering {
            if let Some(branch) = self.branches.get_mut(&collection) {
                if value.is_null() {
                    branch.members.remove(key);
                } else {
                    branch.members.insert(key.to_string());
                }
                branch.version = version;
            }
        }
        true
    }

    #[must_use]
    pub fn version(&self, path: &Path) -> Option<u64> {
        match path {
            Path::Leaf(key) => self.leaves.get(key).map(|leaf| leaf.version),
            Path::Branch(key) => self.branches.get(key).map(|branch| branch.version),
        }
    }

    /// True if anything in `reads` moved (or was dropped) since it was read.
    #[must_use]
    pub fn is_stale(&self, reads: &ReadSet) -> bool {
        reads.is_empty()
            || reads
                .versions
                .iter()
                .any(|(path, version)| self.version(path) != Some(*version))
    }

    pub fn clear(&mut self) {
        self.leaves.clear();
        self.branches.clear();
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
}

struct Watcher {
    selector: Target,
    reads: ReadSet,
    subscribers: BTreeSet<SubscriptionId>,
    slice: Option<Payload>,
}

impl Watcher {
    /// Re-read through the tree if stale. Returns the slice and whether it changed.
    fn refresh(&mut self, tree: &mut StateTree, view: &dyn StateView) -> (Payload, bool) {
        if let Some(slice) = &self.slice {
            if !tree.is_stale(&self.reads) {
                return (slice.clone(), false);
            }
        }
        let mut reads = ReadSet::default();
        let next = tree.read_target(&self.selector, view, &mut reads);
        self.reads = reads;
        let changed = self
            .slice
            .as_ref()
            .map_or(true, |previous| !Arc::ptr_eq(previous, &next) && **previous != *next);
        if changed {
            self.slice = Some(next.clone());
        }
        (self.slice.clone().unwrap_or(next), changed)
    }
}

#[derive(Default)]
pub struct InterceptedTree {
    tree: StateTree,
    watchers: BTreeMap<u64, Watcher>,
    by_target: HashMap<Target, u64>,
    owners: HashMap<SubscriptionId, u64>,
    next_watcher: u64,
}

impl InterceptedTree {
    #[must_use]
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }
}

impl FanOut for InterceptedTree {
    fn kind(&self) -> FanOutKind {
        FanOutKind::InterceptedTree
    }

    fn subscribe(&mut self, id: SubscriptionId, target: &Target) {
        let watcher_id = match self.by_target.get(target) {
            Some(existing) => *existing,
            None => {
                self.next_watcher += 1;
                self.by_target.insert(target.clone(), self.next_watcher);
                self.next_watcher
            }
        };
        self.watchers
            .entry(watcher_id)
            .or_insert_with(|| Watcher {
                selector: target.clone(),
                reads: ReadSet::default(),
                subscribers: BTreeSet::new(),
                slice: None,
            })
            .subscribers
            .insert(id);
        self.owners.insert(id, watcher_id);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(watcher_id) = self.owners.remove(&id) else {
            return;
        };
        let Some(watcher) = self.watchers.get_mut(&watcher_id) else {
            return;
        };
        watcher.subscribers.remove(&id);
        if watcher.subscribers.is_empty() {
            let selector = watcher.selector.clone();
            self.watchers.remove(&watcher_id);
            self.by_target.remove(&selector);
        }
        if self.watchers.is_empty() {
            self.tree.clear();
        }
    }

    fn snapshot(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Payload> {
        let watcher_id = self.owners.get(&id)?;
        let watcher = self.watchers.get_mut(watcher_id)?;
        Some(watcher.refresh(&mut self.tree, view).0)
    }

    fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<(SubscriptionId, Payload)> {
        let mut moved = false;
        for change in changes {
            moved |= self.tree.write(&change.key, &change.value);
        }
        if !moved {
            return Vec::new();
        }
        crate::metrics::record_fan_out_evaluations(self.kind().as_str(), self.watchers.len());

        let mut out = Vec::new();
        for watcher in self.watchers.values_mut() {
            let (slice, changed) = watcher.refresh(&mut self.tree, view);
            if changed {
                out.extend(watcher.subscribers.iter().map(|id| (*id, slice.clone())));
            }
        }
        out
    }
}
