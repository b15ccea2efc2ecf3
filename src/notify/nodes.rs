// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy D: dependency-tracked nodes.
//!
//! One source node per key (and one membership node per collection key),
//! created lazily on first tracked access and owning its own listener set.
//!
//! Dependency discovery is explicit: a [`TrackingContext`] is threaded
//! through [`NodeGraph::get`] and [`NodeGraph::members`], and every node
//! read while it is active is recorded. A computed node runs its function
//! through a [`Reader`] carrying a fresh context, then listens to exactly
//! the nodes it read. A `set` marks only that node's listeners dirty; they
//! recompute the next time they are read.
//!
//! Source nodes are released once they have neither listeners nor holders.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::aggregate::{self, StateView};
use super::{Change, FanOut, FanOutKind, Payload, SubscriptionId, Target};
use crate::keys::is_member_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputedId(pub u64);

/// A node a computation can depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Value(String),
    Members(String),
}

/// Reads recorded during one tracked computation.
#[derive(Debug, Clone, Default)]
pub struct TrackingContext {
    reads: BTreeSet<Source>,
}

impl TrackingContext {
    fn track(&mut self, source: Source) {
        self.reads.insert(source);
    }

    pub fn reads(&self) -> impl Iterator<Item = &Source> {
        self.reads.iter()
    }

    fn into_reads(self) -> BTreeSet<Source> {
        self.reads
    }
}

pub type ComputeFn = Arc<dyn Fn(&mut Reader<'_>) -> Value + Send + Sync>;

/// Handle a computed node reads through; every read is tracked.
pub struct Reader<'a> {
    graph: &'a mut NodeGraph,
    view: &'a dyn StateView,
    context: TrackingContext,
}

impl Reader<'_> {
    pub fn get(&mut self, key: &str) -> Value {
        self.graph.get(key, self.view, Some(&mut self.context))
    }

    pub fn members(&mut self, collection_key: &str) -> Vec<String> {
        self.graph.members(collection_key, self.view, Some(&mut self.context))
    }
}

struct SourceNode<T> {
    value: T,
    listeners: BTreeSet<ComputedId>,
    holders: usize,
}

impl<T> SourceNode<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            listeners: BTreeSet::new(),
            holders: 0,
        }
    }

    fn is_orphaned(&self) -> bool {
        self.listeners.is_empty() && self.holders == 0
    }
}

struct ComputedNode {
    compute: ComputeFn,
    deps: BTreeSet<Source>,
    value: Option<Value>,
    dirty: bool,
}

#[derive(Default)]
pub struct NodeGraph {
    values: HashMap<String, SourceNode<Value>>,
    memberships: HashMap<String, SourceNode<BTreeSet<String>>>,
    computed: HashMap<ComputedId, ComputedNode>,
    next_computed: u64,
}

impl NodeGraph {
    /// Read a key. With a context the read is tracked (and the node created);
    /// without one an existing node is read, else the view.
    pub fn get(&mut self, key: &str, view: &dyn StateView, context: Option<&mut TrackingContext>) -> Value {
        match context {
            Some(context) => {
                context.track(Source::Value(key.to_string()));
                self.value_node(key, view).value.clone()
            }
            None => match self.values.get(key) {
                Some(node) => node.value.clone(),
                None => view.value(key).cloned().unwrap_or(Value::Null),
            },
        }
    }

    /// Present member keys of a collection, sorted.
    pub fn members(&mut self, collection_key: &str, view: &dyn StateView, context: Option<&mut TrackingContext>) -> Vec<String> {
        match context {
            Some(context) => {
                context.track(Source::Members(collection_key.to_string()));
                self.membership_node(collection_key, view).value.iter().cloned().collect()
            }
            None => match self.memberships.get(collection_key) {
                Some(node) => node.value.iter().cloned().collect(),
                None => view.member_keys(collection_key),
            },
        }
    }

    /// Apply a write. Returns the computed nodes it dirtied.
    pub fn set(&mut self, key: &str, value: &Value) -> BTreeSet<ComputedId> {
        let mut dirtied = BTreeSet::new();

        if let Some(node) = self.values.get_mut(key) {
            if node.value != *value {
                node.value = value.clone();
                dirtied.extend(node.listeners.iter().copied());
            }
        }

        for (collection, node) in &mut self.memberships {
            if !is_member_key(key, collection) {
                continue;
            }
            let moved = if value.is_null() {
                node.value.remove(key)
            } else {
                node.value.insert(key.to_string())
            };
            if moved {
                dirtied.extend(node.listeners.iter().copied());
            }
        }

        for id in &dirtied {
            if let Some(computed) = self.computed.get_mut(id) {
                computed.dirty = true;
            }
        }
        dirtied
    }

    /// Keep a key's node alive without listening to it.
    pub fn hold(&mut self, key: &str, view: &dyn StateView) {
        self.value_node(key, view).holders += 1;
    }

    pub fn release(&mut self, key: &str) {
        if let Some(node) = self.values.get_mut(key) {
            node.holders = node.holders.saturating_sub(1);
        }
        self.release_if_orphaned(&Source::Value(key.to_string()));
    }

    pub fn create_computed(&mut self, compute: ComputeFn) -> ComputedId {
        self.next_computed += 1;
        let id = ComputedId(self.next_computed);
        self.computed.insert(
            id,
            ComputedNode {
                compute,
                deps: BTreeSet::new(),
                value: None,
                dirty: true,
            },
        );
        id
    }

    /// Current value of a computed node, recomputing if dirty.
    pub fn read_computed(&mut self, id: ComputedId, view: &dyn StateView) -> Option<Value> {
        let node = self.computed.get(&id)?;
        if !node.dirty {
            if let Some(value) = &node.value {
                return Some(value.clone());
            }
        }

        let compute = Arc::clone(&node.compute);
        let mut reader = Reader {
            graph: self,
            view,
            context: TrackingContext::default(),
        };
        let value = compute(&mut reader);
        let reads = reader.context.into_reads();
        self.rewire(id, reads);

        let node = self.computed.get_mut(&id)?;
        node.value = Some(value.clone());
        node.dirty = false;
        Some(value)
    }

    pub fn drop_computed(&mut self, id: ComputedId) {
        let Some(node) = self.computed.remove(&id) else {
            return;
        };
        for source in node.deps {
            if let Some(listeners) = self.listeners_mut(&source) {
                listeners.remove(&id);
            }
            self.release_if_orphaned(&source);
        }
    }

    #[must_use]
    pub fn is_dirty(&self, id: ComputedId) -> bool {
        self.computed.get(&id).map_or(false, |node| node.dirty)
    }

    #[must_use]
    pub fn dependencies(&self, id: ComputedId) -> Vec<Source> {
        self.computed
            .get(&id)
            .map(|node| node.deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_node(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.values.len() + self.memberships.len()
    }

    fn value_node(&mut self, key: &str, view: &dyn StateView) -> &mut SourceNode<Value> {
        self.values
            .entry(key.to_string())
            .or_insert_with(|| SourceNode::new(view.value(key).cloned().unwrap_or(Value::Null)))
    }

    fn membership_node(&mut self, collection_key: &str, view: &dyn StateView) -> &mut SourceNode<BTreeSet<String>> {
        self.memberships
            .entry(collection_key.to_string())
            .or_insert_with(|| SourceNode::new(view.member_keys(collection_key).into_iter().collect()))
    }

    fn listeners_mut(&mut self, source: &Source) -> Option<&mut BTreeSet<ComputedId>> {
        match source {
            Source::Value(key) => self.values.get_mut(key).map(|node| &mut node.listeners),
            Source::Members(key) => self.memberships.get_mut(key).map(|node| &mut node.listeners),
        }
    }

    fn release_if_orphaned(&mut self, source: &Source) {
        match source {
            Source::Value(key) => {
                if self.values.get(key).is_some_and(SourceNode::is_orphaned) {
                    self.values.remove(key);
                }
            }
            Source::Members(key) => {
                if self.memberships.get(key).is_some_and(SourceNode::is_orphaned) {
                    self.memberships.remove(key);
                }
            }
        }
    }

    /// Point a computed node's subscriptions at what it just read.
    fn rewire(&mut self, id: ComputedId, reads: BTreeSet<Source>) {
        let previous = match self.computed.get_mut(&id) {
            Some(node) => std::mem::take(&mut node.deps),
            None => return,
        };
        for source in previous.difference(&reads) {
            if let Some(listeners) = self.listeners_mut(source) {
                listeners.remove(&id);
            }
            self.release_if_orphaned(source);
        }
        for source in &reads {
            if let Some(listeners) = self.listeners_mut(source) {
                listeners.insert(id);
            }
        }
        if let Some(node) = self.computed.get_mut(&id) {
            node.deps = reads;
        }
    }
}

/// Computation selecting a target's payload through tracked reads.
fn selector(target: Target) -> ComputeFn {
    Arc::new(move |reader: &mut Reader<'_>| {
        if !target.collection {
            return reader.get(&target.key);
        }
        let mut members = Map::new();
        for member in reader.members(&target.key) {
            let value = reader.get(&member);
            if !value.is_null() {
                members.insert(member, value);
            }
        }
        Value::Object(members)
    })
}

struct NodeSubscription {
    computed: ComputedId,
    last: Option<Payload>,
}

#[derive(Default)]
pub struct DependencyNodes {
    graph: NodeGraph,
    subscriptions: HashMap<SubscriptionId, NodeSubscription>,
    owners: HashMap<ComputedId, SubscriptionId>,
}

impl DependencyNodes {
    #[must_use]
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }
}

impl FanOut for DependencyNodes {
    fn kind(&self) -> FanOutKind {
        FanOutKind::DependencyNodes
    }

    fn subscribe(&mut self, id: SubscriptionId, target: &Target) {
        let computed = self.graph.create_computed(selector(target.clone()));
        self.owners.insert(computed, id);
        self.subscriptions.insert(id, NodeSubscription { computed, last: None });
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.remove(&id) {
            self.owners.remove(&subscription.computed);
            self.graph.drop_computed(subscription.computed);
        }
    }

    fn hold(&mut self, key: &str, view: &dyn StateView) {
        self.graph.hold(key, view);
    }

    fn release(&mut self, key: &str) {
        self.graph.release(key);
    }

    fn tracks(&self, key: &str) -> bool {
        self.graph.has_node(key)
    }

    fn snapshot(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Payload> {
        let subscription = self.subscriptions.get_mut(&id)?;
        let value = self.graph.read_computed(subscription.computed, view)?;
        let payload = aggregate::stabilize(subscription.last.as_ref(), value);
        subscription.last = Some(payload.clone());
        Some(payload)
    }

    fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<(SubscriptionId, Payload)> {
        let mut dirtied = BTreeSet::new();
        for change in changes {
            dirtied.extend(self.graph.set(&change.key, &change.value));
        }
        crate::metrics::record_fan_out_evaluations(self.kind().as_str(), dirtied.len());

        let mut out = Vec::with_capacity(dirtied.len());
        for computed in dirtied {
            let Some(id) = self.owners.get(&computed).copied() else {
                continue;
            };
            if let Some(payload) = self.snapshot(id, view) {
                out.push((id, payload));
            }
        }
        out
    }
}
