// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notification hub and its pluggable fan-out strategies.
//!
//! Every strategy honours one contract: a subscription on a key receives the
//! key's value, a subscription on a collection key receives the mapping of
//! present members, and a payload is never delivered twice in a row when it
//! is value-equal to the last one delivered to that subscription.
//!
//! The strategies differ only in how a published change finds the
//! subscriptions it affects:
//!
//! | Strategy | Module | Cost per write |
//! |----------|--------|----------------|
//! | Direct key map | [`direct`] | O(1) exact + O(collection subscriptions) |
//! | Global broadcast + selector | [`broadcast`] | O(all listeners) |
//! | Mutation-intercepted tree | [`tree`] | O(all watchers), re-reads only stale ones |
//! | Dependency-tracked nodes | [`nodes`] | O(listeners of the written node) |

pub mod aggregate;
pub mod broadcast;
pub mod direct;
pub mod nodes;
pub mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::merge::NullPatch;

pub use aggregate::StateView;

/// Immutable value handed to subscribers. Cloning is a reference bump, and
/// an unchanged collection aggregate keeps the same allocation.
pub type Payload = Arc<Value>;

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub key: String,
    /// Watch every member of `key` (a collection key) as one mapping
    pub collection: bool,
}

impl Target {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            collection: false,
        }
    }

    pub fn collection(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            collection: true,
        }
    }

    /// True if a write to `key` can change this target's payload.
    #[must_use]
    pub fn is_affected_by(&self, key: &str) -> bool {
        if self.collection {
            crate::keys::is_member_key(key, &self.key)
        } else {
            self.key == key
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.collection {
            write!(f, "{}*", self.key)
        } else {
            write!(f, "{}", self.key)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// One applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub key: String,
    pub previous: Value,
    pub value: Value,
    pub null_patches: Vec<NullPatch>,
}

impl Change {
    pub fn new(key: impl Into<String>, previous: Value, value: Value) -> Self {
        Self {
            key: key.into(),
            previous,
            value,
            null_patches: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_patches(mut self, null_patches: Vec<NullPatch>) -> Self {
        self.null_patches = null_patches;
        self
    }
}

/// A payload addressed to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subscription: SubscriptionId,
    pub payload: Payload,
}

/// Which fan-out strategy a hub runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutKind {
    #[default]
    DirectKeyMap,
    GlobalBroadcast,
    InterceptedTree,
    DependencyNodes,
}

impl FanOutKind {
    pub const ALL: [FanOutKind; 4] = [
        Self::DirectKeyMap,
        Self::GlobalBroadcast,
        Self::InterceptedTree,
        Self::DependencyNodes,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectKeyMap => "direct_key_map",
            Self::GlobalBroadcast => "global_broadcast",
            Self::InterceptedTree => "intercepted_tree",
            Self::DependencyNodes => "dependency_nodes",
        }
    }
}

impl std::fmt::Display for FanOutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How published changes reach subscriptions.
///
/// Implementations return candidate payloads; suppression of repeats is
/// done once, by the hub.
pub trait FanOut: Send {
    fn kind(&self) -> FanOutKind;

    fn subscribe(&mut self, id: SubscriptionId, target: &Target);

    fn unsubscribe(&mut self, id: SubscriptionId);

    /// Keep per-key state for `key` alive for a direct reader, even with no
    /// subscription listening to it. Strategies without per-key state ignore
    /// holders.
    fn hold(&mut self, _key: &str, _view: &dyn StateView) {}

    fn release(&mut self, _key: &str) {}

    /// Whether per-key state for `key` currently exists.
    fn tracks(&self, _key: &str) -> bool {
        false
    }

    /// Current payload for a subscription.
    fn snapshot(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Payload>;

    /// Route already-applied changes. `view` reflects the state after them.
    fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<(SubscriptionId, Payload)>;
}

#[must_use]
pub fn strategy_for(kind: FanOutKind) -> Box<dyn FanOut> {
    match kind {
        FanOutKind::DirectKeyMap => Box::new(direct::DirectKeyMap::default()),
        FanOutKind::GlobalBroadcast => Box::new(broadcast::GlobalBroadcast::default()),
        FanOutKind::InterceptedTree => Box::new(tree::InterceptedTree::default()),
        FanOutKind::DependencyNodes => Box::new(nodes::DependencyNodes::default()),
    }
}

struct SubscriptionState {
    target: Target,
    primed: bool,
    last_delivered: Option<Payload>,
}

/// Subscription registry in front of a fan-out strategy.
pub struct NotificationHub {
    strategy: Box<dyn FanOut>,
    subscriptions: HashMap<SubscriptionId, SubscriptionState>,
    next_id: u64,
}

impl NotificationHub {
    #[must_use]
    pub fn new(kind: FanOutKind) -> Self {
        Self {
            strategy: strategy_for(kind),
            subscriptions: HashMap::new(),
            next_id: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> FanOutKind {
        self.strategy.kind()
    }

    /// Register a subscription. It receives nothing until [`prime`](Self::prime)
    /// delivers its initial payload.
    pub fn subscribe(&mut self, target: Target) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.strategy.subscribe(id, &target);
        debug!(subscription = id.0, target = %target, strategy = %self.kind(), "Subscribed");
        self.subscriptions.insert(
            id,
            SubscriptionState {
                target,
                primed: false,
                last_delivered: None,
            },
        );
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        if self.subscriptions.remove(&id).is_none() {
            return false;
        }
        self.strategy.unsubscribe(id);
        debug!(subscription = id.0, "Unsubscribed");
        true
    }

    pub fn hold(&mut self, key: &str, view: &dyn StateView) {
        self.strategy.hold(key, view);
    }

    pub fn release(&mut self, key: &str) {
        self.strategy.release(key);
    }

    #[must_use]
    pub fn tracks(&self, key: &str) -> bool {
        self.strategy.tracks(key)
    }

    /// Produce the initial delivery for a subscription. Always delivered,
    /// and from then on the subscription receives published changes.
    pub fn prime(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Notification> {
        let state = self.subscriptions.get_mut(&id)?;
        let payload = self.strategy.snapshot(id, view)?;
        state.primed = true;
        state.last_delivered = Some(payload.clone());
        Some(Notification {
            subscription: id,
            payload,
        })
    }

    /// Route applied changes to subscriptions, dropping repeats.
    pub fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<Notification> {
        if changes.is_empty() {
            return Vec::new();
        }
        let candidates = self.strategy.publish(changes, view);

        let mut delivered = Vec::with_capacity(candidates.len());
        let mut suppressed = 0;
        for (id, payload) in candidates {
            let Some(state) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            if !state.primed {
                continue;
            }
            if let Some(last) = &state.last_delivered {
                if Arc::ptr_eq(last, &payload) || **last == *payload {
                    suppressed += 1;
                    continue;
                }
            }
            state.last_delivered = Some(payload.clone());
            delivered.push(Notification {
                subscription: id,
                payload,
            });
        }

        let strategy = self.kind().as_str();
        if suppressed > 0 {
            crate::metrics::record_suppressed(strategy, suppressed);
        }
        if !delivered.is_empty() {
            crate::metrics::record_notifications(strategy, delivered.len());
            debug!(changes = changes.len(), delivered = delivered.len(), suppressed, strategy, "Published changes");
        }
        delivered
    }

    #[must_use]
    pub fn target(&self, id: SubscriptionId) -> Option<&Target> {
        self.subscriptions.get(&id).map(|state| &state.target)
    }

    #[must_use]
    pub fn is_primed(&self, id: SubscriptionId) -> bool {
        self.subscriptions.get(&id).is_some_and(|state| state.primed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn write(view: &mut HashMap<String, Value>, key: &str, value: Value) -> Change {
        let previous = view.insert(key.to_string(), value.clone()).unwrap_or(Value::Null);
        Change::new(key, previous, value)
    }

    #[test]
    fn test_fan_out_kind_names() {
        for kind in FanOutKind::ALL {
            let parsed: FanOutKind = serde_json::from_value(json!(kind.as_str())).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_target_is_affected_by() {
        assert!(Target::key("a").is_affected_by("a"));
        assert!(!Target::key("a").is_affected_by("a_1"));
        assert!(Target::collection("x_").is_affected_by("x_1"));
        assert!(!Target::collection("x_").is_affected_by("x_"));
    }

    #[test]
    fn test_unprimed_subscription_receives_nothing() {
        for kind in FanOutKind::ALL {
            let mut view = state(&[("a", json!(1))]);
            let mut hub = NotificationHub::new(kind);
            let id = hub.subscribe(Target::key("a"));

            let change = write(&mut view, "a", json!(2));
            assert!(hub.publish(&[change], &view).is_empty(), "{}", kind);

            let primed = hub.prime(id, &view).unwrap();
            assert_eq!(*primed.payload, json!(2));
            assert!(hub.is_primed(id));
        }
    }

    #[test]
    fn test_equal_value_is_suppressed() {
        for kind in FanOutKind::ALL {
            let mut view = state(&[("a", json!({"n": 1}))]);
            let mut hub = NotificationHub::new(kind);
            let first = hub.subscribe(Target::key("a"));
            let second = hub.subscribe(Target::key("a"));
            hub.prime(first, &view);
            hub.prime(second, &view);

            let change = write(&mut view, "a", json!({"n": 1}));
            assert!(hub.publish(&[change], &view).is_empty(), "{}", kind);

            let change = write(&mut view, "a", json!({"n": 2}));
            let delivered = hub.publish(&[change], &view);
            assert_eq!(delivered.len(), 2, "{}", kind);
        }
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        for kind in FanOutKind::ALL {
            let mut view = state(&[]);
            let mut hub = NotificationHub::new(kind);
            let id = hub.subscribe(Target::key("a"));
            hub.prime(id, &view);
            assert!(hub.unsubscribe(id));
            assert!(!hub.unsubscribe(id));

            let change = write(&mut view, "a", json!(1));
            assert!(hub.publish(&[change], &view).is_empty(), "{}", kind);
            assert!(hub.is_empty());
        }
    }

    #[test]
    fn test_collection_subscription_sees_members_only() {
        for kind in FanOutKind::ALL {
            let mut view = state(&[("x_1", json!({"t": 1}))]);
            let mut hub = NotificationHub::new(kind);
            let all = hub.subscribe(Target::collection("x_"));
            let one = hub.subscribe(Target::key("x_1"));
            assert_eq!(*hub.prime(all, &view).unwrap().payload, json!({"x_1": {"t": 1}}));
            hub.prime(one, &view);

            let change = write(&mut view, "x_2", json!({"t": 2}));
            let delivered = hub.publish(&[change], &view);
            assert_eq!(delivered.len(), 1, "{}", kind);
            assert_eq!(delivered[0].subscription, all);
            assert_eq!(*delivered[0].payload, json!({"x_1": {"t": 1}, "x_2": {"t": 2}}));

            // Tombstoning a member drops it from the aggregate
            let change = write(&mut view, "x_1", Value::Null);
            let delivered = hub.publish(&[change], &view);
            let for_all: Vec<_> = delivered.iter().filter(|n| n.subscription == all).collect();
            assert_eq!(*for_all[0].payload, json!({"x_2": {"t": 2}}), "{}", kind);
            assert!(delivered.iter().any(|n| n.subscription == one && n.payload.is_null()), "{}", kind);
        }
    }

    #[test]
    fn test_unrelated_write_does_not_deliver() {
        for kind in FanOutKind::ALL {
            let mut view = state(&[("a", json!(1))]);
            let mut hub = NotificationHub::new(kind);
            let id = hub.subscribe(Target::key("a"));
            hub.prime(id, &view);

            let change = write(&mut view, "b", json!(1));
            assert!(hub.publish(&[change], &view).is_empty(), "{}", kind);
        }
    }
}
