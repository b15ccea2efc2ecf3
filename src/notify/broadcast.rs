// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy B: global broadcast plus selector.
//!
//! Every write is offered to every listener. Each listener re-derives its
//! own slice with a pure selector and only propagates when the slice
//! changed. Subscriptions on the same target share one listener, and a
//! target keeps its [`ListenerId`] across unsubscribe/resubscribe.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::aggregate::{self, StateView};
use super::{Change, FanOut, FanOutKind, Payload, SubscriptionId, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

struct Listener {
    selector: Target,
    subscribers: BTreeSet<SubscriptionId>,
    slice: Option<Payload>,
}

#[derive(Default)]
pub struct GlobalBroadcast {
    listeners: BTreeMap<ListenerId, Listener>,
    /// Never pruned: a target keeps its identity for the hub's lifetime, so
    /// this grows with the number of distinct targets ever subscribed.
    identities: HashMap<Target, ListenerId>,
    owners: HashMap<SubscriptionId, ListenerId>,
    next_listener: u64,
}

impl GlobalBroadcast {
    /// Stable identity for a selector, allocated once.
    pub fn identity(&mut self, selector: &Target) -> ListenerId {
        if let Some(id) = self.identities.get(selector) {
            return *id;
        }
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.identities.insert(selector.clone(), id);
        id
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Re-run a listener's selector. Returns the slice and whether it changed.
    fn evaluate(listener: &mut Listener, view: &dyn StateView) -> (Payload, bool) {
        let next = aggregate::derive(&listener.selector, view, listener.slice.as_ref());
        let changed = listener
            .slice
            .as_ref()
            .map_or(true, |previous| !Arc::ptr_eq(previous, &next));
        listener.slice = Some(next.clone());
        (next, changed)
    }
}

impl FanOut for GlobalBroadcast {
    fn kind(&self) -> FanOutKind {
        FanOutKind::GlobalBroadcast
    }

    fn subscribe(&mut self, id: SubscriptionId, target: &Target) {
        let listener_id = self.identity(target);
        self.listeners
            .entry(listener_id)
            .or_insert_with(|| Listener {
                selector: target.clone(),
                subscribers: BTreeSet::new(),
                slice: None,
            })
            .subscribers
            .insert(id);
        self.owners.insert(id, listener_id);
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(listener_id) = self.owners.remove(&id) else {
            return;
        };
        if let Some(listener) = self.listeners.get_mut(&listener_id) {
            listener.subscribers.remove(&id);
            if listener.subscribers.is_empty() {
                self.listeners.remove(&listener_id);
            }
        }
    }

    fn snapshot(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Payload> {
        let listener_id = self.owners.get(&id)?;
        let listener = self.listeners.get_mut(listener_id)?;
        Some(Self::evaluate(listener, view).0)
    }

    fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<(SubscriptionId, Payload)> {
        if changes.is_empty() {
            return Vec::new();
        }
        crate::metrics::record_fan_out_evaluations(self.kind().as_str(), self.listeners.len());

        // No routing: every listener is asked
        let mut out = Vec::new();
        for listener in self.listeners.values_mut() {
            let (slice, changed) = Self::evaluate(listener, view);
            if changed {
                out.extend(listener.subscribers.iter().map(|id| (*id, slice.clone())));
            }
        }
        out
    }
}
