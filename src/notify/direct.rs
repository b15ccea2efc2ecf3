// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy A: direct key map.
//!
//! Exact-key subscriptions live in a key → subscriptions map, so a write
//! finds them in O(1). Collection subscriptions sit in a side map that is
//! scanned with [`is_member_key`] on every write.

use std::collections::{BTreeSet, HashMap};

use super::aggregate::{self, StateView};
use super::{Change, FanOut, FanOutKind, Payload, SubscriptionId, Target};
use crate::keys::is_member_key;

#[derive(Default)]
pub struct DirectKeyMap {
    by_key: HashMap<String, BTreeSet<SubscriptionId>>,
    by_collection: HashMap<String, BTreeSet<SubscriptionId>>,
    targets: HashMap<SubscriptionId, Target>,
    last: HashMap<SubscriptionId, Payload>,
}

impl DirectKeyMap {
    fn index_for(&mut self, target: &Target) -> &mut HashMap<String, BTreeSet<SubscriptionId>> {
        if target.collection {
            &mut self.by_collection
        } else {
            &mut self.by_key
        }
    }

    fn affected(&self, changes: &[Change]) -> BTreeSet<SubscriptionId> {
        let mut affected = BTreeSet::new();
        for change in changes {
            if let Some(ids) = self.by_key.get(&change.key) {
                affected.extend(ids.iter().copied());
            }
            for (collection, ids) in &self.by_collection {
                if is_member_key(&change.key, collection) {
                    affected.extend(ids.iter().copied());
                }
            }
        }
        affected
    }
}

impl FanOut for DirectKeyMap {
    fn kind(&self) -> FanOutKind {
        FanOutKind::DirectKeyMap
    }

    fn subscribe(&mut self, id: SubscriptionId, target: &Target) {
        self.index_for(target)
            .entry(target.key.clone())
            .or_default()
            .insert(id);
        self.targets.insert(id, target.clone());
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some(target) = self.targets.remove(&id) else {
            return;
        };
        self.last.remove(&id);
        let index = self.index_for(&target);
        if let Some(ids) = index.get_mut(&target.key) {
            ids.remove(&id);
            if ids.is_empty() {
                index.remove(&target.key);
            }
        }
    }

    fn snapshot(&mut self, id: SubscriptionId, view: &dyn StateView) -> Option<Payload> {
        let target = self.targets.get(&id)?;
        let payload = aggregate::derive(target, view, self.last.get(&id));
        self.last.insert(id, payload.clone());
        Some(payload)
    }

    fn publish(&mut self, changes: &[Change], view: &dyn StateView) -> Vec<(SubscriptionId, Payload)> {
        let affected = self.affected(changes);
        crate::metrics::record_fan_out_evaluations(self.kind().as_str(), affected.len());

        affected
            .into_iter()
            .filter_map(|id| {
                let payload = self.snapshot(id, view)?;
                Some((id, payload))
            })
            .collect()
    }
}
