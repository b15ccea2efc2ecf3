// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload selection shared by every fan-out strategy.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{Payload, Target};
use crate::keys::is_member_key;

/// Read-only view of current state, as seen by fan-out strategies.
///
/// Reading through a view must not affect cache recency.
pub trait StateView {
    fn value(&self, key: &str) -> Option<&Value>;

    /// Present (non-null) member keys of a collection, sorted.
    fn member_keys(&self, collection_key: &str) -> Vec<String>;
}

impl StateView for crate::cache::Cache {
    fn value(&self, key: &str) -> Option<&Value> {
        self.peek(key)
    }

    fn member_keys(&self, collection_key: &str) -> Vec<String> {
        self.members(collection_key)
            .into_iter()
            .map(|(key, _)| key.to_string())
            .collect()
    }
}

impl StateView for HashMap<String, Value> {
    fn value(&self, key: &str) -> Option<&Value> {
        self.get(key)
    }

    fn member_keys(&self, collection_key: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .iter()
            .filter(|(key, value)| is_member_key(key, collection_key) && !value.is_null())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }
}

/// Current value of a target: the key's value (`null` if absent), or the
/// mapping of present members for a collection target.
#[must_use]
pub fn select(target: &Target, view: &dyn StateView) -> Value {
    if !target.collection {
        return view.value(&target.key).cloned().unwrap_or(Value::Null);
    }
    let mut members = Map::new();
    for key in view.member_keys(&target.key) {
        if let Some(value) = view.value(&key) {
            members.insert(key, value.clone());
        }
    }
    Value::Object(members)
}

/// Wrap `next`, reusing `previous` when nothing actually changed.
///
/// For an aggregate this is membership-set equality plus per-member value
/// equality, so an untouched collection keeps the same allocation.
#[must_use]
pub fn stabilize(previous: Option<&Payload>, next: Value) -> Payload {
    match previous {
        Some(previous) if **previous == next => Arc::clone(previous),
        _ => Arc::new(next),
    }
}

/// [`select`] followed by [`stabilize`].
#[must_use]
pub fn derive(target: &Target, view: &dyn StateView, previous: Option<&Payload>) -> Payload {
    stabilize(previous, select(target, view))
}
