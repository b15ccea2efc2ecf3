// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic deep merge for partial updates.
//!
//! Rules applied by [`deep_merge`]:
//!
//! - Two objects recurse key by key.
//! - Arrays, primitives and `null` in the source replace the target value.
//! - With `remove_nested_nulls`, a `null` member in the source deletes that
//!   path instead of storing `null`.
//! - With [`ReplacementMode::Mark`], an object introduced where the target
//!   was `null`/absent is recorded as a [`NullPatch`]: a backend applying
//!   patches incrementally cannot merge into `null` and must write that
//!   subtree whole.
//! - With [`ReplacementMode::Replace`], a source object carrying
//!   [`REPLACE_MARKER`] overwrites the target subtree outright.
//!
//! The marker only ever appears in payloads built by [`mark_replacements`]
//! for patch-capable backends. [`deep_merge`] strips it from every result,
//! so no value leaving this module (and nothing stored by the cache) carries it.
//!
//! # Example
//!
//! ```
//! use reactive_store::merge::{deep_merge, MergeOptions};
//! use serde_json::json;
//!
//! let out = deep_merge(
//!     &json!({"id": 1, "profile": null}),
//!     &json!({"name": "a", "profile": {"theme": "dark"}}),
//!     MergeOptions::for_cache(),
//! );
//! assert_eq!(out.result, json!({"id": 1, "name": "a", "profile": {"theme": "dark"}}));
//! assert_eq!(out.null_patches.len(), 1);
//! assert_eq!(out.null_patches[0].path, vec!["profile".to_string()]);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Object member flagging a subtree as a forced structural replace.
pub const REPLACE_MARKER: &str = "__replace_subtree__";

/// How structural replacements are handled during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementMode {
    /// No patch bookkeeping; markers are treated as ordinary (stripped) members.
    #[default]
    Ignore,
    /// Record a [`NullPatch`] wherever an object lands on a null/absent target.
    Mark,
    /// Honour [`REPLACE_MARKER`] in the source as a full subtree replace.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOptions {
    pub remove_nested_nulls: bool,
    pub replacement: ReplacementMode,
}

impl MergeOptions {
    /// Options used when applying a write to the cache.
    #[must_use]
    pub fn for_cache() -> Self {
        Self {
            remove_nested_nulls: true,
            replacement: ReplacementMode::Mark,
        }
    }

    /// Options used when batching queued partials; nulls survive so they can
    /// still delete paths when the batch is applied.
    #[must_use]
    pub fn for_batch() -> Self {
        Self {
            remove_nested_nulls: false,
            replacement: ReplacementMode::Ignore,
        }
    }

    /// Options used by a backend applying a patched partial.
    #[must_use]
    pub fn for_backend() -> Self {
        Self {
            remove_nested_nulls: true,
            replacement: ReplacementMode::Replace,
        }
    }
}

/// A subtree that must be written whole by a downstream backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullPatch {
    pub path: Vec<String>,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub result: Value,
    pub null_patches: Vec<NullPatch>,
}

/// Merge `source` into `target`. `Value::Null` as target means absent.
#[must_use]
pub fn deep_merge(target: &Value, source: &Value, options: MergeOptions) -> MergeOutput {
    let mut null_patches = Vec::new();
    let mut path = Vec::new();
    let result = merge_value(Some(target), source, options, &mut path, &mut null_patches);
    MergeOutput { result, null_patches }
}

fn merge_value(
    target: Option<&Value>,
    source: &Value,
    options: MergeOptions,
    path: &mut Vec<String>,
    patches: &mut Vec<NullPatch>,
) -> Value {
    let Value::Object(source_map) = source else {
        return source.clone();
    };

    if options.replacement == ReplacementMode::Replace && source_map.contains_key(REPLACE_MARKER) {
        return clean(source, options.remove_nested_nulls);
    }

    match target {
        Some(Value::Object(target_map)) => {
            let mut merged = target_map.clone();
            for (key, value) in source_map {
                if key == REPLACE_MARKER {
                    continue;
                }
                if value.is_null() {
                    if options.remove_nested_nulls {
                        merged.remove(key);
                    } else {
                        merged.insert(key.clone(), Value::Null);
                    }
                    continue;
                }
                path.push(key.clone());
                let next = merge_value(target_map.get(key), value, options, path, patches);
                path.pop();
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        other => {
            let replacement = clean(source, options.remove_nested_nulls);
            let target_is_empty = other.map_or(true, Value::is_null);
            if options.replacement == ReplacementMode::Mark && target_is_empty && !path.is_empty() {
                patches.push(NullPatch {
                    path: path.clone(),
                    value: replacement.clone(),
                });
            }
            replacement
        }
    }
}

/// Strip markers (and nested nulls if asked) from object members.
/// Arrays are left untouched.
fn clean(value: &Value, remove_nested_nulls: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, member) in map {
                if key == REPLACE_MARKER || (remove_nested_nulls && member.is_null()) {
                    continue;
                }
                out.insert(key.clone(), clean(member, remove_nested_nulls));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Remove `null` object members at every depth. A top-level `null` stays `null`.
#[must_use]
pub fn remove_nested_nulls(value: &Value) -> Value {
    clean(value, true)
}

/// Remove every [`REPLACE_MARKER`] from a value.
#[must_use]
pub fn strip_markers(value: &Value) -> Value {
    clean(value, false)
}

/// True if the value carries a replace marker anywhere in its object tree.
#[must_use]
pub fn has_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key(REPLACE_MARKER) || map.values().any(has_marker),
        _ => false,
    }
}

/// Fold queued partials into one, preserving nulls so they still delete
/// when the batch is applied.
#[must_use]
pub fn merge_partials(partials: &[Value]) -> Value {
    let mut iter = partials.iter();
    let Some(first) = iter.next() else {
        return Value::Null;
    };
    iter.fold(first.clone(), |acc, next| deep_merge(&acc, next, MergeOptions::for_batch()).result)
}

/// Embed null patches into a partial as marked subtrees, ready for a
/// [`ReplacementMode::Replace`] merge on the backend side.
#[must_use]
pub fn mark_replacements(partial: &Value, patches: &[NullPatch]) -> Value {
    let mut marked = partial.clone();
    for patch in patches {
        let Value::Object(mut replacement) = patch.value.clone() else {
            continue;
        };
        replacement.insert(REPLACE_MARKER.to_string(), Value::Bool(true));
        set_path(&mut marked, &patch.path, Value::Object(replacement));
    }
    marked
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map.entry(segment.clone()).or_insert(Value::Null);
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}
