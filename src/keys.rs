// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection key algebra.
//!
//! A **collection key** names a namespace and ends with the reserved
//! delimiter (`report_`). A **member key** is a collection key followed by a
//! non-empty suffix (`report_42`). Collections can look nested
//! (`report_` and `report_draft_`), so resolving a member back to its
//! collection picks the longest registered prefix.
//!
//! # Example
//!
//! ```
//! use reactive_store::keys::{KeyRegistry, is_member_key};
//!
//! let registry = KeyRegistry::with_collections('_', ["report_", "report_draft_"]);
//!
//! assert!(registry.is_collection_key("report_"));
//! assert!(is_member_key("report_1", "report_"));
//! assert_eq!(registry.resolve_collection_key("report_draft_7").unwrap(), "report_draft_");
//! assert_eq!(registry.split_member_key("report_9", None).unwrap(), ("report_", "9"));
//! ```

use std::collections::BTreeSet;
use thiserror::Error;

/// Default reserved delimiter terminating a collection key.
pub const DEFAULT_DELIMITER: char = '_';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("No registered collection key is a prefix of '{0}'")]
    InvalidKey(String),
}

/// True iff `candidate` starts with `collection_key` and is strictly longer.
#[inline]
#[must_use]
pub fn is_member_key(candidate: &str, collection_key: &str) -> bool {
    candidate.len() > collection_key.len() && candidate.starts_with(collection_key)
}

/// Registry of known collection keys.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    delimiter: char,
    collections: BTreeSet<String>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl KeyRegistry {
    #[must_use]
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            collections: BTreeSet::new(),
        }
    }

    /// Create a registry with collection keys registered up front.
    /// Keys that are not collection keys are ignored.
    pub fn with_collections<I, S>(delimiter: char, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new(delimiter);
        for key in keys {
            registry.register(key.as_ref());
        }
        registry
    }

    #[must_use]
    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// True iff the key ends with the reserved delimiter.
    #[must_use]
    pub fn is_collection_key(&self, key: &str) -> bool {
        key.ends_with(self.delimiter)
    }

    /// Register a collection key. Returns `false` if the key is not a
    /// collection key or was already registered.
    pub fn register(&mut self, key: &str) -> bool {
        if !self.is_collection_key(key) {
            return false;
        }
        self.collections.insert(key.to_string())
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.collections.contains(key)
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    /// Resolve the longest registered collection key that prefixes `member_key`.
    ///
    /// Scans backward from the rightmost delimiter, so the first registered
    /// candidate found is the longest one.
    pub fn resolve_collection_key<'a>(&self, member_key: &'a str) -> Result<&'a str, KeyError> {
        for (idx, ch) in member_key.char_indices().rev() {
            if ch != self.delimiter {
                continue;
            }
            let end = idx + ch.len_utf8();
            // A candidate must leave a non-empty suffix
            if end >= member_key.len() {
                continue;
            }
            let candidate = &member_key[..end];
            if self.collections.contains(candidate) {
                return Ok(candidate);
            }
        }
        Err(KeyError::InvalidKey(member_key.to_string()))
    }

    /// Split a member key into `(collection_key, suffix)`.
    ///
    /// A hint is used as-is when it is a collection key prefixing the member;
    /// otherwise falls back to [`resolve_collection_key`](Self::resolve_collection_key).
    pub fn split_member_key<'a>(
        &self,
        member_key: &'a str,
        hint: Option<&str>,
    ) -> Result<(&'a str, &'a str), KeyError> {
        if let Some(hint) = hint {
            if self.is_collection_key(hint) && is_member_key(member_key, hint) {
                return Ok(member_key.split_at(hint.len()));
            }
        }
        let collection = self.resolve_collection_key(member_key)?;
        Ok(member_key.split_at(collection.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> KeyRegistry {
        KeyRegistry::with_collections('_', ["report_", "report_draft_", "session_"])
    }

    #[test]
    fn test_is_collection_key() {
        let keys = registry();
        assert!(keys.is_collection_key("report_"));
        assert!(keys.is_collection_key("unregistered_"));
        assert!(!keys.is_collection_key("report_1"));
        assert!(!keys.is_collection_key("session"));
    }

    #[test]
    fn test_is_member_key_requires_strictly_longer() {
        assert!(is_member_key("report_1", "report_"));
        assert!(!is_member_key("report_", "report_"));
        assert!(!is_member_key("reports_1", "report_"));
        assert!(!is_member_key("rep", "report_"));
    }

    #[test]
    fn test_resolve_prefers_longest_registered_prefix() {
        let keys = registry();
        assert_eq!(keys.resolve_collection_key("report_draft_7").unwrap(), "report_draft_");
        assert_eq!(keys.resolve_collection_key("report_7").unwrap(), "report_");
        // Unregistered nested namespace falls back to the shorter registered one
        assert_eq!(keys.resolve_collection_key("report_final_7").unwrap(), "report_");
    }

    #[test]
    fn test_resolve_without_prefix_fails() {
        let keys = registry();
        assert_eq!(
            keys.resolve_collection_key("unknown_1"),
            Err(KeyError::InvalidKey("unknown_1".into()))
        );
        assert!(keys.resolve_collection_key("plain").is_err());
    }

    #[test]
    fn test_resolve_collection_key_itself_is_not_a_member() {
        let keys = registry();
        // "report_draft_" is a member-looking key of "report_" with suffix "draft_"
        assert_eq!(keys.resolve_collection_key("report_draft_").unwrap(), "report_");
        assert!(keys.resolve_collection_key("report_").is_err());
    }

    #[test]
    fn test_split_member_key_uses_valid_hint() {
        let keys = registry();
        assert_eq!(keys.split_member_key("report_draft_7", Some("report_")).unwrap(), ("report_", "draft_7"));
        assert_eq!(keys.split_member_key("report_draft_7", None).unwrap(), ("report_draft_", "7"));
    }

    #[test]
    fn test_split_member_key_ignores_invalid_hint() {
        let keys = registry();
        assert_eq!(keys.split_member_key("report_3", Some("session_")).unwrap(), ("report_", "3"));
        assert_eq!(keys.split_member_key("report_3", Some("report")).unwrap(), ("report_", "3"));
        assert!(keys.split_member_key("nothing", Some("nothing_")).is_err());
    }

    #[test]
    fn test_register_rejects_plain_keys() {
        let mut keys = KeyRegistry::default();
        assert!(!keys.register("session"));
        assert!(keys.register("session_"));
        assert!(!keys.register("session_"));
        assert!(keys.is_registered("session_"));
    }

    #[test]
    fn test_custom_delimiter() {
        let keys = KeyRegistry::with_collections(':', ["user:"]);
        assert!(keys.is_collection_key("user:"));
        assert_eq!(keys.split_member_key("user:42", None).unwrap(), ("user:", "42"));
    }
}
