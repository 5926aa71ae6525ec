//! Replication history: the bounded causal record carried by every item.
//!
//! Each version of an item names the database that authored it (`source`)
//! and that database's version counter. The item also carries a capped list
//! of the `(source, version)` pairs it descends from. The list is lossy on
//! purpose: once it exceeds the configured length the oldest entries fall
//! off, so a `false` from [`is_direct_child_of`] never proves that an item is
//! newer. It only says "not known to descend".

use crate::{DatabaseId, Metadata, Version};
use serde::{Deserialize, Deserializer, Serialize};

/// Default number of ancestors kept in a history.
pub const DEFAULT_HISTORY_LENGTH: usize = 50;

/// One authored version of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationVersion {
    /// Database that authored this version
    pub source: DatabaseId,
    /// Per-source version counter
    pub version: Version,
}

impl ReplicationVersion {
    pub fn new(source: impl Into<DatabaseId>, version: Version) -> Self {
        Self {
            source: source.into(),
            version,
        }
    }
}

/// Ordered list of ancestor versions, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History(Vec<ReplicationVersion>);

impl History {
    /// Create an empty history.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicationVersion> {
        self.0.iter()
    }

    pub fn contains(&self, version: &ReplicationVersion) -> bool {
        self.0.contains(version)
    }

    /// Append a version, then drop the oldest entries beyond `cap`.
    pub fn push_capped(&mut self, version: ReplicationVersion, cap: usize) {
        self.0.push(version);
        self.trim(cap);
    }

    /// Drop the oldest entries until at most `cap` remain.
    pub fn trim(&mut self, cap: usize) {
        if self.0.len() > cap {
            let excess = self.0.len() - cap;
            self.0.drain(..excess);
        }
    }

    /// Union `other` into this history.
    ///
    /// Entries already present keep their position; new entries are appended
    /// in `other`'s order. The result is trimmed to `cap`.
    pub fn merge(&mut self, other: &History, cap: usize) {
        for version in other.iter() {
            if !self.0.contains(version) {
                self.0.push(version.clone());
            }
        }
        self.trim(cap);
    }

    /// Like [`History::merge`] for a single version.
    pub fn merge_version(&mut self, version: ReplicationVersion, cap: usize) {
        if !self.0.contains(&version) {
            self.0.push(version);
        }
        self.trim(cap);
    }
}

impl From<Vec<ReplicationVersion>> for History {
    fn from(versions: Vec<ReplicationVersion>) -> Self {
        Self(versions)
    }
}

impl FromIterator<ReplicationVersion> for History {
    fn from_iter<I: IntoIterator<Item = ReplicationVersion>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Malformed entries are skipped rather than failing the whole item: an item
// with an unreadable history must still reach the conflict path.
impl<'de> Deserialize<'de> for History {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let entries = match raw {
            serde_json::Value::Array(entries) => entries,
            _ => return Ok(History::new()),
        };

        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<ReplicationVersion>(entry).ok())
            .collect())
    }
}

/// True iff `current`'s own `(source, version)` appears in `candidate`'s
/// history.
///
/// This is the only causality test in the engine. Items without a complete
/// `(source, version)` are never anyone's parent.
pub fn is_direct_child_of(candidate: &Metadata, current: &Metadata) -> bool {
    match current.replication_version() {
        Some(version) => candidate.history.contains(&version),
        None => false,
    }
}

/// Make `metadata` describe a new local version.
///
/// The current `(source, version)` (if any) moves into the history, which is
/// trimmed to `cap`; the item is then re-attributed to `local_source` with
/// `next_version`.
pub fn advance(metadata: &mut Metadata, local_source: &str, next_version: Version, cap: usize) {
    if let Some(current) = metadata.replication_version() {
        metadata.history.push_capped(current, cap);
    }
    metadata.source = Some(local_source.to_string());
    metadata.version = Some(next_version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(source: &str, version: Version) -> ReplicationVersion {
        ReplicationVersion::new(source, version)
    }

    fn metadata(source: &str, version: Version, history: Vec<ReplicationVersion>) -> Metadata {
        Metadata {
            source: Some(source.to_string()),
            version: Some(version),
            history: History::from(history),
            ..Metadata::default()
        }
    }

    #[test]
    fn direct_child_when_parent_in_history() {
        let parent = metadata("A", 5, vec![]);
        let child = metadata("B", 1, vec![v("A", 5)]);
        assert!(is_direct_child_of(&child, &parent));
        assert!(!is_direct_child_of(&parent, &child));
    }

    #[test]
    fn unrelated_items_are_not_children() {
        let left = metadata("A", 5, vec![v("A", 4)]);
        let right = metadata("C", 1, vec![]);
        assert!(!is_direct_child_of(&left, &right));
        assert!(!is_direct_child_of(&right, &left));
    }

    #[test]
    fn item_without_version_is_nobodys_parent() {
        let parent = Metadata::default();
        let child = metadata("B", 1, vec![v("A", 5)]);
        assert!(!is_direct_child_of(&child, &parent));
    }

    #[test]
    fn advance_moves_current_into_history() {
        let mut meta = metadata("A", 5, vec![v("A", 4)]);
        advance(&mut meta, "B", 9, 10);

        assert_eq!(meta.source.as_deref(), Some("B"));
        assert_eq!(meta.version, Some(9));
        assert_eq!(meta.history, History::from(vec![v("A", 4), v("A", 5)]));
    }

    #[test]
    fn advance_on_fresh_item_keeps_history_empty() {
        let mut meta = Metadata::default();
        advance(&mut meta, "B", 1, 10);
        assert!(meta.history.is_empty());
        assert_eq!(meta.replication_version(), Some(v("B", 1)));
    }

    #[test]
    fn push_capped_drops_oldest() {
        let mut history = History::new();
        for i in 1..=5 {
            history.push_capped(v("A", i), 3);
        }
        assert_eq!(history, History::from(vec![v("A", 3), v("A", 4), v("A", 5)]));
    }

    #[test]
    fn merge_is_deduplicated_union() {
        let mut left = History::from(vec![v("A", 1), v("B", 2)]);
        let right = History::from(vec![v("B", 2), v("C", 3)]);
        left.merge(&right, 10);
        assert_eq!(left, History::from(vec![v("A", 1), v("B", 2), v("C", 3)]));
    }

    #[test]
    fn merge_respects_cap() {
        let mut left = History::from(vec![v("A", 1), v("A", 2)]);
        let right = History::from(vec![v("B", 1), v("B", 2)]);
        left.merge(&right, 3);
        assert_eq!(left, History::from(vec![v("A", 2), v("B", 1), v("B", 2)]));
    }

    #[test]
    fn lenient_deserialization_skips_bad_entries() {
        let history: History = serde_json::from_value(json!([
            {"source": "A", "version": 1},
            {"source": "B"},
            "garbage",
            {"source": "C", "version": 3}
        ]))
        .unwrap();
        assert_eq!(history, History::from(vec![v("A", 1), v("C", 3)]));

        let not_an_array: History = serde_json::from_value(json!({"x": 1})).unwrap();
        assert!(not_an_array.is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_version() -> impl Strategy<Value = ReplicationVersion> {
            (prop_oneof![Just("A"), Just("B"), Just("C")], 1u64..20)
                .prop_map(|(source, version)| ReplicationVersion::new(source, version))
        }

        proptest! {
            #[test]
            fn prop_merge_stays_capped_and_deduplicated(
                left in prop::collection::vec(arb_version(), 0..30),
                right in prop::collection::vec(arb_version(), 0..30),
                cap in 1usize..20,
            ) {
                let mut merged = History::new();
                merged.merge(&left.into_iter().collect(), cap);
                let right: History = right.into_iter().collect();
                merged.merge(&right, cap);

                prop_assert!(merged.len() <= cap);
                let mut seen = std::collections::HashSet::new();
                for version in merged.iter() {
                    prop_assert!(seen.insert(version.clone()), "duplicate {:?}", version);
                }
            }

            #[test]
            fn prop_advance_makes_a_direct_child(
                history in prop::collection::vec(arb_version(), 0..10),
                version in 1u64..100,
                cap in 1usize..20,
            ) {
                let parent = Metadata {
                    source: Some("A".to_string()),
                    version: Some(version),
                    history: history.into_iter().collect(),
                    ..Metadata::default()
                };
                let mut child = parent.clone();
                advance(&mut child, "B", version + 1, cap);

                prop_assert!(is_direct_child_of(&child, &parent));
                prop_assert!(child.history.len() <= cap);
            }
        }
    }
}
