//! Item metadata: the replication fields plus an open string-keyed map.

use crate::{history::ReplicationVersion, DatabaseId, History, Timestamp, Version};
use serde::{Deserialize, Deserializer, Serialize};

/// Metadata attached to every replicated item.
///
/// The replication fields are typed; anything else a client stores in the
/// metadata lives in `extra` and round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Database that authored this version
    #[serde(
        rename = "replicationSource",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<DatabaseId>,
    /// Per-source version counter
    #[serde(
        rename = "replicationVersion",
        default,
        deserialize_with = "lenient_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<Version>,
    /// Ancestor versions, oldest first
    #[serde(
        rename = "replicationHistory",
        default,
        skip_serializing_if = "History::is_empty"
    )]
    pub history: History,
    /// Set on tombstones
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_marker: bool,
    /// Explicit opt-out from outbound replication
    #[serde(default, skip_serializing_if = "is_false")]
    pub not_for_replication: bool,
    /// Set on conflict placeholders and conflict holders
    #[serde(
        rename = "replicationConflict",
        default,
        skip_serializing_if = "is_false"
    )]
    pub conflict: bool,
    /// Set on conflict holders
    #[serde(
        rename = "replicationConflictDocument",
        default,
        skip_serializing_if = "is_false"
    )]
    pub conflict_document: bool,
    /// Milliseconds since epoch of the last physical write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    /// Everything else
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Metadata {
    /// Metadata for a version authored by `source`.
    pub fn authored_by(source: impl Into<DatabaseId>, version: Version) -> Self {
        Self {
            source: Some(source.into()),
            version: Some(version),
            ..Self::default()
        }
    }

    /// Builder-style history setter.
    pub fn with_history(mut self, history: impl Into<History>) -> Self {
        self.history = history.into();
        self
    }

    /// Builder-style delete marker setter.
    pub fn deleted(mut self) -> Self {
        self.delete_marker = true;
        self
    }

    /// The `(source, version)` pair, if both halves are present.
    pub fn replication_version(&self) -> Option<ReplicationVersion> {
        match (&self.source, self.version) {
            (Some(source), Some(version)) => Some(ReplicationVersion::new(source.clone(), version)),
            _ => None,
        }
    }

    /// Whether both items carry the same complete `(source, version)`.
    pub fn same_version_as(&self, other: &Metadata) -> bool {
        match (self.replication_version(), other.replication_version()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    /// A conflict placeholder: the parent item of a conflict, whose payload
    /// lists the holders. Holders themselves are not placeholders.
    pub fn is_conflict_placeholder(&self) -> bool {
        self.conflict && !self.conflict_document
    }

    /// This version's history plus its own `(source, version)`.
    ///
    /// Anything descending from this version should carry at least this.
    pub fn lineage(&self, cap: usize) -> History {
        let mut lineage = self.history.clone();
        if let Some(version) = self.replication_version() {
            lineage.merge_version(version, cap);
        }
        lineage
    }

    /// Drop every replication field, keeping only the open map.
    pub fn without_replication(&self) -> Metadata {
        Metadata {
            extra: self.extra.clone(),
            ..Metadata::default()
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

// Versions sent by older peers may be strings; anything unparseable reads as
// absent, which pushes the item down the conflict path instead of dropping it.
fn lenient_version<'de, D>(deserializer: D) -> Result<Option<Version>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
