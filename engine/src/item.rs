//! Stored item types.

use crate::{Etag, Key, Metadata};
use serde::{Deserialize, Serialize};

/// A keyed record with its metadata and payload.
///
/// Documents carry JSON payloads; attachments carry raw bytes. The etag is
/// assigned by the local storage engine on every physical write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item<P> {
    /// Unique key within the entity class
    pub key: Key,
    /// Local logical clock value of the last write
    pub etag: Etag,
    /// Replication metadata and user metadata
    pub metadata: Metadata,
    /// The stored value
    pub payload: P,
}

/// A JSON document.
pub type Document = Item<serde_json::Value>;

/// A binary attachment.
pub type Attachment = Item<Vec<u8>>;

impl<P> Item<P> {
    /// Create an item.
    pub fn new(key: impl Into<Key>, etag: Etag, metadata: Metadata, payload: P) -> Self {
        Self {
            key: key.into(),
            etag,
            metadata,
            payload,
        }
    }

    /// Whether this item is a conflict placeholder.
    pub fn is_conflicted(&self) -> bool {
        self.metadata.is_conflict_placeholder()
    }
}

/// An entry in a named append list, such as a tombstone list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    /// Key of the item this entry describes
    pub key: Key,
    /// Local logical clock value of the last write to this entry
    pub etag: Etag,
    /// Entry body
    pub data: Metadata,
}
