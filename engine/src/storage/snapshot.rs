//! Snapshot types for persisting and restoring storage state.
//!
//! Snapshots are the bridge between [`super::MemoryStorage`] and durable
//! storage. They use `BTreeMap` throughout so serialization is deterministic.

use super::memory::State;
use crate::{error::Result, Attachment, DatabaseId, Document, Error, Etag, Key, ListItem};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every committed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Database the state belongs to
    pub database_id: DatabaseId,
    /// Highest etag handed out; restored storages continue after it
    pub last_etag: Etag,
    pub documents: BTreeMap<Key, Document>,
    pub attachments: BTreeMap<Key, Attachment>,
    /// Named lists, then entries by key
    pub lists: BTreeMap<String, BTreeMap<Key, ListItem>>,
}

impl StorageSnapshot {
    /// Create an empty snapshot.
    pub fn new(database_id: impl Into<DatabaseId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            database_id: database_id.into(),
            last_etag: Etag::EMPTY,
            documents: BTreeMap::new(),
            attachments: BTreeMap::new(),
            lists: BTreeMap::new(),
        }
    }

    pub(super) fn from_parts(database_id: DatabaseId, last_etag: Etag, state: &State) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            database_id,
            last_etag,
            documents: state.documents.clone(),
            attachments: state.attachments.clone(),
            lists: state.lists.clone(),
        }
    }

    /// Add a document, advancing `last_etag` past it.
    pub fn add_document(&mut self, doc: Document) {
        self.last_etag = self.last_etag.max(doc.etag);
        self.documents.insert(doc.key.clone(), doc);
    }

    /// Add an attachment, advancing `last_etag` past it.
    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.last_etag = self.last_etag.max(attachment.etag);
        self.attachments.insert(attachment.key.clone(), attachment);
    }

    /// Add a list entry, advancing `last_etag` past it.
    pub fn add_list_item(&mut self, list: impl Into<String>, item: ListItem) {
        self.last_etag = self.last_etag.max(item.etag);
        self.lists
            .entry(list.into())
            .or_default()
            .insert(item.key.clone(), item);
    }

    /// Total number of stored entries.
    pub fn item_count(&self) -> usize {
        self.documents.len()
            + self.attachments.len()
            + self.lists.values().map(|items| items.len()).sum::<usize>()
    }

    /// Check internal consistency.
    ///
    /// Every entry must sit under its own key and no etag may exceed
    /// `last_etag`, otherwise a restored storage could hand out duplicates.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let entries = self
            .documents
            .iter()
            .map(|(key, doc)| (key, &doc.key, doc.etag))
            .chain(
                self.attachments
                    .iter()
                    .map(|(key, attachment)| (key, &attachment.key, attachment.etag)),
            )
            .chain(
                self.lists
                    .values()
                    .flat_map(|items| items.iter().map(|(key, item)| (key, &item.key, item.etag))),
            );

        for (slot, key, etag) in entries {
            if slot != key {
                return Err(Error::InvalidSnapshot(format!(
                    "entry '{key}' stored under '{slot}'"
                )));
            }
            if etag > self.last_etag {
                return Err(Error::InvalidSnapshot(format!(
                    "etag {etag} of '{key}' is beyond last etag {}",
                    self.last_etag
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
