//! Entity classes that replicate: documents and attachments.
//!
//! The conflict engine, the tombstone writer and the local write path are
//! generic over [`ReplicatedEntity`]; each entity class only says how to
//! read, write and delete its items and how its conflict placeholder looks.

use crate::{error::Result, Etag, Item, Key, Metadata, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Tombstone list of deleted documents.
pub const DOCUMENT_TOMBSTONES: &str = "Tangle/Replication/Docs/Tombstones";

/// Tombstone list of deleted attachments.
pub const ATTACHMENT_TOMBSTONES: &str = "Tangle/Replication/Attachments/Tombstones";

const CONFLICTS_SEGMENT: &str = "/conflicts/";

/// Which entity class an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicatedItemType {
    Document,
    Attachment,
}

impl fmt::Display for ReplicatedItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatedItemType::Document => write!(f, "document"),
            ReplicatedItemType::Attachment => write!(f, "attachment"),
        }
    }
}

/// Capabilities the replication algorithms need from an entity class.
pub trait ReplicatedEntity: Send + Sync + 'static {
    type Payload: Clone + fmt::Debug + Send + Sync + 'static;

    const KIND: ReplicatedItemType;

    /// Name of the list holding this class's tombstones.
    const TOMBSTONES: &'static str;

    fn get<T: Transaction>(tx: &T, key: &str) -> Result<Option<Item<Self::Payload>>>;

    fn put<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Self::Payload,
    ) -> Result<Etag>;

    fn delete<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
    ) -> Result<Option<Item<Self::Payload>>>;

    /// Payload of a conflict placeholder naming `holders`.
    fn conflict_placeholder(holders: &[Key]) -> Self::Payload;

    /// Holder keys named by a conflict placeholder's payload.
    fn conflict_holders(payload: &Self::Payload) -> Vec<Key>;

    /// Payload stored for a holder that represents a delete.
    fn empty_payload() -> Self::Payload;
}

/// JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Documents;

impl ReplicatedEntity for Documents {
    type Payload = Value;

    const KIND: ReplicatedItemType = ReplicatedItemType::Document;
    const TOMBSTONES: &'static str = DOCUMENT_TOMBSTONES;

    fn get<T: Transaction>(tx: &T, key: &str) -> Result<Option<Item<Value>>> {
        tx.document(key)
    }

    fn put<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Value,
    ) -> Result<Etag> {
        tx.put_document(key, expected, metadata, payload)
    }

    fn delete<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
    ) -> Result<Option<Item<Value>>> {
        tx.delete_document(key, expected)
    }

    fn conflict_placeholder(holders: &[Key]) -> Value {
        json!({ "Conflicts": holders })
    }

    fn conflict_holders(payload: &Value) -> Vec<Key> {
        payload
            .get("Conflicts")
            .and_then(Value::as_array)
            .map(|holders| {
                holders
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn empty_payload() -> Value {
        json!({})
    }
}

/// Binary attachments. The placeholder is the document placeholder
/// serialized to bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attachments;

impl ReplicatedEntity for Attachments {
    type Payload = Vec<u8>;

    const KIND: ReplicatedItemType = ReplicatedItemType::Attachment;
    const TOMBSTONES: &'static str = ATTACHMENT_TOMBSTONES;

    fn get<T: Transaction>(tx: &T, key: &str) -> Result<Option<Item<Vec<u8>>>> {
        tx.attachment(key)
    }

    fn put<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Etag> {
        tx.put_attachment(key, expected, metadata, payload)
    }

    fn delete<T: Transaction>(
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
    ) -> Result<Option<Item<Vec<u8>>>> {
        tx.delete_attachment(key, expected)
    }

    fn conflict_placeholder(holders: &[Key]) -> Vec<u8> {
        Documents::conflict_placeholder(holders).to_string().into_bytes()
    }

    fn conflict_holders(payload: &Vec<u8>) -> Vec<Key> {
        serde_json::from_slice::<Value>(payload)
            .map(|value| Documents::conflict_holders(&value))
            .unwrap_or_default()
    }

    fn empty_payload() -> Vec<u8> {
        Vec::new()
    }
}

/// `<key>/conflicts/<id>`
pub fn conflict_holder_key(key: &str, id: &str) -> Key {
    format!("{key}{CONFLICTS_SEGMENT}{id}")
}

/// Holder id for an incoming item: a name-based UUID of its source and the
/// sender's etag, so a redelivered item lands on the same holder.
pub fn incoming_holder_id(source: &str, sender_etag: Etag) -> String {
    let name = format!("{source}/{sender_etag}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// The item key a holder key belongs to, if `key` names a holder.
pub fn holder_parent(key: &str) -> Option<&str> {
    key.rfind(CONFLICTS_SEGMENT).map(|at| &key[..at])
}
