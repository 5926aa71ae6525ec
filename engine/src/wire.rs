//! JSON wire format of replicated items.
//!
//! A document travels as its payload object with an `@metadata` property
//! carrying the replication metadata plus `@id` and `@etag`. A tombstone is
//! the same shape with an empty payload and `deleteMarker` set. Attachments
//! carry their bytes under `data`.

use crate::{error::Result, Attachment, Document, Error, Etag, ListItem, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const METADATA_PROPERTY: &str = "@metadata";
pub const ID_PROPERTY: &str = "@id";
pub const ETAG_PROPERTY: &str = "@etag";

/// Parse one inbound document. The etag is the sender's.
pub fn parse_document(value: Value) -> Result<Document> {
    let Value::Object(mut payload) = value else {
        return Err(Error::InvalidBatch("replicated document must be an object".into()));
    };

    let mut raw_metadata = match payload.remove(METADATA_PROPERTY) {
        Some(Value::Object(metadata)) => metadata,
        Some(_) => return Err(Error::InvalidBatch("@metadata must be an object".into())),
        None => Map::new(),
    };
    let key = match raw_metadata.remove(ID_PROPERTY) {
        Some(Value::String(key)) if !key.is_empty() => key,
        _ => return Err(Error::InvalidBatch("replicated document has no @id".into())),
    };
    let etag = match raw_metadata.remove(ETAG_PROPERTY) {
        Some(raw) => serde_json::from_value::<Etag>(raw)
            .map_err(|err| Error::InvalidBatch(format!("bad @etag on '{key}': {err}")))?,
        None => Etag::EMPTY,
    };
    let metadata: Metadata = serde_json::from_value(Value::Object(raw_metadata))?;

    Ok(Document::new(key, etag, metadata, Value::Object(payload)))
}

/// Parse an inbound document batch: a JSON array of documents.
pub fn parse_documents(value: Value) -> Result<Vec<Document>> {
    match value {
        Value::Array(items) => items.into_iter().map(parse_document).collect(),
        _ => Err(Error::InvalidBatch("replication batch must be an array".into())),
    }
}

/// Render a document for sending.
pub fn document_to_wire(doc: &Document) -> Result<Value> {
    let mut object = match &doc.payload {
        Value::Object(payload) => payload.clone(),
        _ => Map::new(),
    };
    object.insert(METADATA_PROPERTY.into(), wire_metadata(&doc.key, doc.etag, &doc.metadata)?);
    Ok(Value::Object(object))
}

/// Render a tombstone as a deleted document.
pub fn tombstone_to_wire(tombstone: &ListItem) -> Result<Value> {
    let mut object = Map::new();
    object.insert(
        METADATA_PROPERTY.into(),
        wire_metadata(&tombstone.key, tombstone.etag, &tombstone.data)?,
    );
    Ok(Value::Object(object))
}

fn wire_metadata(key: &str, etag: Etag, metadata: &Metadata) -> Result<Value> {
    let mut value = serde_json::to_value(metadata)?;
    if let Value::Object(object) = &mut value {
        object.insert(ID_PROPERTY.into(), Value::String(key.to_string()));
        object.insert(ETAG_PROPERTY.into(), serde_json::to_value(etag)?);
    }
    Ok(value)
}

/// An attachment on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAttachment {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@etag", default)]
    pub etag: Etag,
    #[serde(rename = "@metadata", default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl From<WireAttachment> for Attachment {
    fn from(wire: WireAttachment) -> Self {
        Attachment::new(wire.id, wire.etag, wire.metadata, wire.data)
    }
}

impl From<&Attachment> for WireAttachment {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.key.clone(),
            etag: attachment.etag,
            metadata: attachment.metadata.clone(),
            data: attachment.payload.clone(),
        }
    }
}

/// Parse an inbound attachment batch.
pub fn parse_attachments(value: Value) -> Result<Vec<Attachment>> {
    let wire: Vec<WireAttachment> = serde_json::from_value(value)
        .map_err(|err| Error::InvalidBatch(format!("malformed attachment batch: {err}")))?;
    if let Some(blank) = wire.iter().find(|a| a.id.is_empty()) {
        return Err(Error::InvalidBatch(format!(
            "attachment with etag {} has no @id",
            blank.etag
        )));
    }
    Ok(wire.into_iter().map(Attachment::from).collect())
}
