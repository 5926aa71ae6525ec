//! Local document and attachment writes.
//!
//! These run the local write path: new versions are attributed to this
//! database and deletes leave tombstones for replication.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tangle_engine::{wire, Etag, Metadata};

use super::{parse_etag, run_engine, SharedDatabase};
use crate::error::{AppError, Result};

/// Optional concurrency token for writes.
#[derive(Debug, Default, Deserialize)]
pub struct EtagQuery {
    #[serde(default)]
    pub etag: Option<String>,
}

impl EtagQuery {
    fn expected(&self) -> Result<Option<Etag>> {
        parse_etag("etag", self.etag.as_deref())
    }
}

/// Result of a local write.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub key: String,
    /// Etag written; for a delete, the tombstone's etag
    pub etag: Etag,
}

fn not_found(kind: &str, key: &str) -> AppError {
    AppError::NotFound(format!("{kind} '{key}' does not exist"))
}

fn check_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(AppError::BadRequest("key must not be empty".to_string()));
    }
    Ok(())
}

/// Read a document in wire form.
pub async fn handle_get_document(database: &SharedDatabase, key: String) -> Result<Value> {
    let lookup = key.clone();
    let doc = run_engine(database, move |db| db.get(&lookup))
        .await?
        .ok_or_else(|| not_found("document", &key))?;
    Ok(wire::document_to_wire(&doc)?)
}

/// Write a document. The body is the payload.
pub async fn handle_put_document(
    database: &SharedDatabase,
    key: String,
    query: EtagQuery,
    payload: Value,
) -> Result<WriteResponse> {
    check_key(&key)?;
    if !payload.is_object() {
        return Err(AppError::BadRequest("document body must be a JSON object".to_string()));
    }
    let expected = query.expected()?;

    let target = key.clone();
    let etag = run_engine(database, move |db| {
        db.put(&target, expected, Metadata::default(), payload)
    })
    .await?;

    tracing::debug!(%key, %etag, "Document written");
    Ok(WriteResponse { key, etag })
}

/// Delete a document, leaving a tombstone.
pub async fn handle_delete_document(
    database: &SharedDatabase,
    key: String,
    query: EtagQuery,
) -> Result<WriteResponse> {
    let expected = query.expected()?;
    let target = key.clone();
    let etag = run_engine(database, move |db| db.delete(&target, expected))
        .await?
        .ok_or_else(|| not_found("document", &key))?;

    tracing::debug!(%key, %etag, "Document deleted");
    Ok(WriteResponse { key, etag })
}

/// Read an attachment in wire form.
pub async fn handle_get_attachment(
    database: &SharedDatabase,
    key: String,
) -> Result<wire::WireAttachment> {
    let lookup = key.clone();
    let attachment = run_engine(database, move |db| db.get_attachment(&lookup))
        .await?
        .ok_or_else(|| not_found("attachment", &key))?;
    Ok(wire::WireAttachment::from(&attachment))
}

/// Write an attachment. The body is the raw bytes.
pub async fn handle_put_attachment(
    database: &SharedDatabase,
    key: String,
    query: EtagQuery,
    data: Vec<u8>,
) -> Result<WriteResponse> {
    check_key(&key)?;
    let expected = query.expected()?;

    let target = key.clone();
    let etag = run_engine(database, move |db| {
        db.put_attachment(&target, expected, Metadata::default(), data)
    })
    .await?;

    tracing::debug!(%key, %etag, "Attachment written");
    Ok(WriteResponse { key, etag })
}

/// Delete an attachment, leaving a tombstone.
pub async fn handle_delete_attachment(
    database: &SharedDatabase,
    key: String,
    query: EtagQuery,
) -> Result<WriteResponse> {
    let expected = query.expected()?;
    let target = key.clone();
    let etag = run_engine(database, move |db| db.delete_attachment(&target, expected))
        .await?
        .ok_or_else(|| not_found("attachment", &key))?;

    tracing::debug!(%key, %etag, "Attachment deleted");
    Ok(WriteResponse { key, etag })
}
