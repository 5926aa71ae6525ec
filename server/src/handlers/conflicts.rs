//! Conflict inspection and operator resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tangle_engine::{wire, Etag};

use super::{run_engine, SharedDatabase};
use crate::error::Result;

/// The holders of a conflicted document, in wire form.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictsResponse {
    pub key: String,
    pub conflicts: Vec<Value>,
}

pub async fn handle_get_conflicts(database: &SharedDatabase, key: String) -> Result<ConflictsResponse> {
    let lookup = key.clone();
    let holders = run_engine(database, move |db| db.conflicts(&lookup)).await?;
    let conflicts = holders
        .iter()
        .map(wire::document_to_wire)
        .collect::<tangle_engine::error::Result<Vec<_>>>()?;
    Ok(ConflictsResponse { key, conflicts })
}

/// Request body for resolving a conflict.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// The conflicted document
    pub key: String,
    /// Key of the holder whose version wins
    pub winner: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub key: String,
    /// Etag of the resolved document, or of its tombstone
    pub etag: Option<Etag>,
    /// Whether the winning version was a delete
    pub deleted: bool,
}

/// Resolve a conflict by picking one holder.
pub async fn handle_resolve_conflict(
    database: &SharedDatabase,
    request: ResolveRequest,
) -> Result<ResolveResponse> {
    let ResolveRequest { key, winner } = request;
    let target = key.clone();
    let (etag, deleted) = run_engine(database, move |db| {
        let etag = db.resolve_conflict(&target, &winner)?;
        let deleted = db.get(&target)?.is_none();
        Ok((etag, deleted))
    })
    .await?;

    Ok(ResolveResponse { key, etag, deleted })
}
