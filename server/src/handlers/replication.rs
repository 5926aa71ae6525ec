//! Inbound replication: batches, bookmarks, heartbeats and tombstones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tangle_engine::{
    responder, wire, BatchReport, Etag, InboundBatch, Item, ListItem, ReplicatedItemType,
    SourceReplicationInformation,
};

use super::{clamp_take, parse_etag, run_engine, HeartbeatTracker, SharedDatabase};
use crate::error::{AppError, Result};

/// Query parameters identifying the sender of a batch.
#[derive(Debug, Deserialize)]
pub struct ReplicateQuery {
    /// Sending database
    pub from: String,
    /// Database id the sender believes it is talking to
    #[serde(default)]
    pub dbid: Option<String>,
}

impl ReplicateQuery {
    fn batch<P>(self, items: Vec<Item<P>>) -> InboundBatch<P> {
        let batch = InboundBatch::new(self.from, items);
        match self.dbid.filter(|id| !id.trim().is_empty()) {
            Some(dbid) => batch.with_remote_instance(dbid),
            None => batch,
        }
    }
}

/// Apply a batch of documents pushed by another database.
pub async fn handle_replicate_documents(
    database: &SharedDatabase,
    heartbeats: &HeartbeatTracker,
    query: ReplicateQuery,
    body: Value,
) -> Result<BatchReport> {
    let batch = query.batch(wire::parse_documents(body)?);
    let report = run_engine(database, move |db| db.replicate_documents(batch)).await?;
    log_report(&report);
    heartbeats.record(&report.source);
    Ok(report)
}

/// Apply a batch of attachments pushed by another database.
pub async fn handle_replicate_attachments(
    database: &SharedDatabase,
    heartbeats: &HeartbeatTracker,
    query: ReplicateQuery,
    body: Value,
) -> Result<BatchReport> {
    let batch = query.batch(wire::parse_attachments(body)?);
    let report = run_engine(database, move |db| db.replicate_attachments(batch)).await?;
    log_report(&report);
    heartbeats.record(&report.source);
    Ok(report)
}

fn log_report(report: &BatchReport) {
    tracing::info!(
        source = %report.source,
        kind = %report.item_type,
        applied = report.applied.len(),
        failed = report.failed.len(),
        conflicts = report.conflicts(),
        last_etag = ?report.last_etag,
        "Replication batch applied"
    );
}

/// Query parameters for bookmark reads and writes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastEtagQuery {
    pub from: String,
    #[serde(default)]
    pub dbid: Option<String>,
    #[serde(default)]
    pub doc_etag: Option<String>,
    #[serde(default)]
    pub attachment_etag: Option<String>,
}

impl LastEtagQuery {
    fn check_instance(&self, database: &SharedDatabase) -> Result<()> {
        match self.dbid.as_deref() {
            Some(dbid) if dbid == database.database_id() => Err(AppError::Engine(
                tangle_engine::Error::SelfReplication(dbid.to_string()),
            )),
            _ => Ok(()),
        }
    }
}

/// Read the bookmark of a source.
pub async fn handle_get_last_etag(
    database: &SharedDatabase,
    query: LastEtagQuery,
) -> Result<SourceReplicationInformation> {
    query.check_instance(database)?;
    run_engine(database, move |db| db.source_information(&query.from)).await
}

/// Move the bookmark of a source by hand.
pub async fn handle_put_last_etag(
    database: &SharedDatabase,
    query: LastEtagQuery,
) -> Result<SourceReplicationInformation> {
    query.check_instance(database)?;
    let doc_etag = parse_etag("docEtag", query.doc_etag.as_deref())?;
    let attachment_etag = parse_etag("attachmentEtag", query.attachment_etag.as_deref())?;
    if doc_etag.is_none() && attachment_etag.is_none() {
        return Err(AppError::BadRequest(
            "docEtag or attachmentEtag is required".to_string(),
        ));
    }

    run_engine(database, move |db| {
        db.update_source_information(&query.from, doc_etag, attachment_etag)
    })
    .await
}

/// Query parameters for heartbeats.
#[derive(Debug, Deserialize)]
pub struct HeartbeatQuery {
    pub from: String,
}

/// Record that a source is alive.
pub fn handle_heartbeat(heartbeats: &HeartbeatTracker, query: HeartbeatQuery) -> Result<super::Heartbeat> {
    let source = responder::normalize_source(&query.from)?;
    let heartbeat = heartbeats.record(&source);
    tracing::debug!(source = %source, "Heartbeat received");
    Ok(heartbeat)
}

/// One known source: its bookmark and when it was last heard from.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    #[serde(flatten)]
    pub bookmark: SourceReplicationInformation,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Response for `/replication/info`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationInfo {
    pub database_id: String,
    pub sources: Vec<SourceStatus>,
}

/// Every source that has sent a batch or a heartbeat.
pub async fn handle_replication_info(
    database: &SharedDatabase,
    heartbeats: &HeartbeatTracker,
) -> Result<ReplicationInfo> {
    let bookmarks = run_engine(database, |db| db.sources()).await?;
    let database_id = database.database_id().to_string();

    let mut sources: Vec<SourceStatus> = bookmarks
        .into_iter()
        .map(|bookmark| SourceStatus {
            last_heartbeat: heartbeats.last_seen(&bookmark.source),
            bookmark,
        })
        .collect();

    for heartbeat in heartbeats.all() {
        if !sources.iter().any(|s| s.bookmark.source == heartbeat.source) {
            sources.push(SourceStatus {
                bookmark: SourceReplicationInformation::new(heartbeat.source, database_id.clone()),
                last_heartbeat: Some(heartbeat.last_seen),
            });
        }
    }
    sources.sort_by(|a, b| a.bookmark.source.cmp(&b.bookmark.source));

    Ok(ReplicationInfo {
        database_id,
        sources,
    })
}

/// Query parameters for tombstone reads and purges.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstonesQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub take: Option<usize>,
    #[serde(default)]
    pub up_to: Option<String>,
    /// `document` (default) or `attachment`
    #[serde(default, rename = "type")]
    pub item_type: Option<String>,
}

impl TombstonesQuery {
    fn item_type(&self) -> Result<ReplicatedItemType> {
        match self.item_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("document") | Some("documents") => Ok(ReplicatedItemType::Document),
            Some("attachment") | Some("attachments") => Ok(ReplicatedItemType::Attachment),
            Some(other) => Err(AppError::BadRequest(format!("unknown item type '{other}'"))),
        }
    }
}

/// Response for tombstone range reads.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstonesResponse {
    pub tombstones: Vec<ListItem>,
    /// Cursor for the next read
    pub last_etag: Etag,
    pub has_more: bool,
}

/// Tombstones written after `since`, in etag order.
pub async fn handle_get_tombstones(
    database: &SharedDatabase,
    query: TombstonesQuery,
) -> Result<TombstonesResponse> {
    let item_type = query.item_type()?;
    let since = parse_etag("since", query.since.as_deref())?.unwrap_or(Etag::EMPTY);
    let take = clamp_take(query.take);

    // Fetch one more than requested to check if there are more
    let mut tombstones =
        run_engine(database, move |db| db.tombstones_since(item_type, since, take + 1)).await?;
    let has_more = tombstones.len() > take;
    tombstones.truncate(take);

    Ok(TombstonesResponse {
        last_etag: tombstones.last().map_or(since, |t| t.etag),
        tombstones,
        has_more,
    })
}

/// Response for tombstone purges.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub purged: usize,
}

/// Drop tombstones up to and including `upTo`.
pub async fn handle_purge_tombstones(
    database: &SharedDatabase,
    query: TombstonesQuery,
) -> Result<PurgeResponse> {
    let item_type = query.item_type()?;
    let up_to = parse_etag("upTo", query.up_to.as_deref())?
        .ok_or_else(|| AppError::BadRequest("upTo is required".to_string()))?;

    let purged = run_engine(database, move |db| db.purge_tombstones(item_type, up_to)).await?;
    tracing::info!(%item_type, %up_to, purged, "Tombstones purged");
    Ok(PurgeResponse { purged })
}

/// Query parameters for outbound reads.
#[derive(Debug, Deserialize)]
pub struct OutgoingQuery {
    /// Database the items are meant for
    pub destination: String,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub take: Option<usize>,
}

/// Documents and deletes a destination should receive.
///
/// `items` is ready to be posted to the destination's `replicateDocs`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingResponse {
    pub items: Vec<Value>,
    /// Cursor for the next read, past filtered items too
    pub last_etag: Etag,
}

pub async fn handle_outgoing(
    database: &SharedDatabase,
    query: OutgoingQuery,
) -> Result<OutgoingResponse> {
    let since = parse_etag("since", query.since.as_deref())?.unwrap_or(Etag::EMPTY);
    let take = clamp_take(query.take);
    let destination = responder::normalize_source(&query.destination)?;

    let batch = run_engine(database, move |db| db.outgoing(&destination, since, take)).await?;

    let mut rendered = Vec::with_capacity(batch.documents.len() + batch.tombstones.len());
    for doc in &batch.documents {
        rendered.push((doc.etag, wire::document_to_wire(doc)?));
    }
    for tombstone in &batch.tombstones {
        rendered.push((tombstone.etag, wire::tombstone_to_wire(tombstone)?));
    }
    rendered.sort_by_key(|(etag, _)| *etag);

    Ok(OutgoingResponse {
        items: rendered.into_iter().map(|(_, item)| item).collect(),
        last_etag: batch.last_etag,
    })
}
