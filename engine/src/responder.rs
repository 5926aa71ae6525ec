//! Inbound batch responder.
//!
//! A batch is an ordered list of items pushed by one source. It is applied
//! in a single replication-apply transaction, one savepoint per item, and
//! commits together with the source's bookmark so a crash can never
//! separate the two.

use crate::{
    behavior::{ReplicationBehavior, ReplicationOutcome},
    entity::{ReplicatedEntity, ReplicatedItemType},
    error::{Error, Result},
    notification::NotificationHub,
    resolver::ConflictResolver,
    DatabaseId, Etag, Item, Key, Metadata, Storage, Transaction, TxContext,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prefix of the per-source bookmark documents.
pub const SOURCES_PREFIX: &str = "Tangle/Replication/Sources/";

/// Bookmark of how far a source's batches have been applied here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReplicationInformation {
    /// The sending database, as it identifies itself
    pub source: DatabaseId,
    pub last_document_etag: Etag,
    pub last_attachment_etag: Etag,
    /// The local database that recorded this bookmark
    pub server_instance_id: DatabaseId,
}

impl SourceReplicationInformation {
    pub fn new(source: impl Into<DatabaseId>, server_instance_id: impl Into<DatabaseId>) -> Self {
        Self {
            source: source.into(),
            last_document_etag: Etag::EMPTY,
            last_attachment_etag: Etag::EMPTY,
            server_instance_id: server_instance_id.into(),
        }
    }
}

pub fn bookmark_key(source: &str) -> Key {
    format!("{SOURCES_PREFIX}{source}")
}

/// Trim trailing slashes; a blank source is not a valid batch origin.
pub fn normalize_source(source: &str) -> Result<DatabaseId> {
    let trimmed = source.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidBatch("source must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

/// One inbound batch.
#[derive(Debug, Clone)]
pub struct InboundBatch<P> {
    /// Sending database
    pub source: String,
    /// Instance id the sender believes it is talking to, if it said
    pub remote_instance: Option<DatabaseId>,
    /// Items in sender order; each item's etag is the sender's etag
    pub items: Vec<Item<P>>,
}

impl<P> InboundBatch<P> {
    pub fn new(source: impl Into<String>, items: Vec<Item<P>>) -> Self {
        Self {
            source: source.into(),
            remote_instance: None,
            items,
        }
    }

    pub fn with_remote_instance(mut self, instance: impl Into<DatabaseId>) -> Self {
        self.remote_instance = Some(instance.into());
        self
    }
}

/// Outcome of one item in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub key: Key,
    #[serde(flatten)]
    pub outcome: ReplicationOutcome,
}

/// An item that could not be applied and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub key: Key,
    pub error: String,
}

/// What a batch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub source: DatabaseId,
    pub item_type: ReplicatedItemType,
    pub applied: Vec<ItemReport>,
    pub failed: Vec<ItemFailure>,
    /// Bookmark recorded for the source, if the batch had items
    pub last_etag: Option<Etag>,
}

impl BatchReport {
    pub fn conflicts(&self) -> usize {
        self.applied
            .iter()
            .filter(|r| matches!(r.outcome, ReplicationOutcome::Conflicted { .. }))
            .count()
    }
}

/// Drives the conflict engine over inbound batches.
pub struct InboundResponder<'a, S: Storage> {
    storage: &'a S,
    history_length: usize,
    notifications: &'a Arc<NotificationHub>,
}

impl<'a, S: Storage> InboundResponder<'a, S> {
    pub fn new(storage: &'a S, history_length: usize, notifications: &'a Arc<NotificationHub>) -> Self {
        Self {
            storage,
            history_length,
            notifications,
        }
    }

    /// Apply `batch` and record the source's bookmark in the same commit.
    ///
    /// A concurrency-token mismatch aborts the whole batch with a
    /// retryable error; the sender resends from its previous bookmark.
    /// Any other per-item failure rolls back that item only.
    pub fn replicate<E: ReplicatedEntity>(
        &self,
        batch: InboundBatch<E::Payload>,
        resolvers: &[Arc<dyn ConflictResolver<E::Payload>>],
    ) -> Result<BatchReport> {
        let source = normalize_source(&batch.source)?;
        let local = self.storage.database_id();
        if batch.remote_instance.as_deref() == Some(local) || source == local {
            return Err(Error::SelfReplication(local.to_string()));
        }

        let mut report = BatchReport {
            source: source.clone(),
            item_type: E::KIND,
            applied: Vec::new(),
            failed: Vec::new(),
            last_etag: None,
        };
        let Some(last_etag) = batch.items.last().map(|item| item.etag) else {
            tracing::debug!(%source, kind = %E::KIND, "empty replication batch");
            return Ok(report);
        };

        tracing::debug!(
            %source,
            kind = %E::KIND,
            items = batch.items.len(),
            "applying replication batch"
        );

        let behavior =
            ReplicationBehavior::<E>::new(local, &source, self.history_length, resolvers, self.notifications);
        let mut tx = self.storage.begin(TxContext::replication_apply());

        for mut item in batch.items {
            if item.metadata.source.as_deref().map_or(true, str::is_empty) {
                item.metadata.source = Some(source.clone());
            }
            let key = item.key.clone();
            let savepoint = tx.savepoint();

            match behavior.replicate(&mut tx, item) {
                Ok(outcome) => report.applied.push(ItemReport { key, outcome }),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(%key, %source, error = %err, "replication batch aborted");
                    return Err(err);
                }
                Err(err) => {
                    tx.rollback_to(savepoint);
                    tracing::error!(%key, %source, error = %err, "failed to replicate item");
                    report.failed.push(ItemFailure {
                        key,
                        error: err.to_string(),
                    });
                }
            }
        }

        record_bookmark::<E, _>(&mut tx, &source, last_etag)?;
        self.storage.commit(tx)?;
        report.last_etag = Some(last_etag);

        tracing::info!(
            %source,
            kind = %E::KIND,
            applied = report.applied.len(),
            failed = report.failed.len(),
            conflicts = report.conflicts(),
            last_etag = %last_etag,
            "replication batch committed"
        );
        Ok(report)
    }
}

fn record_bookmark<E: ReplicatedEntity, T: Transaction>(
    tx: &mut T,
    source: &str,
    last_etag: Etag,
) -> Result<()> {
    let bookmark_failed = |err: Error| Error::Bookmark {
        from: source.to_string(),
        reason: err.to_string(),
    };

    let mut info = read_source_information(tx, source).map_err(&bookmark_failed)?;
    match E::KIND {
        ReplicatedItemType::Document => info.last_document_etag = last_etag,
        ReplicatedItemType::Attachment => info.last_attachment_etag = last_etag,
    }
    write_source_information(tx, &info).map_err(&bookmark_failed)
}

/// The bookmark for `source`, or a fresh one naming this database.
pub fn read_source_information<T: Transaction>(
    tx: &T,
    source: &str,
) -> Result<SourceReplicationInformation> {
    match tx.document(&bookmark_key(source))? {
        Some(doc) => Ok(serde_json::from_value(doc.payload)?),
        None => Ok(SourceReplicationInformation::new(source, tx.database_id())),
    }
}

pub fn write_source_information<T: Transaction>(
    tx: &mut T,
    info: &SourceReplicationInformation,
) -> Result<()> {
    let payload = serde_json::to_value(info)?;
    tx.put_document(&bookmark_key(&info.source), None, Metadata::default(), payload)?;
    Ok(())
}

/// Every recorded bookmark.
pub fn list_sources<T: Transaction>(tx: &T) -> Result<Vec<SourceReplicationInformation>> {
    tx.documents_with_prefix(SOURCES_PREFIX)?
        .into_iter()
        .map(|doc| Ok(serde_json::from_value(doc.payload)?))
        .collect()
}
