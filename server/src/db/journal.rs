//! Postgres write-behind journal.
//!
//! The engine works on [`MemoryStorage`]. Every commit receipt is queued
//! on an unbounded channel and applied here in commit order, and at start
//! the journaled rows are loaded back as a [`StorageSnapshot`].

use serde_json::Value;
use sqlx::{PgPool, Row};
use tangle_engine::{
    Attachment, Change, CommitReceipt, Document, Etag, ListItem, MemoryStorage, StorageSnapshot,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};

const DOCUMENT: &str = "document";
const ATTACHMENT: &str = "attachment";

/// The persisted identity of the hosted database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub database_id: String,
    /// Highest etag ever journaled
    pub last_etag: Etag,
}

/// Load the journaled database id, creating it on first start.
///
/// A journaled id always wins over `preferred`: the stored items were
/// authored under it.
pub async fn load_identity(pool: &PgPool, preferred: Option<&str>) -> Result<Identity> {
    let existing: Option<(String, i64)> =
        sqlx::query_as("SELECT database_id, last_etag FROM database_identity WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    if let Some((database_id, last_etag)) = existing {
        if let Some(preferred) = preferred.filter(|p| *p != database_id) {
            tracing::warn!(
                configured = %preferred,
                journaled = %database_id,
                "TANGLE_DATABASE_ID differs from the journaled id; keeping the journaled id"
            );
        }
        return Ok(Identity {
            database_id,
            last_etag: Etag::new(last_etag.max(0) as u64),
        });
    }

    let database_id = preferred
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    sqlx::query("INSERT INTO database_identity (id, database_id, last_etag) VALUES (1, $1, 0)")
        .bind(&database_id)
        .execute(pool)
        .await?;

    tracing::info!(database_id = %database_id, "Created database identity");
    Ok(Identity {
        database_id,
        last_etag: Etag::EMPTY,
    })
}

/// A stored item row from the database.
#[derive(Debug)]
pub struct StoredItem {
    pub kind: String,
    pub key: String,
    pub etag: i64,
    pub metadata: Value,
    pub payload: Option<Value>,
    pub data: Option<Vec<u8>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredItem {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredItem {
            kind: row.try_get("kind")?,
            key: row.try_get("key")?,
            etag: row.try_get("etag")?,
            metadata: row.try_get("metadata")?,
            payload: row.try_get("payload")?,
            data: row.try_get("data")?,
        })
    }
}

impl StoredItem {
    /// Convert database row to a document.
    pub fn to_document(&self) -> std::result::Result<Document, String> {
        Ok(Document::new(
            self.key.clone(),
            stored_etag(self.etag),
            decode(&self.key, &self.metadata)?,
            self.payload.clone().unwrap_or(Value::Null),
        ))
    }

    /// Convert database row to an attachment.
    pub fn to_attachment(&self) -> std::result::Result<Attachment, String> {
        Ok(Attachment::new(
            self.key.clone(),
            stored_etag(self.etag),
            decode(&self.key, &self.metadata)?,
            self.data.clone().unwrap_or_default(),
        ))
    }
}

/// A stored list entry row from the database.
#[derive(Debug)]
pub struct StoredListItem {
    pub list: String,
    pub key: String,
    pub etag: i64,
    pub data: Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredListItem {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredListItem {
            list: row.try_get("list")?,
            key: row.try_get("key")?,
            etag: row.try_get("etag")?,
            data: row.try_get("data")?,
        })
    }
}

impl StoredListItem {
    pub fn to_list_item(&self) -> std::result::Result<ListItem, String> {
        Ok(ListItem {
            key: self.key.clone(),
            etag: stored_etag(self.etag),
            data: decode(&self.key, &self.data)?,
        })
    }
}

fn stored_etag(raw: i64) -> Etag {
    Etag::new(raw.max(0) as u64)
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> std::result::Result<T, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("corrupt journal row '{key}': {e}"))
}

/// Rebuild the committed state from the journal.
pub async fn load_snapshot(pool: &PgPool, identity: &Identity) -> Result<StorageSnapshot> {
    let items = sqlx::query_as::<_, StoredItem>(
        "SELECT kind, key, etag, metadata, payload, data FROM items ORDER BY etag",
    )
    .fetch_all(pool)
    .await?;
    let list_items = sqlx::query_as::<_, StoredListItem>(
        "SELECT list, key, etag, data FROM list_items ORDER BY etag",
    )
    .fetch_all(pool)
    .await?;

    let mut snapshot = StorageSnapshot::new(identity.database_id.clone());
    for row in &items {
        match row.kind.as_str() {
            DOCUMENT => snapshot.add_document(row.to_document().map_err(AppError::Internal)?),
            ATTACHMENT => snapshot.add_attachment(row.to_attachment().map_err(AppError::Internal)?),
            other => {
                return Err(AppError::Internal(format!(
                    "unknown item kind '{other}' for '{}'",
                    row.key
                )))
            }
        }
    }
    for row in &list_items {
        snapshot.add_list_item(row.list.clone(), row.to_list_item().map_err(AppError::Internal)?);
    }
    snapshot.last_etag = snapshot.last_etag.max(identity.last_etag);

    tracing::info!(
        database_id = %snapshot.database_id,
        items = snapshot.item_count(),
        last_etag = %snapshot.last_etag,
        "Loaded journal"
    );
    Ok(snapshot)
}

/// One statement's worth of a committed change.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalWrite {
    UpsertItem {
        kind: &'static str,
        key: String,
        etag: i64,
        metadata: Value,
        payload: Option<Value>,
        data: Option<Vec<u8>>,
    },
    DeleteItem {
        kind: &'static str,
        key: String,
    },
    UpsertListItem {
        list: String,
        key: String,
        etag: i64,
        data: Value,
    },
    DeleteListItem {
        list: String,
        key: String,
    },
}

impl JournalWrite {
    pub fn from_change(change: &Change) -> serde_json::Result<Self> {
        Ok(match change {
            Change::DocumentPut(doc) => JournalWrite::UpsertItem {
                kind: DOCUMENT,
                key: doc.key.clone(),
                etag: doc.etag.value() as i64,
                metadata: serde_json::to_value(&doc.metadata)?,
                payload: Some(doc.payload.clone()),
                data: None,
            },
            Change::AttachmentPut(attachment) => JournalWrite::UpsertItem {
                kind: ATTACHMENT,
                key: attachment.key.clone(),
                etag: attachment.etag.value() as i64,
                metadata: serde_json::to_value(&attachment.metadata)?,
                payload: None,
                data: Some(attachment.payload.clone()),
            },
            Change::DocumentDeleted(key) => JournalWrite::DeleteItem {
                kind: DOCUMENT,
                key: key.clone(),
            },
            Change::AttachmentDeleted(key) => JournalWrite::DeleteItem {
                kind: ATTACHMENT,
                key: key.clone(),
            },
            Change::ListItemSet { list, item } => JournalWrite::UpsertListItem {
                list: list.clone(),
                key: item.key.clone(),
                etag: item.etag.value() as i64,
                data: serde_json::to_value(&item.data)?,
            },
            Change::ListItemRemoved { list, key } => JournalWrite::DeleteListItem {
                list: list.clone(),
                key: key.clone(),
            },
        })
    }
}

/// Apply one commit in a single Postgres transaction.
pub async fn apply_receipt(pool: &PgPool, receipt: &CommitReceipt) -> Result<()> {
    let writes = receipt
        .changes
        .iter()
        .map(JournalWrite::from_change)
        .collect::<serde_json::Result<Vec<_>>>()
        .map_err(|e| AppError::Internal(format!("cannot journal commit: {e}")))?;

    let mut tx = pool.begin().await?;
    for write in writes {
        match write {
            JournalWrite::UpsertItem {
                kind,
                key,
                etag,
                metadata,
                payload,
                data,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO items (kind, key, etag, metadata, payload, data, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, NOW())
                    ON CONFLICT (kind, key) DO UPDATE SET
                        etag = EXCLUDED.etag,
                        metadata = EXCLUDED.metadata,
                        payload = EXCLUDED.payload,
                        data = EXCLUDED.data,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(kind)
                .bind(key)
                .bind(etag)
                .bind(metadata)
                .bind(payload)
                .bind(data)
                .execute(&mut *tx)
                .await?;
            }
            JournalWrite::DeleteItem { kind, key } => {
                sqlx::query("DELETE FROM items WHERE kind = $1 AND key = $2")
                    .bind(kind)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
            JournalWrite::UpsertListItem {
                list,
                key,
                etag,
                data,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO list_items (list, key, etag, data)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (list, key) DO UPDATE SET
                        etag = EXCLUDED.etag,
                        data = EXCLUDED.data
                    "#,
                )
                .bind(list)
                .bind(key)
                .bind(etag)
                .bind(data)
                .execute(&mut *tx)
                .await?;
            }
            JournalWrite::DeleteListItem { list, key } => {
                sqlx::query("DELETE FROM list_items WHERE list = $1 AND key = $2")
                    .bind(list)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }

    sqlx::query("UPDATE database_identity SET last_etag = GREATEST(last_etag, $1) WHERE id = 1")
        .bind(receipt.last_etag.value() as i64)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Forward every commit of `storage` to the journal.
pub fn spawn_journal(pool: PgPool, storage: &MemoryStorage) -> JoinHandle<()> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<CommitReceipt>();

    storage.set_journal(Box::new(move |receipt: &CommitReceipt| {
        if sender.send(receipt.clone()).is_err() {
            tracing::error!(last_etag = %receipt.last_etag, "Journal task stopped; commit not persisted");
        }
    }));

    tokio::spawn(async move {
        while let Some(receipt) = receiver.recv().await {
            if let Err(e) = apply_receipt(&pool, &receipt).await {
                tracing::error!(
                    error = %e,
                    last_etag = %receipt.last_etag,
                    changes = receipt.changes.len(),
                    "Failed to journal commit"
                );
            }
        }
    })
}
