//! The storage collaborator: an ordered, transactional key-value store.
//!
//! The replication engine never talks to a concrete database. It consumes
//! this contract: keyed documents and attachments written under optional
//! etag tokens, named append lists (tombstones live there), savepoints, and
//! post-commit callbacks. [`MemoryStorage`] is the implementation shipped
//! with the engine.

mod memory;
mod snapshot;

pub use memory::{Journal, MemorySavepoint, MemoryStorage, MemoryTransaction};
pub use snapshot::{StorageSnapshot, SNAPSHOT_FORMAT_VERSION};

use crate::{error::Result, Attachment, Document, Etag, Key, ListItem, Metadata};

/// Per-transaction context threaded down the call chain.
///
/// `replication_apply` marks a transaction that applies replicated data:
/// local write triggers (ancestry tracking, tombstone conversion) are
/// skipped so replayed writes keep the remote's attribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxContext {
    replication_apply: bool,
}

impl TxContext {
    /// A transaction driven by a local client.
    pub fn local() -> Self {
        Self {
            replication_apply: false,
        }
    }

    /// A transaction applying data received from another master.
    pub fn replication_apply() -> Self {
        Self {
            replication_apply: true,
        }
    }

    pub fn is_replication_apply(&self) -> bool {
        self.replication_apply
    }
}

/// Work deferred until the owning transaction commits.
pub type PostCommit = Box<dyn FnOnce() + Send>;

/// One committed change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    DocumentPut(Document),
    DocumentDeleted(Key),
    AttachmentPut(Attachment),
    AttachmentDeleted(Key),
    ListItemSet { list: String, item: ListItem },
    ListItemRemoved { list: String, key: Key },
}

impl Change {
    /// Etag written by this change, if it wrote one.
    pub fn etag(&self) -> Option<Etag> {
        match self {
            Change::DocumentPut(doc) => Some(doc.etag),
            Change::AttachmentPut(attachment) => Some(attachment.etag),
            Change::ListItemSet { item, .. } => Some(item.etag),
            _ => None,
        }
    }
}

/// What a commit made visible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    /// Changes in key order
    pub changes: Vec<Change>,
    /// Highest etag written by this commit (empty if nothing was written)
    pub last_etag: Etag,
}

impl CommitReceipt {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// An open storage transaction.
///
/// Conditional writes take `expected: Some(etag)`: the write fails with
/// [`crate::Error::ConcurrencyConflict`] unless the item currently carries
/// exactly that etag. `None` writes unconditionally.
pub trait Transaction {
    /// Opaque marker produced by [`Transaction::savepoint`].
    type Savepoint;

    fn context(&self) -> TxContext;

    /// Id of the database this transaction belongs to.
    fn database_id(&self) -> &str;

    fn document(&self, key: &str) -> Result<Option<Document>>;

    fn put_document(
        &mut self,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: serde_json::Value,
    ) -> Result<Etag>;

    /// Remove a document, returning what was removed.
    fn delete_document(&mut self, key: &str, expected: Option<Etag>) -> Result<Option<Document>>;

    /// Documents written after `since`, in etag order.
    ///
    /// Committed writes are only returned below the lowest etag another open
    /// transaction still holds, so a reader that advances past the last
    /// returned etag never skips a write that commits later.
    fn documents_since(&self, since: Etag, take: usize) -> Result<Vec<Document>>;

    /// Documents whose key starts with `prefix`, in key order.
    fn documents_with_prefix(&self, prefix: &str) -> Result<Vec<Document>>;

    fn attachment(&self, key: &str) -> Result<Option<Attachment>>;

    fn put_attachment(
        &mut self,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Etag>;

    fn delete_attachment(&mut self, key: &str, expected: Option<Etag>)
        -> Result<Option<Attachment>>;

    fn list_item(&self, list: &str, key: &str) -> Result<Option<ListItem>>;

    /// Insert or replace a list entry under a fresh etag.
    fn set_list_item(&mut self, list: &str, key: &str, data: Metadata) -> Result<Etag>;

    fn remove_list_item(&mut self, list: &str, key: &str) -> Result<Option<ListItem>>;

    /// Entries written after `since`, in etag order. Same visibility rule
    /// as [`Transaction::documents_since`].
    fn list_items_since(&self, list: &str, since: Etag, take: usize) -> Result<Vec<ListItem>>;

    /// Remove every entry whose etag is at or below `up_to`.
    fn remove_list_items_up_to(&mut self, list: &str, up_to: Etag) -> Result<usize>;

    fn savepoint(&self) -> Self::Savepoint;

    /// Undo every write (and deferred callback) made after `savepoint`.
    fn rollback_to(&mut self, savepoint: Self::Savepoint);

    /// Run `callback` once this transaction commits. Dropped on rollback.
    fn after_commit(&mut self, callback: PostCommit);
}

/// A transactional store that hands out [`Transaction`]s.
pub trait Storage: Send + Sync {
    type Tx: Transaction;

    /// Id of the database; the `source` of every locally authored version.
    fn database_id(&self) -> &str;

    fn begin(&self, context: TxContext) -> Self::Tx;

    /// Make the transaction's writes visible atomically, then run its
    /// post-commit callbacks. Dropping a transaction instead discards it.
    fn commit(&self, tx: Self::Tx) -> Result<CommitReceipt>;
}
