//! In-memory transactional storage.
//!
//! Committed state lives behind an `RwLock`. A transaction reads through to
//! it, stages every write in a private overlay, and remembers the committed
//! etag of each slot the first time it touches it. Commit re-checks those
//! etags under the write lock: if another transaction committed to a slot in
//! between, the commit fails with [`Error::ConcurrencyConflict`].
//!
//! Etags are handed out when a write is staged, so commits can land out of
//! etag order. Each open transaction registers the first etag it took;
//! `since` scans stop below the lowest registered one.

use super::{
    Change, CommitReceipt, PostCommit, Storage, StorageSnapshot, Transaction, TxContext,
};
use crate::{error::Result, Attachment, Document, Error, Etag, Key, ListItem, Metadata};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Receives every non-empty commit, in commit order, while the commit still
/// holds the write lock. Must not block.
pub type Journal = Box<dyn Fn(&CommitReceipt) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Slot {
    Document(Key),
    Attachment(Key),
    List(String, Key),
}

impl Slot {
    fn key(&self) -> &str {
        match self {
            Slot::Document(key) | Slot::Attachment(key) | Slot::List(_, key) => key,
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Document(Document),
    Attachment(Attachment),
    List(ListItem),
}

impl Entry {
    fn etag(&self) -> Etag {
        match self {
            Entry::Document(doc) => doc.etag,
            Entry::Attachment(attachment) => attachment.etag,
            Entry::List(item) => item.etag,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(super) struct State {
    pub(super) documents: BTreeMap<Key, Document>,
    pub(super) attachments: BTreeMap<Key, Attachment>,
    pub(super) lists: BTreeMap<String, BTreeMap<Key, ListItem>>,
}

impl State {
    fn get(&self, slot: &Slot) -> Option<Entry> {
        match slot {
            Slot::Document(key) => self.documents.get(key).cloned().map(Entry::Document),
            Slot::Attachment(key) => self.attachments.get(key).cloned().map(Entry::Attachment),
            Slot::List(list, key) => self
                .lists
                .get(list)
                .and_then(|items| items.get(key))
                .cloned()
                .map(Entry::List),
        }
    }

    fn apply(&mut self, slot: Slot, entry: Option<Entry>) -> Change {
        match (slot, entry) {
            (Slot::Document(key), Some(Entry::Document(doc))) => {
                self.documents.insert(key, doc.clone());
                Change::DocumentPut(doc)
            }
            (Slot::Attachment(key), Some(Entry::Attachment(attachment))) => {
                self.attachments.insert(key, attachment.clone());
                Change::AttachmentPut(attachment)
            }
            (Slot::List(list, key), Some(Entry::List(item))) => {
                self.lists
                    .entry(list.clone())
                    .or_default()
                    .insert(key, item.clone());
                Change::ListItemSet { list, item }
            }
            (Slot::Document(key), _) => {
                self.documents.remove(&key);
                Change::DocumentDeleted(key)
            }
            (Slot::Attachment(key), _) => {
                self.attachments.remove(&key);
                Change::AttachmentDeleted(key)
            }
            (Slot::List(list, key), _) => {
                if let Some(items) = self.lists.get_mut(&list) {
                    items.remove(&key);
                    if items.is_empty() {
                        self.lists.remove(&list);
                    }
                }
                Change::ListItemRemoved { list, key }
            }
        }
    }
}

struct Shared {
    database_id: String,
    state: RwLock<State>,
    last_etag: AtomicU64,
    /// First etag of every open transaction that has written.
    open: Mutex<BTreeSet<Etag>>,
    journal: RwLock<Option<Journal>>,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("storage lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("storage lock poisoned".into()))
    }

    fn open(&self) -> Result<MutexGuard<'_, BTreeSet<Etag>>> {
        self.open
            .lock()
            .map_err(|_| Error::Storage("etag registry lock poisoned".into()))
    }

    /// Hand out the next etag, registering it as `first` if the transaction
    /// has not written yet.
    fn next_etag(&self, first: &mut Option<Etag>) -> Result<Etag> {
        let mut open = self.open()?;
        let etag = Etag::new(self.last_etag.fetch_add(1, Ordering::SeqCst) + 1);
        if first.is_none() {
            *first = Some(etag);
            open.insert(etag);
        }
        Ok(etag)
    }

    fn release(&self, first: Option<Etag>) {
        let Some(first) = first else {
            return;
        };
        match self.open.lock() {
            Ok(mut open) => {
                open.remove(&first);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&first);
            }
        }
    }

    /// Highest etag a scan may return without overtaking a write that is
    /// still in flight elsewhere.
    fn scan_horizon(&self, own: Option<Etag>) -> Result<Etag> {
        let open = self.open()?;
        Ok(match open.iter().find(|etag| Some(**etag) != own) {
            Some(lowest) => Etag::new(lowest.value() - 1),
            None => Etag::new(self.last_etag.load(Ordering::SeqCst)),
        })
    }
}

/// The in-memory [`Storage`] implementation.
///
/// Cloning is cheap; clones share the same committed state.
#[derive(Clone)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("database_id", &self.shared.database_id)
            .field("last_etag", &self.last_etag())
            .finish()
    }
}

impl MemoryStorage {
    /// Create an empty storage for `database_id`.
    pub fn new(database_id: impl Into<String>) -> Self {
        Self::with_state(database_id.into(), State::default(), Etag::EMPTY)
    }

    fn with_state(database_id: String, state: State, last_etag: Etag) -> Self {
        Self {
            shared: Arc::new(Shared {
                database_id,
                state: RwLock::new(state),
                last_etag: AtomicU64::new(last_etag.value()),
                open: Mutex::new(BTreeSet::new()),
                journal: RwLock::new(None),
            }),
        }
    }

    /// Restore a storage from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Result<Self> {
        snapshot.validate()?;
        let StorageSnapshot {
            database_id,
            last_etag,
            documents,
            attachments,
            lists,
            ..
        } = snapshot;

        let state = State {
            documents,
            attachments,
            lists,
        };
        Ok(Self::with_state(database_id, state, last_etag))
    }

    /// Export the committed state.
    pub fn export_state(&self) -> Result<StorageSnapshot> {
        let state = self.shared.read()?;
        Ok(StorageSnapshot::from_parts(
            self.shared.database_id.clone(),
            self.last_etag(),
            &state,
        ))
    }

    /// Highest etag handed out so far.
    pub fn last_etag(&self) -> Etag {
        Etag::new(self.shared.last_etag.load(Ordering::SeqCst))
    }

    /// Install a hook that receives every commit.
    pub fn set_journal(&self, journal: Journal) {
        if let Ok(mut slot) = self.shared.journal.write() {
            *slot = Some(journal);
        }
    }

    /// Number of committed documents, including system documents.
    pub fn document_count(&self) -> usize {
        self.shared.read().map(|state| state.documents.len()).unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    type Tx = MemoryTransaction;

    fn database_id(&self) -> &str {
        &self.shared.database_id
    }

    fn begin(&self, context: TxContext) -> MemoryTransaction {
        MemoryTransaction {
            shared: Arc::clone(&self.shared),
            context,
            writes: BTreeMap::new(),
            observed: RefCell::new(HashMap::new()),
            callbacks: Vec::new(),
            first_etag: None,
        }
    }

    fn commit(&self, mut tx: MemoryTransaction) -> Result<CommitReceipt> {
        let writes = std::mem::take(&mut tx.writes);
        let observed = std::mem::take(tx.observed.get_mut());
        let callbacks = std::mem::take(&mut tx.callbacks);
        let shared = Arc::clone(&tx.shared);
        let mut state = shared.write()?;

        for slot in writes.keys() {
            let expected = observed.get(slot).copied().unwrap_or(Etag::EMPTY);
            let actual = state.get(slot).map(|e| e.etag()).unwrap_or(Etag::EMPTY);
            if expected != actual {
                return Err(Error::ConcurrencyConflict {
                    key: slot.key().to_string(),
                    expected,
                    actual,
                });
            }
        }

        let mut receipt = CommitReceipt::default();
        for (slot, entry) in writes {
            let change = state.apply(slot, entry);
            if let Some(etag) = change.etag() {
                receipt.last_etag = receipt.last_etag.max(etag);
            }
            receipt.changes.push(change);
        }

        // Journaled under the write lock so receipts arrive in commit order.
        if !receipt.is_empty() {
            if let Ok(journal) = shared.journal.read() {
                if let Some(journal) = journal.as_ref() {
                    journal(&receipt);
                }
            }
        }
        // Still under the write lock: a scan that misses the reservation sees the writes.
        shared.release(tx.first_etag.take());
        drop(state);

        for callback in callbacks {
            callback();
        }
        Ok(receipt)
    }
}

/// A transaction over [`MemoryStorage`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    context: TxContext,
    writes: BTreeMap<Slot, Option<Entry>>,
    observed: RefCell<HashMap<Slot, Etag>>,
    callbacks: Vec<PostCommit>,
    first_etag: Option<Etag>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.shared.release(self.first_etag.take());
    }
}

/// Savepoint of a [`MemoryTransaction`].
#[derive(Debug, Clone)]
pub struct MemorySavepoint {
    writes: BTreeMap<Slot, Option<Entry>>,
    callbacks: usize,
}

impl MemoryTransaction {
    fn visible(&self, slot: &Slot) -> Result<Option<Entry>> {
        if let Some(staged) = self.writes.get(slot) {
            return Ok(staged.clone());
        }
        let committed = self.shared.read()?.get(slot);
        self.observed
            .borrow_mut()
            .entry(slot.clone())
            .or_insert_with(|| committed.as_ref().map(Entry::etag).unwrap_or(Etag::EMPTY));
        Ok(committed)
    }

    fn check_expected(slot: &Slot, current: Option<&Entry>, expected: Option<Etag>) -> Result<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let actual = current.map(Entry::etag).unwrap_or(Etag::EMPTY);
        if actual != expected {
            return Err(Error::ConcurrencyConflict {
                key: slot.key().to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn next_etag(&mut self) -> Result<Etag> {
        self.shared.next_etag(&mut self.first_etag)
    }

    fn stamp(mut metadata: Metadata) -> Metadata {
        metadata.last_modified = Some(chrono::Utc::now().timestamp_millis().max(0) as u64);
        metadata
    }

    fn remove(&mut self, slot: Slot, expected: Option<Etag>) -> Result<Option<Entry>> {
        let current = self.visible(&slot)?;
        Self::check_expected(&slot, current.as_ref(), expected)?;
        if current.is_some() {
            self.writes.insert(slot, None);
        }
        Ok(current)
    }

    /// Committed entries merged with this transaction's overlay.
    fn merged<T: Clone>(
        &self,
        committed: impl Iterator<Item = (Key, T)>,
        overlay: impl Fn(&Slot, &Option<Entry>) -> Option<(Key, Option<T>)>,
    ) -> BTreeMap<Key, T> {
        let mut merged: BTreeMap<Key, T> = committed.collect();
        for (slot, entry) in &self.writes {
            match overlay(slot, entry) {
                Some((key, Some(value))) => {
                    merged.insert(key, value);
                }
                Some((key, None)) => {
                    merged.remove(&key);
                }
                None => {}
            }
        }
        merged
    }
}

impl Transaction for MemoryTransaction {
    type Savepoint = MemorySavepoint;

    fn context(&self) -> TxContext {
        self.context
    }

    fn database_id(&self) -> &str {
        &self.shared.database_id
    }

    fn document(&self, key: &str) -> Result<Option<Document>> {
        Ok(match self.visible(&Slot::Document(key.to_string()))? {
            Some(Entry::Document(doc)) => Some(doc),
            _ => None,
        })
    }

    fn put_document(
        &mut self,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: serde_json::Value,
    ) -> Result<Etag> {
        let slot = Slot::Document(key.to_string());
        let current = self.visible(&slot)?;
        Self::check_expected(&slot, current.as_ref(), expected)?;

        let etag = self.next_etag()?;
        let doc = Document::new(key, etag, Self::stamp(metadata), payload);
        self.writes.insert(slot, Some(Entry::Document(doc)));
        Ok(etag)
    }

    fn delete_document(&mut self, key: &str, expected: Option<Etag>) -> Result<Option<Document>> {
        Ok(match self.remove(Slot::Document(key.to_string()), expected)? {
            Some(Entry::Document(doc)) => Some(doc),
            _ => None,
        })
    }

    fn documents_since(&self, since: Etag, take: usize) -> Result<Vec<Document>> {
        let horizon = self.shared.scan_horizon(self.first_etag)?;
        let committed: Vec<(Key, Document)> = self
            .shared
            .read()?
            .documents
            .values()
            .filter(|doc| doc.etag > since && doc.etag <= horizon)
            .map(|doc| (doc.key.clone(), doc.clone()))
            .collect();

        let merged = self.merged(committed.into_iter(), |slot, entry| match (slot, entry) {
            (Slot::Document(key), Some(Entry::Document(doc))) => {
                Some((key.clone(), Some(doc.clone())))
            }
            (Slot::Document(key), _) => Some((key.clone(), None)),
            _ => None,
        });

        let mut docs: Vec<Document> = merged.into_values().filter(|d| d.etag > since).collect();
        docs.sort_by_key(|doc| doc.etag);
        docs.truncate(take);
        Ok(docs)
    }

    fn documents_with_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        let committed: Vec<(Key, Document)> = self
            .shared
            .read()?
            .documents
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();

        let merged = self.merged(committed.into_iter(), |slot, entry| match (slot, entry) {
            (Slot::Document(key), _) if !key.starts_with(prefix) => None,
            (Slot::Document(key), Some(Entry::Document(doc))) => {
                Some((key.clone(), Some(doc.clone())))
            }
            (Slot::Document(key), _) => Some((key.clone(), None)),
            _ => None,
        });
        Ok(merged.into_values().collect())
    }

    fn attachment(&self, key: &str) -> Result<Option<Attachment>> {
        Ok(match self.visible(&Slot::Attachment(key.to_string()))? {
            Some(Entry::Attachment(attachment)) => Some(attachment),
            _ => None,
        })
    }

    fn put_attachment(
        &mut self,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Etag> {
        let slot = Slot::Attachment(key.to_string());
        let current = self.visible(&slot)?;
        Self::check_expected(&slot, current.as_ref(), expected)?;

        let etag = self.next_etag()?;
        let attachment = Attachment::new(key, etag, Self::stamp(metadata), payload);
        self.writes.insert(slot, Some(Entry::Attachment(attachment)));
        Ok(etag)
    }

    fn delete_attachment(
        &mut self,
        key: &str,
        expected: Option<Etag>,
    ) -> Result<Option<Attachment>> {
        Ok(match self.remove(Slot::Attachment(key.to_string()), expected)? {
            Some(Entry::Attachment(attachment)) => Some(attachment),
            _ => None,
        })
    }

    fn list_item(&self, list: &str, key: &str) -> Result<Option<ListItem>> {
        Ok(
            match self.visible(&Slot::List(list.to_string(), key.to_string()))? {
                Some(Entry::List(item)) => Some(item),
                _ => None,
            },
        )
    }

    fn set_list_item(&mut self, list: &str, key: &str, data: Metadata) -> Result<Etag> {
        let slot = Slot::List(list.to_string(), key.to_string());
        self.visible(&slot)?;

        let etag = self.next_etag()?;
        let item = ListItem {
            key: key.to_string(),
            etag,
            data: Self::stamp(data),
        };
        self.writes.insert(slot, Some(Entry::List(item)));
        Ok(etag)
    }

    fn remove_list_item(&mut self, list: &str, key: &str) -> Result<Option<ListItem>> {
        Ok(
            match self.remove(Slot::List(list.to_string(), key.to_string()), None)? {
                Some(Entry::List(item)) => Some(item),
                _ => None,
            },
        )
    }

    fn list_items_since(&self, list: &str, since: Etag, take: usize) -> Result<Vec<ListItem>> {
        let horizon = self.shared.scan_horizon(self.first_etag)?;
        let committed: Vec<(Key, ListItem)> = self
            .shared
            .read()?
            .lists
            .get(list)
            .map(|items| {
                items
                    .values()
                    .filter(|item| item.etag > since && item.etag <= horizon)
                    .map(|item| (item.key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let merged = self.merged(committed.into_iter(), |slot, entry| match (slot, entry) {
            (Slot::List(name, key), Some(Entry::List(item))) if name == list => {
                Some((key.clone(), Some(item.clone())))
            }
            (Slot::List(name, key), _) if name == list => Some((key.clone(), None)),
            _ => None,
        });

        let mut items: Vec<ListItem> = merged.into_values().filter(|i| i.etag > since).collect();
        items.sort_by_key(|item| item.etag);
        items.truncate(take);
        Ok(items)
    }

    fn remove_list_items_up_to(&mut self, list: &str, up_to: Etag) -> Result<usize> {
        let doomed: Vec<Key> = self
            .list_items_since(list, Etag::EMPTY, usize::MAX)?
            .into_iter()
            .filter(|item| item.etag <= up_to)
            .map(|item| item.key)
            .collect();

        for key in &doomed {
            self.remove_list_item(list, key)?;
        }
        Ok(doomed.len())
    }

    fn savepoint(&self) -> MemorySavepoint {
        MemorySavepoint {
            writes: self.writes.clone(),
            callbacks: self.callbacks.len(),
        }
    }

    fn rollback_to(&mut self, savepoint: MemorySavepoint) {
        self.writes = savepoint.writes;
        self.callbacks.truncate(savepoint.callbacks);
    }

    fn after_commit(&mut self, callback: PostCommit) {
        self.callbacks.push(callback);
    }
}
