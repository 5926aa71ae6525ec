//! The replicating database facade.
//!
//! [`Database`] owns one storage engine and everything replication keeps
//! beside it: the version generator, resolver registries, the outbound
//! filter and the conflict notification hub. Local writes go through the
//! trigger path; inbound batches go through the responder.

use crate::{
    config::{ReplicationConfig, StraightforwardConflictResolution},
    entity::{Attachments, Documents, ReplicatedEntity, ReplicatedItemType},
    error::{Error, Result},
    hilo::ReplicationHiLo,
    notification::{ConflictSubscriber, NotificationHub, SubscriptionId},
    resolver::{ConflictResolver, ResolverRegistry, StraightforwardResolver},
    responder::{self, BatchReport, InboundBatch, InboundResponder, SourceReplicationInformation},
    strategy::ReplicationStrategy,
    tombstone::TombstoneWriter,
    triggers::{self, LocalAuthor},
    Attachment, Document, Etag, ListItem, Metadata, Storage, Transaction, TxContext,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Items a destination should receive, as of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingBatch {
    pub documents: Vec<Document>,
    pub tombstones: Vec<ListItem>,
    /// Highest etag scanned, filtered or not. The next scan starts here.
    pub last_etag: Etag,
}

/// A database taking part in multi-master replication.
pub struct Database<S: Storage> {
    config: ReplicationConfig,
    storage: S,
    hilo: ReplicationHiLo,
    strategy: ReplicationStrategy,
    document_resolvers: ResolverRegistry<Value>,
    attachment_resolvers: ResolverRegistry<Vec<u8>>,
    notifications: Arc<NotificationHub>,
}

impl<S: Storage> Database<S> {
    /// Wrap `storage`. The storage's database id is authoritative.
    pub fn new(storage: S, mut config: ReplicationConfig) -> Self {
        let database_id = storage.database_id().to_string();
        if !config.database_id.is_empty() && config.database_id != database_id {
            tracing::warn!(
                configured = %config.database_id,
                storage = %database_id,
                "configured database id differs from storage; using storage id"
            );
        }
        config.database_id = database_id;

        tracing::info!(
            database_id = %config.database_id,
            history_length = config.history_length,
            transitive = ?config.transitive,
            conflict_resolution = ?config.conflict_resolution,
            "replication database ready"
        );

        Self {
            hilo: ReplicationHiLo::new(config.hilo_capacity),
            strategy: ReplicationStrategy::new(config.database_id.clone(), config.transitive),
            document_resolvers: ResolverRegistry::default(),
            attachment_resolvers: ResolverRegistry::default(),
            notifications: Arc::new(NotificationHub::new()),
            storage,
            config,
        }
    }

    pub fn database_id(&self) -> &str {
        &self.config.database_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn strategy(&self) -> &ReplicationStrategy {
        &self.strategy
    }

    fn author(&self) -> LocalAuthor<'_, S> {
        LocalAuthor::new(&self.storage, &self.hilo, self.config.history_length)
    }

    fn read<R>(&self, f: impl FnOnce(&S::Tx) -> Result<R>) -> Result<R> {
        let tx = self.storage.begin(TxContext::local());
        f(&tx)
    }

    fn write<R>(&self, context: TxContext, f: impl FnOnce(&mut S::Tx) -> Result<R>) -> Result<R> {
        let mut tx = self.storage.begin(context);
        let result = f(&mut tx)?;
        self.storage.commit(tx)?;
        Ok(result)
    }

    // Documents

    pub fn get(&self, key: &str) -> Result<Option<Document>> {
        self.read(|tx| tx.document(key))
    }

    /// Store a document as a new locally authored version.
    pub fn put(&self, key: &str, expected: Option<Etag>, metadata: Metadata, payload: Value) -> Result<Etag> {
        let author = self.author();
        self.write(TxContext::local(), |tx| {
            triggers::put::<Documents, _, _>(&author, tx, key, expected, metadata, payload)
        })
    }

    /// Delete a document, leaving a tombstone. Returns the tombstone etag.
    pub fn delete(&self, key: &str, expected: Option<Etag>) -> Result<Option<Etag>> {
        let author = self.author();
        self.write(TxContext::local(), |tx| {
            triggers::delete::<Documents, _, _>(&author, tx, key, expected)
        })
    }

    // Attachments

    pub fn get_attachment(&self, key: &str) -> Result<Option<Attachment>> {
        self.read(|tx| tx.attachment(key))
    }

    pub fn put_attachment(
        &self,
        key: &str,
        expected: Option<Etag>,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<Etag> {
        let author = self.author();
        self.write(TxContext::local(), |tx| {
            triggers::put::<Attachments, _, _>(&author, tx, key, expected, metadata, payload)
        })
    }

    pub fn delete_attachment(&self, key: &str, expected: Option<Etag>) -> Result<Option<Etag>> {
        let author = self.author();
        self.write(TxContext::local(), |tx| {
            triggers::delete::<Attachments, _, _>(&author, tx, key, expected)
        })
    }

    // Inbound replication

    pub fn replicate_documents(&self, batch: InboundBatch<Value>) -> Result<BatchReport> {
        let resolvers = self.resolvers(&self.document_resolvers);
        self.responder().replicate::<Documents>(batch, &resolvers)
    }

    pub fn replicate_attachments(&self, batch: InboundBatch<Vec<u8>>) -> Result<BatchReport> {
        let resolvers = self.resolvers(&self.attachment_resolvers);
        self.responder().replicate::<Attachments>(batch, &resolvers)
    }

    fn responder(&self) -> InboundResponder<'_, S> {
        InboundResponder::new(&self.storage, self.config.history_length, &self.notifications)
    }

    // User plugins first, then the configured built-in resolver.
    fn resolvers<P: Clone + 'static>(
        &self,
        registry: &ResolverRegistry<P>,
    ) -> Vec<Arc<dyn ConflictResolver<P>>> {
        let mut resolvers = registry.snapshot();
        if self.config.conflict_resolution != StraightforwardConflictResolution::None {
            resolvers.push(Arc::new(StraightforwardResolver::new(
                self.config.conflict_resolution,
                self.config.history_length,
            )));
        }
        resolvers
    }

    // Bookmarks

    /// The bookmark for `from`, created on demand.
    pub fn source_information(&self, from: &str) -> Result<SourceReplicationInformation> {
        let source = responder::normalize_source(from)?;
        self.read(|tx| responder::read_source_information(tx, &source))
    }

    /// Move the bookmark for `from`. Etags left as `None` are kept.
    pub fn update_source_information(
        &self,
        from: &str,
        document_etag: Option<Etag>,
        attachment_etag: Option<Etag>,
    ) -> Result<SourceReplicationInformation> {
        let source = responder::normalize_source(from)?;
        let info = self.write(TxContext::replication_apply(), |tx| {
            let mut info = responder::read_source_information(tx, &source)?;
            if let Some(etag) = document_etag {
                info.last_document_etag = etag;
            }
            if let Some(etag) = attachment_etag {
                info.last_attachment_etag = etag;
            }
            responder::write_source_information(tx, &info)?;
            Ok(info)
        })?;

        tracing::debug!(
            source = %info.source,
            document_etag = %info.last_document_etag,
            attachment_etag = %info.last_attachment_etag,
            "bookmark updated"
        );
        Ok(info)
    }

    pub fn sources(&self) -> Result<Vec<SourceReplicationInformation>> {
        self.read(|tx| responder::list_sources(tx))
    }

    // Tombstones and outbound

    pub fn tombstones_since(&self, item_type: ReplicatedItemType, since: Etag, take: usize) -> Result<Vec<ListItem>> {
        let list = tombstone_list(item_type);
        self.read(|tx| tx.list_items_since(list, since, take))
    }

    /// Drop tombstones every destination has acknowledged.
    pub fn purge_tombstones(&self, item_type: ReplicatedItemType, up_to: Etag) -> Result<usize> {
        let list = tombstone_list(item_type);
        let purged = self.write(TxContext::local(), |tx| tx.remove_list_items_up_to(list, up_to))?;
        tracing::debug!(%item_type, %up_to, purged, "purged tombstones");
        Ok(purged)
    }

    /// Documents and document tombstones written after `since` that
    /// `destination` should receive, in etag order.
    pub fn outgoing(&self, destination: &str, since: Etag, take: usize) -> Result<OutgoingBatch> {
        let (documents, tombstones) = self.read(|tx| {
            Ok((
                tx.documents_since(since, take)?,
                tx.list_items_since(Documents::TOMBSTONES, since, take)?,
            ))
        })?;

        let mut scanned: Vec<(Etag, Outgoing)> = documents
            .into_iter()
            .map(|doc| (doc.etag, Outgoing::Document(doc)))
            .chain(
                tombstones
                    .into_iter()
                    .map(|tomb| (tomb.etag, Outgoing::Tombstone(tomb))),
            )
            .collect();
        scanned.sort_by_key(|(etag, _)| *etag);
        scanned.truncate(take);

        let mut batch = OutgoingBatch {
            last_etag: scanned.last().map_or(since, |(etag, _)| *etag),
            ..OutgoingBatch::default()
        };
        for (_, item) in scanned {
            match item {
                Outgoing::Document(doc) => {
                    if self.strategy.should_replicate(destination, &doc.key, &doc.metadata) {
                        batch.documents.push(doc);
                    }
                }
                Outgoing::Tombstone(tomb) => {
                    if self.strategy.should_replicate(destination, &tomb.key, &tomb.data) {
                        batch.tombstones.push(tomb);
                    }
                }
            }
        }
        Ok(batch)
    }

    // Conflicts

    /// The holders of a conflicted document.
    pub fn conflicts(&self, key: &str) -> Result<Vec<Document>> {
        self.read(|tx| {
            let placeholder = conflicted_document(tx, key)?;
            let mut holders = Vec::new();
            for holder_key in Documents::conflict_holders(&placeholder.payload) {
                if let Some(holder) = tx.document(&holder_key)? {
                    holders.push(holder);
                }
            }
            Ok(holders)
        })
    }

    /// Resolve a conflict by picking one holder as the winner.
    ///
    /// The result is a new local version descending from every contender,
    /// so it replicates everywhere and supersedes them all. A winning delete
    /// holder deletes the document.
    pub fn resolve_conflict(&self, key: &str, winner: &str) -> Result<Option<Etag>> {
        let author = self.author();
        let etag = self.write(TxContext::local(), |tx| {
            let placeholder = conflicted_document(tx, key)?;
            if !Documents::conflict_holders(&placeholder.payload)
                .iter()
                .any(|holder| holder == winner)
            {
                return Err(unknown_holder(key, winner));
            }
            let holder = tx.document(winner)?.ok_or_else(|| unknown_holder(key, winner))?;

            if holder.metadata.delete_marker {
                TombstoneWriter::new(&author).delete::<Documents, _>(tx, key, Some(placeholder.etag))
            } else {
                triggers::put::<Documents, _, _>(
                    &author,
                    tx,
                    key,
                    Some(placeholder.etag),
                    holder.metadata,
                    holder.payload,
                )
                .map(Some)
            }
        })?;

        tracing::info!(%key, %winner, "conflict resolved by operator");
        Ok(etag)
    }

    // Extension points

    pub fn register_document_resolver(&self, resolver: Arc<dyn ConflictResolver<Value>>) {
        tracing::debug!(resolver = resolver.name(), "registered document resolver");
        self.document_resolvers.register(resolver);
    }

    pub fn register_attachment_resolver(&self, resolver: Arc<dyn ConflictResolver<Vec<u8>>>) {
        tracing::debug!(resolver = resolver.name(), "registered attachment resolver");
        self.attachment_resolvers.register(resolver);
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ConflictSubscriber>) -> SubscriptionId {
        self.notifications.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifications.unsubscribe(id)
    }
}

enum Outgoing {
    Document(Document),
    Tombstone(ListItem),
}

fn tombstone_list(item_type: ReplicatedItemType) -> &'static str {
    match item_type {
        ReplicatedItemType::Document => Documents::TOMBSTONES,
        ReplicatedItemType::Attachment => Attachments::TOMBSTONES,
    }
}

fn conflicted_document<T: Transaction>(tx: &T, key: &str) -> Result<Document> {
    match tx.document(key)? {
        Some(doc) if doc.is_conflicted() => Ok(doc),
        Some(_) => Err(Error::NotConflicted(key.to_string())),
        None => Err(Error::NotFound(key.to_string())),
    }
}

fn unknown_holder(key: &str, holder: &str) -> Error {
    Error::UnknownConflictHolder {
        key: key.to_string(),
        holder: holder.to_string(),
    }
}
