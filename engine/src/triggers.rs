//! The local write path.
//!
//! Every local put and delete runs through here. Unless the transaction is
//! applying replicated data, a put becomes a new locally authored version
//! that descends from whatever it replaces, and a delete becomes a
//! tombstone. Replicated writes keep the remote's attribution untouched.

use crate::{
    entity::ReplicatedEntity,
    error::Result,
    hilo::ReplicationHiLo,
    history,
    tombstone::{self, TombstoneWriter},
    Etag, History, Metadata, Storage, Transaction, Version,
};

/// What a local write needs to author a new version.
pub struct LocalAuthor<'a, S: Storage> {
    storage: &'a S,
    hilo: &'a ReplicationHiLo,
    history_length: usize,
}

impl<'a, S: Storage> LocalAuthor<'a, S> {
    pub fn new(storage: &'a S, hilo: &'a ReplicationHiLo, history_length: usize) -> Self {
        Self {
            storage,
            hilo,
            history_length,
        }
    }

    pub fn database_id(&self) -> &str {
        self.storage.database_id()
    }

    pub fn history_length(&self) -> usize {
        self.history_length
    }

    pub fn next_version(&self) -> Result<Version> {
        self.hilo.next(self.storage)
    }

    /// Re-attribute `metadata` to this database under a fresh version.
    pub fn advance(&self, metadata: &mut Metadata) -> Result<()> {
        let version = self.next_version()?;
        history::advance(metadata, self.database_id(), version, self.history_length);
        Ok(())
    }
}

/// Put `payload` under `key`.
///
/// Replication fields supplied by the caller are ignored on a local write;
/// only `not_for_replication` and the open map are kept.
pub fn put<E, T, S>(
    author: &LocalAuthor<'_, S>,
    tx: &mut T,
    key: &str,
    expected: Option<Etag>,
    metadata: Metadata,
    payload: E::Payload,
) -> Result<Etag>
where
    E: ReplicatedEntity,
    T: Transaction,
    S: Storage,
{
    if tx.context().is_replication_apply() {
        return E::put(tx, key, expected, metadata, payload);
    }

    let cap = author.history_length();
    let mut local = metadata.without_replication();
    local.not_for_replication = metadata.not_for_replication;

    match E::get(tx, key)? {
        Some(existing) if existing.metadata.is_conflict_placeholder() => {
            // Descend from every contender so the result supersedes them all.
            let mut lineage = History::new();
            for holder_key in E::conflict_holders(&existing.payload) {
                if let Some(holder) = E::delete(tx, &holder_key, None)? {
                    lineage.merge(&holder.metadata.lineage(cap), cap);
                }
            }
            local.history = lineage;
            tracing::debug!(%key, kind = %E::KIND, "conflict resolved by local put");
        }
        Some(existing) => local.history = existing.metadata.lineage(cap),
        None => {
            if let Some(tombstone) = tombstone::tombstone::<E, T>(tx, key)? {
                local.history = tombstone.data.lineage(cap);
            }
        }
    }

    tombstone::remove_tombstone::<E, T>(tx, key)?;
    author.advance(&mut local)?;
    E::put(tx, key, expected, local, payload)
}

/// Delete `key`. Local deletes leave a tombstone; see [`TombstoneWriter`].
pub fn delete<E, T, S>(
    author: &LocalAuthor<'_, S>,
    tx: &mut T,
    key: &str,
    expected: Option<Etag>,
) -> Result<Option<Etag>>
where
    E: ReplicatedEntity,
    T: Transaction,
    S: Storage,
{
    if tx.context().is_replication_apply() {
        E::delete(tx, key, expected)?;
        return Ok(None);
    }
    TombstoneWriter::new(author).delete::<E, T>(tx, key, expected)
}
