//! Tombstones and the local delete path.
//!
//! A delete must replicate, so a local delete never just disappears: the
//! item is physically removed and a tombstone carrying the deleted
//! version's lineage is written to the entity's tombstone list.

use crate::{
    entity::ReplicatedEntity, error::Result, triggers::LocalAuthor, Error, Etag, History,
    ListItem, Metadata, Storage, Transaction,
};

/// The tombstone recorded for `key`, if any.
pub fn tombstone<E: ReplicatedEntity, T: Transaction>(tx: &T, key: &str) -> Result<Option<ListItem>> {
    tx.list_item(E::TOMBSTONES, key)
}

/// Write (or overwrite) the tombstone for `key`. The delete marker is
/// always set.
pub fn write_tombstone<E: ReplicatedEntity, T: Transaction>(
    tx: &mut T,
    key: &str,
    mut metadata: Metadata,
) -> Result<Etag> {
    metadata.delete_marker = true;
    tx.set_list_item(E::TOMBSTONES, key, metadata)
}

pub fn remove_tombstone<E: ReplicatedEntity, T: Transaction>(
    tx: &mut T,
    key: &str,
) -> Result<Option<ListItem>> {
    tx.remove_list_item(E::TOMBSTONES, key)
}

/// Converts local deletes into tombstones.
pub struct TombstoneWriter<'a, S: Storage> {
    author: &'a LocalAuthor<'a, S>,
}

impl<'a, S: Storage> TombstoneWriter<'a, S> {
    pub fn new(author: &'a LocalAuthor<'a, S>) -> Self {
        Self { author }
    }

    /// Delete `key` locally.
    ///
    /// Returns the tombstone's etag, or `None` when nothing was tombstoned:
    /// the item did not exist, or it was a conflict holder, which is simply
    /// removed.
    pub fn delete<E: ReplicatedEntity, T: Transaction>(
        &self,
        tx: &mut T,
        key: &str,
        expected: Option<Etag>,
    ) -> Result<Option<Etag>> {
        let Some(existing) = E::get(tx, key)? else {
            E::delete(tx, key, expected)?;
            return Ok(None);
        };

        if existing.metadata.conflict_document {
            E::delete(tx, key, expected)?;
            tracing::debug!(%key, "removed conflict holder");
            return Ok(None);
        }

        if let Some(expected) = expected {
            if existing.etag != expected {
                return Err(Error::ConcurrencyConflict {
                    key: key.to_string(),
                    expected,
                    actual: existing.etag,
                });
            }
        }

        let history = if existing.metadata.is_conflict_placeholder() {
            self.discard_holders::<E, T>(tx, &existing.payload)?
        } else {
            existing.metadata.lineage(self.author.history_length())
        };

        E::delete(tx, key, None)?;

        let mut metadata = existing.metadata.without_replication();
        metadata.history = history;
        self.author.advance(&mut metadata)?;

        let etag = write_tombstone::<E, T>(tx, key, metadata)?;
        tracing::debug!(%key, kind = %E::KIND, %etag, "wrote tombstone");
        Ok(Some(etag))
    }

    // The locally authored branch's lineage survives the delete; every
    // holder is removed.
    fn discard_holders<E: ReplicatedEntity, T: Transaction>(
        &self,
        tx: &mut T,
        placeholder: &E::Payload,
    ) -> Result<History> {
        let local = self.author.database_id();
        let mut history = History::new();

        for holder_key in E::conflict_holders(placeholder) {
            if let Some(holder) = E::delete(tx, &holder_key, None)? {
                if holder.metadata.source.as_deref() == Some(local) {
                    history = holder.metadata.lineage(self.author.history_length());
                }
            }
        }
        Ok(history)
    }
}
