//! The conflict engine: decide what to do with one replicated item.
//!
//! Every incoming item is first classified into an [`ItemState`] by a pure
//! function of its metadata and whatever is stored under its key (a live
//! item, a tombstone, or nothing). The state is then executed inside the
//! caller's transaction.
//!
//! # Decision order
//!
//! Upserts:
//! 1. Nothing stored: add it.
//! 2. Same `(source, version)` as stored, or as one of the holders of a
//!    conflicted key: replay, ignore.
//! 3. Stored item not in conflict and the incoming item is its direct
//!    child: apply, using the stored etag as the concurrency token.
//! 4. Stored item is a direct child of the incoming one: stale, ignore.
//! 5. Otherwise: conflict.
//!
//! Deletes follow the same order, except that a delete arriving for a key
//! that is already tombstoned merges into the tombstone instead of
//! conflicting.
//!
//! Conflicts are offered to the registered resolvers in order. If none
//! resolves it, the incoming version is parked in a conflict holder, the
//! stored version is moved into a second holder (unless the key is already
//! in conflict), and the key itself becomes a placeholder listing the
//! holders. Subscribers are notified after the transaction commits.

use crate::{
    entity::{self, ReplicatedEntity},
    error::Result,
    history::is_direct_child_of,
    notification::{NotificationHub, ReplicationConflictNotification, ReplicationOperation},
    resolver::{Conflict, ConflictResolver, Resolution},
    tombstone, Etag, History, Item, Key, Metadata, Transaction,
};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Classification of an incoming item against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Nothing stored under the key.
    NoExisting,
    /// The stored version is the incoming one.
    SameVersionReplay,
    /// The incoming version is an ancestor of the stored one.
    Superseded,
    /// The incoming version descends from the stored one.
    DirectDescendant,
    /// An incoming delete for a key that is tombstoned here too.
    ConcurrentDelete,
    /// An incoming delete with unrelated history against a live item.
    ConflictedIncomingDelete,
    /// The key is already in conflict.
    ConflictedExistingConflict,
    /// An incoming put with unrelated history.
    NewConflict,
}

impl ItemState {
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            ItemState::ConflictedIncomingDelete
                | ItemState::ConflictedExistingConflict
                | ItemState::NewConflict
        )
    }
}

/// What happened to one replicated item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ReplicationOutcome {
    Added,
    Replayed,
    Superseded,
    Applied,
    DeleteIgnored,
    Deleted,
    DeletesMerged,
    Resolved { resolver: String },
    Conflicted { conflicts: Vec<Key> },
}

/// What is stored under a key: a live item or a tombstone.
#[derive(Debug, Clone)]
pub struct Existing<P> {
    pub item: Item<P>,
    pub deleted: bool,
    /// Metadata of each conflict holder, when the item is a placeholder.
    pub holders: Vec<Metadata>,
}

impl<P> Existing<P> {
    fn live_etag(&self) -> Option<Etag> {
        (!self.deleted).then_some(self.item.etag)
    }

    fn is_placeholder(&self) -> bool {
        !self.deleted && self.item.metadata.is_conflict_placeholder()
    }
}

/// Read what is stored under `key`, falling back to its tombstone.
pub fn load_existing<E: ReplicatedEntity, T: Transaction>(
    tx: &T,
    key: &str,
) -> Result<Option<Existing<E::Payload>>> {
    if let Some(item) = E::get(tx, key)? {
        let mut holders = Vec::new();
        if item.metadata.is_conflict_placeholder() {
            for holder_key in E::conflict_holders(&item.payload) {
                if let Some(holder) = E::get(tx, &holder_key)? {
                    holders.push(holder.metadata);
                }
            }
        }
        return Ok(Some(Existing {
            item,
            deleted: false,
            holders,
        }));
    }

    Ok(tombstone::tombstone::<E, T>(tx, key)?.map(|tomb| Existing {
        item: Item::new(tomb.key, tomb.etag, tomb.data, E::empty_payload()),
        deleted: true,
        holders: Vec::new(),
    }))
}

/// Classify `incoming` against what is stored.
pub fn classify<P>(incoming: &Metadata, existing: Option<&Existing<P>>) -> ItemState {
    let Some(existing) = existing else {
        return ItemState::NoExisting;
    };
    let stored = &existing.item.metadata;

    if incoming.same_version_as(stored)
        || existing.holders.iter().any(|holder| incoming.same_version_as(holder))
    {
        return ItemState::SameVersionReplay;
    }
    if incoming.delete_marker && existing.deleted {
        return ItemState::ConcurrentDelete;
    }
    if !existing.is_placeholder() && is_direct_child_of(incoming, stored) {
        return ItemState::DirectDescendant;
    }
    if is_direct_child_of(stored, incoming) {
        return ItemState::Superseded;
    }
    if existing.is_placeholder() {
        return ItemState::ConflictedExistingConflict;
    }
    if incoming.delete_marker {
        ItemState::ConflictedIncomingDelete
    } else {
        ItemState::NewConflict
    }
}

/// Applies replicated items of one entity class from one source.
pub struct ReplicationBehavior<'a, E: ReplicatedEntity> {
    database_id: &'a str,
    source: &'a str,
    history_length: usize,
    resolvers: &'a [Arc<dyn ConflictResolver<E::Payload>>],
    notifications: &'a Arc<NotificationHub>,
}

impl<'a, E: ReplicatedEntity> ReplicationBehavior<'a, E> {
    pub fn new(
        database_id: &'a str,
        source: &'a str,
        history_length: usize,
        resolvers: &'a [Arc<dyn ConflictResolver<E::Payload>>],
        notifications: &'a Arc<NotificationHub>,
    ) -> Self {
        Self {
            database_id,
            source,
            history_length,
            resolvers,
            notifications,
        }
    }

    /// Apply one incoming item. `incoming.etag` is the sender's etag.
    pub fn replicate<T: Transaction>(
        &self,
        tx: &mut T,
        incoming: Item<E::Payload>,
    ) -> Result<ReplicationOutcome> {
        let key = incoming.key.clone();
        let existing = load_existing::<E, T>(tx, &key)?;
        let state = classify(&incoming.metadata, existing.as_ref());
        let delete = incoming.metadata.delete_marker;

        let outcome = match (state, existing) {
            (ItemState::NoExisting, _) if delete => {
                tracing::debug!(%key, source = self.source, "delete of unknown item ignored");
                ReplicationOutcome::DeleteIgnored
            }
            (ItemState::NoExisting, _) | (_, None) => {
                E::put(tx, &key, None, incoming.metadata, incoming.payload)?;
                tracing::debug!(%key, source = self.source, "new item replicated");
                ReplicationOutcome::Added
            }
            (ItemState::SameVersionReplay, Some(_)) => {
                tracing::debug!(%key, source = self.source, "replayed version ignored");
                ReplicationOutcome::Replayed
            }
            (ItemState::Superseded, Some(_)) => {
                tracing::debug!(%key, source = self.source, "stale version ignored");
                ReplicationOutcome::Superseded
            }
            (ItemState::ConcurrentDelete, Some(existing)) => {
                self.merge_deletes::<T>(tx, &key, &existing, incoming.metadata)?;
                tracing::debug!(%key, source = self.source, "concurrent deletes merged");
                ReplicationOutcome::DeletesMerged
            }
            (ItemState::DirectDescendant, Some(existing)) if delete => {
                E::delete(tx, &key, existing.live_etag())?;
                tombstone::write_tombstone::<E, T>(tx, &key, incoming.metadata)?;
                tracing::debug!(%key, source = self.source, "replicated delete applied");
                ReplicationOutcome::Deleted
            }
            (ItemState::DirectDescendant, Some(existing)) => {
                self.put_over::<T>(tx, &key, &existing, incoming.metadata, incoming.payload)?;
                tracing::debug!(%key, source = self.source, "direct descendant applied");
                ReplicationOutcome::Applied
            }
            (
                ItemState::ConflictedIncomingDelete
                | ItemState::ConflictedExistingConflict
                | ItemState::NewConflict,
                Some(existing),
            ) => self.handle_conflict::<T>(tx, incoming, existing, state)?,
        };

        Ok(outcome)
    }

    fn put_over<T: Transaction>(
        &self,
        tx: &mut T,
        key: &str,
        existing: &Existing<E::Payload>,
        metadata: Metadata,
        payload: E::Payload,
    ) -> Result<Etag> {
        let etag = E::put(tx, key, existing.live_etag(), metadata, payload)?;
        if existing.deleted {
            tombstone::remove_tombstone::<E, T>(tx, key)?;
        }
        Ok(etag)
    }

    fn merge_deletes<T: Transaction>(
        &self,
        tx: &mut T,
        key: &str,
        existing: &Existing<E::Payload>,
        mut incoming: Metadata,
    ) -> Result<()> {
        let cap = self.history_length;
        let mut merged: History = existing.item.metadata.lineage(cap);
        merged.merge(&incoming.history, cap);
        incoming.history = merged;
        tombstone::write_tombstone::<E, T>(tx, key, incoming)?;
        Ok(())
    }

    fn handle_conflict<T: Transaction>(
        &self,
        tx: &mut T,
        incoming: Item<E::Payload>,
        existing: Existing<E::Payload>,
        state: ItemState,
    ) -> Result<ReplicationOutcome> {
        let key = incoming.key.clone();

        if let Some((resolver, resolution)) = self.try_resolve(&*tx, &incoming, &existing) {
            self.apply_resolution::<T>(tx, &key, &existing, resolution)?;
            tracing::debug!(%key, source = self.source, %resolver, "conflict resolved by plugin");
            return Ok(ReplicationOutcome::Resolved { resolver });
        }

        let operation = if incoming.metadata.delete_marker {
            ReplicationOperation::Delete
        } else {
            ReplicationOperation::Put
        };
        let incoming_holder = self.save_holder::<T>(tx, &key, incoming)?;

        let (etag, conflicts) = if state == ItemState::ConflictedExistingConflict {
            let mut conflicts = E::conflict_holders(&existing.item.payload);
            if !conflicts.contains(&incoming_holder) {
                conflicts.push(incoming_holder);
            }
            let etag = E::put(
                tx,
                &key,
                existing.live_etag(),
                existing.item.metadata.clone(),
                E::conflict_placeholder(&conflicts),
            )?;
            tracing::debug!(%key, source = self.source, "conflicted item has a new version");
            (etag, conflicts)
        } else {
            let existing_holder = entity::conflict_holder_key(&key, self.database_id);
            let mut holder_meta = existing.item.metadata.clone();
            holder_meta.conflict = true;
            holder_meta.conflict_document = true;
            E::put(tx, &existing_holder, None, holder_meta, existing.item.payload.clone())?;

            let conflicts = vec![existing_holder, incoming_holder];
            let placeholder = Metadata {
                conflict: true,
                ..existing.item.metadata.without_replication()
            };
            let etag = E::put(
                tx,
                &key,
                existing.live_etag(),
                placeholder,
                E::conflict_placeholder(&conflicts),
            )?;
            if existing.deleted {
                tombstone::remove_tombstone::<E, T>(tx, &key)?;
            }
            tracing::debug!(%key, source = self.source, "item marked as conflicted");
            (etag, conflicts)
        };

        let notification = ReplicationConflictNotification {
            item_type: E::KIND,
            id: key,
            etag,
            operation,
            conflicts: conflicts.clone(),
        };
        let hub = Arc::clone(self.notifications);
        tx.after_commit(Box::new(move || hub.publish(&notification)));

        Ok(ReplicationOutcome::Conflicted { conflicts })
    }

    // Parks the incoming version under a holder key derived from its source
    // and sender etag; the key is only ever owned by that pair, so it is
    // overwritten unconditionally.
    fn save_holder<T: Transaction>(
        &self,
        tx: &mut T,
        key: &str,
        incoming: Item<E::Payload>,
    ) -> Result<Key> {
        let source = incoming.metadata.source.clone().unwrap_or_default();
        let holder_key =
            entity::conflict_holder_key(key, &entity::incoming_holder_id(&source, incoming.etag));

        let mut metadata = incoming.metadata;
        metadata.conflict = true;
        metadata.conflict_document = true;
        E::put(tx, &holder_key, None, metadata, incoming.payload)?;
        Ok(holder_key)
    }

    fn try_resolve<T: Transaction>(
        &self,
        tx: &T,
        incoming: &Item<E::Payload>,
        existing: &Existing<E::Payload>,
    ) -> Option<(String, Resolution<E::Payload>)> {
        if self.resolvers.is_empty() {
            return None;
        }

        let lookup = |key: &str| E::get(tx, key).ok().flatten();
        let conflict = Conflict::new(
            &incoming.key,
            &incoming.metadata,
            &incoming.payload,
            &existing.item,
            &lookup,
        );

        for resolver in self.resolvers {
            let attempt = catch_unwind(AssertUnwindSafe(|| resolver.try_resolve(&conflict)));
            match attempt {
                Ok(Ok(Some(resolution))) => return Some((resolver.name().to_string(), resolution)),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        key = %incoming.key,
                        resolver = resolver.name(),
                        error = %err,
                        "conflict resolver failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        key = %incoming.key,
                        resolver = resolver.name(),
                        "conflict resolver panicked"
                    );
                }
            }
        }
        None
    }

    fn apply_resolution<T: Transaction>(
        &self,
        tx: &mut T,
        key: &str,
        existing: &Existing<E::Payload>,
        resolution: Resolution<E::Payload>,
    ) -> Result<()> {
        let mut metadata = resolution.metadata;
        metadata.conflict = false;
        metadata.conflict_document = false;

        if existing.is_placeholder() {
            let cap = self.history_length;
            for holder_key in E::conflict_holders(&existing.item.payload) {
                if let Some(holder) = E::delete(tx, &holder_key, None)? {
                    metadata.history.merge(&holder.metadata.lineage(cap), cap);
                }
            }
        }

        if metadata.delete_marker {
            E::delete(tx, key, existing.live_etag())?;
            tombstone::write_tombstone::<E, T>(tx, key, metadata)?;
        } else {
            self.put_over::<T>(tx, key, existing, metadata, resolution.payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::Documents,
        history::ReplicationVersion,
        resolver::{FnResolver, ResolverError},
        MemoryStorage, Storage, TxContext,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn v(source: &str, version: u64) -> ReplicationVersion {
        ReplicationVersion::new(source, version)
    }

    fn item(key: &str, sender_etag: u64, metadata: Metadata, payload: Value) -> Item<Value> {
        Item::new(key, Etag::new(sender_etag), metadata, payload)
    }

    struct Fixture {
        storage: MemoryStorage,
        hub: Arc<NotificationHub>,
        resolvers: Vec<Arc<dyn ConflictResolver<Value>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                storage: MemoryStorage::new("db-local"),
                hub: Arc::new(NotificationHub::new()),
                resolvers: Vec::new(),
            }
        }

        fn seed(&self, key: &str, metadata: Metadata, payload: Value) {
            let mut tx = self.storage.begin(TxContext::replication_apply());
            tx.put_document(key, None, metadata, payload).unwrap();
            self.storage.commit(tx).unwrap();
        }

        fn replicate(&self, incoming: Item<Value>) -> ReplicationOutcome {
            let source = incoming.metadata.source.clone().unwrap_or_default();
            let behavior = ReplicationBehavior::<Documents>::new(
                "db-local",
                &source,
                10,
                &self.resolvers,
                &self.hub,
            );
            let mut tx = self.storage.begin(TxContext::replication_apply());
            let outcome = behavior.replicate(&mut tx, incoming).unwrap();
            self.storage.commit(tx).unwrap();
            outcome
        }

        fn doc(&self, key: &str) -> Option<Item<Value>> {
            self.storage
                .begin(TxContext::local())
                .document(key)
                .unwrap()
        }

        fn tombstone(&self, key: &str) -> Option<crate::ListItem> {
            tombstone::tombstone::<Documents, _>(&self.storage.begin(TxContext::local()), key)
                .unwrap()
        }
    }

    #[test]
    fn classify_states() {
        let live = |meta: Metadata| Existing {
            item: Item::new("k", Etag::new(1), meta, json!({})),
            deleted: false,
            holders: Vec::new(),
        };
        let tomb = |meta: Metadata| Existing {
            item: Item::new("k", Etag::new(1), meta.deleted(), json!({})),
            deleted: true,
            holders: Vec::new(),
        };
        let a5 = Metadata::authored_by("A", 5);
        let child = Metadata::authored_by("B", 1).with_history(vec![v("A", 5)]);
        let unrelated = Metadata::authored_by("C", 1);

        assert_eq!(classify::<Value>(&a5, None), ItemState::NoExisting);
        assert_eq!(classify(&a5, Some(&live(a5.clone()))), ItemState::SameVersionReplay);
        assert_eq!(classify(&child, Some(&live(a5.clone()))), ItemState::DirectDescendant);
        assert_eq!(classify(&a5, Some(&live(child.clone()))), ItemState::Superseded);
        assert_eq!(classify(&unrelated, Some(&live(a5.clone()))), ItemState::NewConflict);
        assert_eq!(
            classify(&unrelated.clone().deleted(), Some(&live(a5.clone()))),
            ItemState::ConflictedIncomingDelete
        );
        assert_eq!(
            classify(&unrelated.clone().deleted(), Some(&tomb(a5.clone()))),
            ItemState::ConcurrentDelete
        );
        assert_eq!(
            classify(&a5.clone().deleted(), Some(&tomb(a5.clone()))),
            ItemState::SameVersionReplay
        );

        let placeholder = Metadata {
            conflict: true,
            ..Metadata::default()
        };
        assert_eq!(
            classify(&child, Some(&live(placeholder.clone()))),
            ItemState::ConflictedExistingConflict
        );
        let parked = Existing {
            holders: vec![a5.clone(), unrelated.clone()],
            ..live(placeholder)
        };
        assert_eq!(classify(&unrelated, Some(&parked)), ItemState::SameVersionReplay);
        assert_eq!(classify(&child, Some(&parked)), ItemState::ConflictedExistingConflict);
        assert!(ItemState::NewConflict.is_conflict());
        assert!(!ItemState::Superseded.is_conflict());
    }

    #[test]
    fn new_item_is_added() {
        let fx = Fixture::new();
        let outcome = fx.replicate(item("users/1", 3, Metadata::authored_by("A", 1), json!({"n": 1})));
        assert_eq!(outcome, ReplicationOutcome::Added);
        assert_eq!(fx.doc("users/1").unwrap().payload, json!({"n": 1}));
    }

    #[test]
    fn direct_descendant_overwrites() {
        let fx = Fixture::new();
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({"v": 1}));

        let incoming = Metadata::authored_by("B", 1).with_history(vec![v("A", 5)]);
        let outcome = fx.replicate(item("users/1", 8, incoming, json!({"v": 2})));

        assert_eq!(outcome, ReplicationOutcome::Applied);
        let doc = fx.doc("users/1").unwrap();
        assert_eq!(doc.payload, json!({"v": 2}));
        assert_eq!(doc.metadata.source.as_deref(), Some("B"));
    }

    #[test]
    fn unrelated_put_creates_conflict_with_two_holders() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.hub.subscribe(Arc::new(move |n: &ReplicationConflictNotification| {
            sink.lock().unwrap().push(n.clone());
        }));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({"side": "local"}));

        let outcome = fx.replicate(item("users/1", 4, Metadata::authored_by("C", 1), json!({"side": "remote"})));
        let ReplicationOutcome::Conflicted { conflicts } = outcome else {
            panic!("expected a conflict, got {outcome:?}");
        };
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0], "users/1/conflicts/db-local");

        let placeholder = fx.doc("users/1").unwrap();
        assert!(placeholder.metadata.is_conflict_placeholder());
        assert!(placeholder.metadata.source.is_none());
        assert_eq!(Documents::conflict_holders(&placeholder.payload), conflicts);

        let local = fx.doc(&conflicts[0]).unwrap();
        assert_eq!(local.payload, json!({"side": "local"}));
        assert!(local.metadata.conflict_document);
        let remote = fx.doc(&conflicts[1]).unwrap();
        assert_eq!(remote.payload, json!({"side": "remote"}));
        assert!(remote.metadata.conflict && remote.metadata.conflict_document);

        let notifications = seen.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].operation, ReplicationOperation::Put);
        assert_eq!(notifications[0].etag, placeholder.etag);
        assert_eq!(notifications[0].conflicts, conflicts);
    }

    #[test]
    fn further_version_appends_to_conflict() {
        let fx = Fixture::new();
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));
        fx.replicate(item("users/1", 4, Metadata::authored_by("C", 1), json!({})));

        let outcome = fx.replicate(item("users/1", 9, Metadata::authored_by("D", 1), json!({})));
        let ReplicationOutcome::Conflicted { conflicts } = outcome else {
            panic!("expected a conflict");
        };
        assert_eq!(conflicts.len(), 3);
        assert_eq!(
            Documents::conflict_holders(&fx.doc("users/1").unwrap().payload),
            conflicts
        );
    }

    #[test]
    fn redelivered_conflict_is_a_replay() {
        let fx = Fixture::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        fx.hub.subscribe(Arc::new(move |_: &ReplicationConflictNotification| {
            *sink.lock().unwrap() += 1;
        }));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));
        let incoming = item("users/1", 4, Metadata::authored_by("C", 1), json!({"c": 1}));

        let ReplicationOutcome::Conflicted { conflicts } = fx.replicate(incoming.clone()) else {
            panic!("expected a conflict");
        };
        let placeholder = fx.doc("users/1").unwrap();
        let holder = fx.doc(&conflicts[1]).unwrap();

        assert_eq!(fx.replicate(incoming), ReplicationOutcome::Replayed);
        assert_eq!(fx.doc("users/1").unwrap().etag, placeholder.etag);
        assert_eq!(fx.doc(&conflicts[1]).unwrap().etag, holder.etag);
        assert_eq!(*count.lock().unwrap(), 1);

        // the local side of the conflict coming back is a replay too
        let local = item("users/1", 1, Metadata::authored_by("A", 5), json!({}));
        assert_eq!(fx.replicate(local), ReplicationOutcome::Replayed);
    }

    #[test]
    fn redelivered_delete_conflict_is_a_replay() {
        let fx = Fixture::new();
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));
        let delete = item("users/1", 2, Metadata::authored_by("B", 9).deleted(), json!({}));

        assert!(matches!(
            fx.replicate(delete.clone()),
            ReplicationOutcome::Conflicted { .. }
        ));
        let before = fx.doc("users/1").unwrap().etag;
        assert_eq!(fx.replicate(delete), ReplicationOutcome::Replayed);
        assert_eq!(fx.doc("users/1").unwrap().etag, before);
    }

    #[test]
    fn replayed_delete_is_ignored() {
        let fx = Fixture::new();
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));
        let delete = Metadata::authored_by("B", 2)
            .with_history(vec![v("A", 5)])
            .deleted();

        assert_eq!(
            fx.replicate(item("users/1", 6, delete.clone(), json!({}))),
            ReplicationOutcome::Deleted
        );
        let first = fx.tombstone("users/1").unwrap();
        assert_eq!(
            fx.replicate(item("users/1", 6, delete, json!({}))),
            ReplicationOutcome::Replayed
        );
        assert_eq!(fx.tombstone("users/1").unwrap().etag, first.etag);
    }

    #[test]
    fn delete_of_unknown_item_is_ignored() {
        let fx = Fixture::new();
        let outcome = fx.replicate(item("users/1", 1, Metadata::authored_by("B", 1).deleted(), json!({})));
        assert_eq!(outcome, ReplicationOutcome::DeleteIgnored);
        assert!(fx.tombstone("users/1").is_none());
    }

    #[test]
    fn concurrent_deletes_merge_histories() {
        let fx = Fixture::new();
        let mut tx = fx.storage.begin(TxContext::replication_apply());
        tombstone::write_tombstone::<Documents, _>(
            &mut tx,
            "users/1",
            Metadata::authored_by("db-local", 7).with_history(vec![v("A", 5)]),
        )
        .unwrap();
        fx.storage.commit(tx).unwrap();

        let remote = Metadata::authored_by("B", 3)
            .with_history(vec![v("A", 5), v("B", 2)])
            .deleted();
        assert_eq!(
            fx.replicate(item("users/1", 2, remote, json!({}))),
            ReplicationOutcome::DeletesMerged
        );

        let tomb = fx.tombstone("users/1").unwrap();
        assert_eq!(tomb.data.replication_version(), Some(v("B", 3)));
        assert_eq!(
            tomb.data.history,
            History::from(vec![v("A", 5), v("db-local", 7), v("B", 2)])
        );
        assert!(fx.doc("users/1").is_none());
    }

    #[test]
    fn unrelated_delete_conflicts_with_live_item() {
        let fx = Fixture::new();
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({"keep": true}));
        let outcome = fx.replicate(item("users/1", 2, Metadata::authored_by("B", 9).deleted(), json!({})));
        let ReplicationOutcome::Conflicted { conflicts } = outcome else {
            panic!("expected a conflict");
        };

        let live = fx.doc(&conflicts[0]).unwrap();
        assert_eq!(live.payload, json!({"keep": true}));
        let deleted = fx.doc(&conflicts[1]).unwrap();
        assert!(deleted.metadata.delete_marker);
    }

    #[test]
    fn update_against_tombstone_descends() {
        let fx = Fixture::new();
        let mut tx = fx.storage.begin(TxContext::replication_apply());
        tombstone::write_tombstone::<Documents, _>(&mut tx, "users/1", Metadata::authored_by("A", 6))
            .unwrap();
        fx.storage.commit(tx).unwrap();

        let incoming = Metadata::authored_by("B", 1).with_history(vec![v("A", 6)]);
        assert_eq!(
            fx.replicate(item("users/1", 1, incoming, json!({"back": true}))),
            ReplicationOutcome::Applied
        );
        assert!(fx.tombstone("users/1").is_none());
        assert_eq!(fx.doc("users/1").unwrap().payload, json!({"back": true}));
    }

    #[test]
    fn resolver_short_circuits_conflict() {
        let mut fx = Fixture::new();
        fx.resolvers.push(Arc::new(FnResolver::new(
            "merge",
            |c: &Conflict<'_, Value>| {
                let mut metadata = c.incoming_metadata.clone();
                metadata.history.merge(&c.existing.metadata.lineage(10), 10);
                Ok(Some(Resolution {
                    metadata,
                    payload: json!({"merged": true}),
                }))
            },
        )));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));
        let before = fx.doc("users/1").unwrap().etag;

        let outcome = fx.replicate(item("users/1", 2, Metadata::authored_by("C", 1), json!({})));
        assert_eq!(
            outcome,
            ReplicationOutcome::Resolved {
                resolver: "merge".into()
            }
        );
        let doc = fx.doc("users/1").unwrap();
        assert_eq!(doc.payload, json!({"merged": true}));
        assert!(doc.etag > before);
        assert!(fx.doc("users/1/conflicts/db-local").is_none());
    }

    #[test]
    fn failing_resolvers_fall_through_to_conflict() {
        let mut fx = Fixture::new();
        fx.resolvers.push(Arc::new(FnResolver::new(
            "broken",
            |_: &Conflict<'_, Value>| Err(ResolverError::new("boom")),
        )));
        fx.resolvers.push(Arc::new(FnResolver::new(
            "panicky",
            |_: &Conflict<'_, Value>| -> std::result::Result<Option<Resolution<Value>>, ResolverError> {
                panic!("resolver bug")
            },
        )));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));

        let outcome = fx.replicate(item("users/1", 2, Metadata::authored_by("C", 1), json!({})));
        assert!(matches!(outcome, ReplicationOutcome::Conflicted { .. }));
    }

    #[test]
    fn resolution_with_delete_marker_deletes() {
        let mut fx = Fixture::new();
        fx.resolvers.push(Arc::new(FnResolver::new(
            "accept-delete",
            |c: &Conflict<'_, Value>| {
                Ok(c.incoming_is_delete().then(|| Resolution {
                    metadata: c.incoming_metadata.clone(),
                    payload: json!({}),
                }))
            },
        )));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));

        let outcome = fx.replicate(item("users/1", 2, Metadata::authored_by("C", 1).deleted(), json!({})));
        assert!(matches!(outcome, ReplicationOutcome::Resolved { .. }));
        assert!(fx.doc("users/1").is_none());
        assert!(fx.tombstone("users/1").unwrap().data.delete_marker);
    }

    #[test]
    fn notification_is_not_sent_when_rolled_back() {
        let fx = Fixture::new();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        fx.hub.subscribe(Arc::new(move |_: &ReplicationConflictNotification| {
            *sink.lock().unwrap() += 1;
        }));
        fx.seed("users/1", Metadata::authored_by("A", 5), json!({}));

        let behavior = ReplicationBehavior::<Documents>::new("db-local", "C", 10, &fx.resolvers, &fx.hub);
        let mut tx = fx.storage.begin(TxContext::replication_apply());
        behavior
            .replicate(&mut tx, item("users/1", 2, Metadata::authored_by("C", 1), json!({})))
            .unwrap();
        drop(tx);

        assert_eq!(*count.lock().unwrap(), 0);
        assert!(!fx.doc("users/1").unwrap().is_conflicted());
    }
}
