//! End-to-end replication behavior through the `Database` facade.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tangle_engine::{
    Conflict, Database, Document, Etag, FnResolver, InboundBatch, MemoryStorage, Metadata,
    ReplicatedItemType, ReplicationConfig, ReplicationConflictNotification, ReplicationOperation,
    ReplicationOutcome, ReplicationVersion, Resolution,
};

fn database(id: &str) -> Database<MemoryStorage> {
    Database::new(MemoryStorage::new(id), ReplicationConfig::new(id))
}

fn v(source: &str, version: u64) -> ReplicationVersion {
    ReplicationVersion::new(source, version)
}

fn doc(key: &str, sender_etag: u64, metadata: Metadata, payload: Value) -> Document {
    Document::new(key, Etag::new(sender_etag), metadata, payload)
}

fn push(db: &Database<MemoryStorage>, source: &str, item: Document) -> ReplicationOutcome {
    let report = db
        .replicate_documents(InboundBatch::new(source, vec![item]))
        .unwrap();
    assert!(report.failed.is_empty(), "unexpected failures: {:?}", report.failed);
    report.applied[0].outcome.clone()
}

fn record_notifications(db: &Database<MemoryStorage>) -> Arc<Mutex<Vec<ReplicationConflictNotification>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.subscribe(Arc::new(move |n: &ReplicationConflictNotification| {
        sink.lock().unwrap().push(n.clone());
    }));
    seen
}

// ============================================================================
// Idempotent replay
// ============================================================================

#[test]
fn replayed_item_changes_nothing() {
    let db = database("db-a");
    let notifications = record_notifications(&db);
    let item = doc("users/1", 5, Metadata::authored_by("db-b", 3), json!({"n": 1}));

    assert_eq!(push(&db, "db-b", item.clone()), ReplicationOutcome::Added);
    let first = db.get("users/1").unwrap().unwrap();

    assert_eq!(push(&db, "db-b", item), ReplicationOutcome::Replayed);
    let second = db.get("users/1").unwrap().unwrap();

    assert_eq!(first, second);
    assert!(notifications.lock().unwrap().is_empty());
}

#[test]
fn replayed_batch_from_bookmark_is_harmless() {
    let db = database("db-a");
    let batch = vec![
        doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({})),
        doc("users/2", 2, Metadata::authored_by("db-b", 2), json!({})),
    ];
    db.replicate_documents(InboundBatch::new("db-b", batch.clone()))
        .unwrap();
    let report = db
        .replicate_documents(InboundBatch::new("db-b", batch))
        .unwrap();

    assert!(report
        .applied
        .iter()
        .all(|r| r.outcome == ReplicationOutcome::Replayed));
    assert_eq!(
        db.source_information("db-b").unwrap().last_document_etag,
        Etag::new(2)
    );
}

/// Etags of a conflicted key and its holders.
fn conflict_etags(db: &Database<MemoryStorage>, key: &str) -> (Etag, Vec<(String, Etag)>) {
    let placeholder = db.get(key).unwrap().unwrap();
    let holders = db
        .conflicts(key)
        .unwrap()
        .into_iter()
        .map(|holder| (holder.key, holder.etag))
        .collect();
    (placeholder.etag, holders)
}

fn assert_conflict_replay_is_silent(db: &Database<MemoryStorage>, source: &str, batch: Vec<Document>) {
    let notifications = record_notifications(db);
    let key = batch[0].key.clone();
    let before = conflict_etags(db, &key);
    let last_etag = db.storage().last_etag();

    let report = db
        .replicate_documents(InboundBatch::new(source, batch))
        .unwrap();

    assert!(report.failed.is_empty());
    assert!(report
        .applied
        .iter()
        .all(|r| r.outcome == ReplicationOutcome::Replayed));
    assert_eq!(conflict_etags(db, &key), before);
    assert!(notifications.lock().unwrap().is_empty());
    // only the bookmark is rewritten
    assert_eq!(db.storage().last_etag(), last_etag.next());
}

#[test]
fn replayed_new_conflict_changes_nothing() {
    let db = database("db-a");
    db.put("users/1", None, Metadata::default(), json!({"side": "local"}))
        .unwrap();
    let batch = vec![doc("users/1", 4, Metadata::authored_by("db-b", 1), json!({"side": "remote"}))];

    let report = db
        .replicate_documents(InboundBatch::new("db-b", batch.clone()))
        .unwrap();
    assert!(matches!(report.applied[0].outcome, ReplicationOutcome::Conflicted { .. }));

    assert_conflict_replay_is_silent(&db, "db-b", batch);
}

#[test]
fn replayed_conflicting_delete_changes_nothing() {
    let db = database("db-a");
    db.put("users/1", None, Metadata::default(), json!({})).unwrap();
    let batch = vec![doc("users/1", 2, Metadata::authored_by("db-b", 7).deleted(), json!({}))];

    let report = db
        .replicate_documents(InboundBatch::new("db-b", batch.clone()))
        .unwrap();
    assert!(matches!(report.applied[0].outcome, ReplicationOutcome::Conflicted { .. }));

    assert_conflict_replay_is_silent(&db, "db-b", batch);
}

#[test]
fn replayed_version_of_existing_conflict_changes_nothing() {
    let db = database("db-a");
    db.put("users/1", None, Metadata::default(), json!({})).unwrap();
    push(&db, "db-b", doc("users/1", 3, Metadata::authored_by("db-b", 1), json!({"b": 1})));
    let third = vec![doc("users/1", 6, Metadata::authored_by("db-c", 1), json!({"c": 1}))];

    let report = db
        .replicate_documents(InboundBatch::new("db-c", third.clone()))
        .unwrap();
    let ReplicationOutcome::Conflicted { conflicts } = &report.applied[0].outcome else {
        panic!("expected a conflict");
    };
    assert_eq!(conflicts.len(), 3);

    assert_conflict_replay_is_silent(&db, "db-c", third);
}

#[test]
fn replayed_merged_delete_changes_nothing() {
    let db = database("db-a");
    let notifications = record_notifications(&db);
    db.put("users/1", None, Metadata::default(), json!({})).unwrap();
    db.delete("users/1", None).unwrap();
    let batch = vec![doc("users/1", 9, Metadata::authored_by("db-b", 2).deleted(), json!({}))];

    assert_eq!(
        db.replicate_documents(InboundBatch::new("db-b", batch.clone()))
            .unwrap()
            .applied[0]
            .outcome,
        ReplicationOutcome::DeletesMerged
    );
    let merged = db
        .tombstones_since(ReplicatedItemType::Document, Etag::EMPTY, 10)
        .unwrap();

    let report = db
        .replicate_documents(InboundBatch::new("db-b", batch))
        .unwrap();
    assert_eq!(report.applied[0].outcome, ReplicationOutcome::Replayed);
    assert_eq!(
        db.tombstones_since(ReplicatedItemType::Document, Etag::EMPTY, 10)
            .unwrap(),
        merged
    );
    assert!(notifications.lock().unwrap().is_empty());
}

// ============================================================================
// Linear history
// ============================================================================

#[test]
fn causal_chain_applies_in_order() {
    let db = database("db-x");
    let a = Metadata::authored_by("db-a", 1);
    let b = Metadata::authored_by("db-b", 1).with_history(vec![v("db-a", 1)]);
    let c = Metadata::authored_by("db-c", 1).with_history(vec![v("db-a", 1), v("db-b", 1)]);

    assert_eq!(push(&db, "db-a", doc("k", 1, a, json!("A"))), ReplicationOutcome::Added);
    assert_eq!(push(&db, "db-b", doc("k", 1, b, json!("B"))), ReplicationOutcome::Applied);
    assert_eq!(push(&db, "db-c", doc("k", 1, c, json!("C"))), ReplicationOutcome::Applied);
    assert_eq!(db.get("k").unwrap().unwrap().payload, json!("C"));
}

fn chain(length: usize) -> Vec<Document> {
    let mut history = Vec::new();
    (0..length)
        .map(|i| {
            let source = format!("db-{i}");
            let metadata = Metadata::authored_by(source.clone(), 1).with_history(history.clone());
            history.push(v(&source, 1));
            doc("users/1", i as u64 + 1, metadata, json!({ "step": i }))
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_causal_chain_converges_in_any_order(
        order in (2usize..7).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let items = chain(order.len());
        let db = database("db-x");

        for index in &order {
            let outcome = push(&db, "db-peer", items[*index].clone());
            prop_assert!(
                !matches!(outcome, ReplicationOutcome::Conflicted { .. }),
                "causal chain produced a conflict"
            );
        }

        let last = items.last().unwrap();
        let stored = db.get("users/1").unwrap().unwrap();
        prop_assert_eq!(&stored.payload, &last.payload);
        prop_assert_eq!(stored.metadata.replication_version(), last.metadata.replication_version());
    }
}

// ============================================================================
// Conflict detection
// ============================================================================

#[test]
fn unrelated_versions_conflict_without_losing_data() {
    let db = database("db-a");
    let notifications = record_notifications(&db);

    push(&db, "db-b", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({"from": "b"})));
    let outcome = push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({"from": "c"})));

    let ReplicationOutcome::Conflicted { conflicts } = outcome else {
        panic!("expected a conflict, got {outcome:?}");
    };
    assert_eq!(conflicts.len(), 2);
    assert!(db.get("users/1").unwrap().unwrap().metadata.conflict);

    let payloads: Vec<Value> = db
        .conflicts("users/1")
        .unwrap()
        .into_iter()
        .map(|holder| holder.payload)
        .collect();
    assert!(payloads.contains(&json!({"from": "b"})));
    assert!(payloads.contains(&json!({"from": "c"})));

    let notifications = notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].id, "users/1");
    assert_eq!(notifications[0].item_type, ReplicatedItemType::Document);
    assert_eq!(notifications[0].operation, ReplicationOperation::Put);
}

#[test]
fn conflicted_items_are_not_sent_onward() {
    let db = database("db-a");
    push(&db, "db-b", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({})));
    push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({})));

    let outgoing = db.outgoing("db-d", Etag::EMPTY, 100).unwrap();
    assert!(outgoing.documents.is_empty());
}

#[test]
fn local_put_resolves_conflict_and_replicates() {
    let db = database("db-a");
    push(&db, "db-b", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({})));
    push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({})));

    db.put("users/1", None, Metadata::default(), json!({"merged": true}))
        .unwrap();

    let resolved = db.get("users/1").unwrap().unwrap();
    assert!(!resolved.metadata.conflict);
    assert!(resolved.metadata.history.contains(&v("db-b", 1)));
    assert!(resolved.metadata.history.contains(&v("db-c", 1)));

    // db-b receives the resolution as a direct descendant of its own version
    let peer = database("db-b");
    push(&peer, "db-b-origin", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({})));
    assert_eq!(
        push(&peer, "db-a", resolved.clone()),
        ReplicationOutcome::Applied
    );
    assert_eq!(peer.get("users/1").unwrap().unwrap().payload, json!({"merged": true}));
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn concurrent_deletes_merge_into_one_tombstone() {
    let db = database("db-a");
    push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({})));
    db.delete("users/1", None).unwrap();

    // db-b deleted the same version independently
    let remote_delete = Metadata::authored_by("db-b", 4)
        .with_history(vec![v("db-c", 1), v("db-b", 2)])
        .deleted();
    assert_eq!(
        push(&db, "db-b", doc("users/1", 9, remote_delete, json!({}))),
        ReplicationOutcome::DeletesMerged
    );

    let tombstones = db
        .tombstones_since(ReplicatedItemType::Document, Etag::EMPTY, 10)
        .unwrap();
    assert_eq!(tombstones.len(), 1);
    let history = &tombstones[0].data.history;
    assert!(history.contains(&v("db-c", 1)));
    assert!(history.contains(&v("db-b", 2)));
    assert!(history.iter().any(|version| version.source == "db-a"));
    assert!(db.get("users/1").unwrap().is_none());
}

#[test]
fn delete_against_concurrent_update_conflicts() {
    let db = database("db-a");
    push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({})));
    db.put("users/1", None, Metadata::default(), json!({"edited": true}))
        .unwrap();

    // db-c deletes its own version, unaware of the local edit
    let delete = Metadata::authored_by("db-c", 2)
        .with_history(vec![v("db-c", 1)])
        .deleted();
    let outcome = push(&db, "db-c", doc("users/1", 2, delete.clone(), json!({})));
    assert!(matches!(outcome, ReplicationOutcome::Conflicted { .. }));

    let holders = db.conflicts("users/1").unwrap();
    let live = holders.iter().find(|h| !h.metadata.delete_marker).unwrap();
    assert!(holders.iter().any(|h| h.metadata.delete_marker));
    assert_eq!(live.payload, json!({"edited": true}));

    // either side can win
    db.resolve_conflict("users/1", &live.key).unwrap();
    assert_eq!(db.get("users/1").unwrap().unwrap().payload, json!({"edited": true}));

    let other = database("db-a2");
    push(&other, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({})));
    other.put("users/1", None, Metadata::default(), json!({})).unwrap();
    push(&other, "db-c", doc("users/1", 2, delete, json!({})));
    let deleted_key = other
        .conflicts("users/1")
        .unwrap()
        .into_iter()
        .find(|h| h.metadata.delete_marker)
        .unwrap()
        .key;
    other.resolve_conflict("users/1", &deleted_key).unwrap();
    assert!(other.get("users/1").unwrap().is_none());
    assert_eq!(
        other
            .tombstones_since(ReplicatedItemType::Document, Etag::EMPTY, 10)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn descendant_delete_removes_item() {
    let db = database("db-a");
    push(&db, "db-b", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({})));
    let delete = Metadata::authored_by("db-b", 2)
        .with_history(vec![v("db-b", 1)])
        .deleted();

    assert_eq!(push(&db, "db-b", doc("users/1", 2, delete, json!({}))), ReplicationOutcome::Deleted);
    assert!(db.get("users/1").unwrap().is_none());
}

// ============================================================================
// Resolvers
// ============================================================================

#[test]
fn accepting_resolver_prevents_conflict() {
    let db = database("db-a");
    db.register_document_resolver(Arc::new(FnResolver::new(
        "union",
        |c: &Conflict<'_, Value>| {
            let mut metadata = c.incoming_metadata.clone();
            metadata.history.merge(&c.existing.metadata.lineage(50), 50);
            let mut payload = c.existing.payload.clone();
            if let (Some(target), Some(extra)) = (payload.as_object_mut(), c.incoming_payload.as_object()) {
                target.extend(extra.clone());
            }
            Ok(Some(Resolution { metadata, payload }))
        },
    )));

    push(&db, "db-b", doc("users/1", 1, Metadata::authored_by("db-b", 1), json!({"b": 1})));
    let before = db.get("users/1").unwrap().unwrap().etag;

    let outcome = push(&db, "db-c", doc("users/1", 1, Metadata::authored_by("db-c", 1), json!({"c": 1})));
    assert_eq!(outcome, ReplicationOutcome::Resolved { resolver: "union".into() });

    let merged = db.get("users/1").unwrap().unwrap();
    assert_eq!(merged.payload, json!({"b": 1, "c": 1}));
    assert!(merged.etag > before);
    assert!(db.get("users/1/conflicts/db-a").unwrap().is_none());
}

// ============================================================================
// Scenario
// ============================================================================

#[test]
fn descendant_then_unrelated_version() {
    let db = database("db-local");
    push(&db, "db-a", doc("users/1", 1, Metadata::authored_by("A", 5), json!({"v": "A"})));

    let from_b = Metadata::authored_by("B", 1).with_history(vec![v("A", 5)]);
    assert_eq!(
        push(&db, "B", doc("users/1", 2, from_b, json!({"v": "B"}))),
        ReplicationOutcome::Applied
    );
    assert!(!db.get("users/1").unwrap().unwrap().metadata.conflict);

    let outcome = push(&db, "C", doc("users/1", 3, Metadata::authored_by("C", 1), json!({"v": "C"})));
    let ReplicationOutcome::Conflicted { conflicts } = outcome else {
        panic!("expected a conflict");
    };
    assert_eq!(conflicts.len(), 2);
    assert!(db.get("users/1").unwrap().unwrap().metadata.conflict);
}
