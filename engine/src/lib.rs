//! # Tangle Engine
//!
//! A multi-master replication conflict engine.
//!
//! Several independent copies of a database ("masters") accept writes
//! concurrently and push changed items to each other in batches. This crate
//! decides, for every incoming item, whether it can be applied, must be
//! ignored, or has to be quarantined as a conflict, and it makes local
//! deletes replicate by turning them into tombstones.
//!
//! ## Design Principles
//!
//! - **No IO**: storage is a trait; the engine never touches the network
//! - **Synchronous**: every decision runs inside one storage transaction
//! - **Never lose a write**: anything that cannot be applied is kept as a
//!   conflict holder until it is resolved
//!
//! ## Core Concepts
//!
//! ### Replication history
//!
//! Every item names the database that authored its current version
//! (`source`), that database's version counter, and a capped list of the
//! versions it descends from. [`history::is_direct_child_of`] is the only
//! causality test.
//!
//! ### Conflict engine
//!
//! [`behavior::ReplicationBehavior`] classifies an incoming item into an
//! [`behavior::ItemState`] and executes it: add, ignore a replay or a stale
//! version, apply a descendant, merge concurrent deletes, or create a
//! conflict. Registered [`resolver::ConflictResolver`]s get a chance to
//! merge a conflict before it is stored.
//!
//! ### Tombstones and local writes
//!
//! Local puts are re-attributed to this database under a fresh version from
//! [`hilo::ReplicationHiLo`]; local deletes leave a tombstone carrying the
//! deleted version's lineage ([`tombstone::TombstoneWriter`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use tangle_engine::{
//!     Database, Document, Etag, InboundBatch, MemoryStorage, Metadata, ReplicationConfig,
//!     ReplicationOutcome,
//! };
//! use serde_json::json;
//!
//! let db = Database::new(MemoryStorage::new("db-a"), ReplicationConfig::new("db-a"));
//! db.put("users/1", None, Metadata::default(), json!({"name": "Alice"})).unwrap();
//!
//! // An unrelated version of the same document arrives from db-b.
//! let incoming = Document::new(
//!     "users/1",
//!     Etag::new(7),
//!     Metadata::authored_by("db-b", 1),
//!     json!({"name": "Alicia"}),
//! );
//! let report = db.replicate_documents(InboundBatch::new("db-b", vec![incoming])).unwrap();
//! assert!(matches!(report.applied[0].outcome, ReplicationOutcome::Conflicted { .. }));
//!
//! assert_eq!(db.conflicts("users/1").unwrap().len(), 2);
//! ```

pub mod behavior;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod etag;
pub mod hilo;
pub mod history;
pub mod item;
pub mod metadata;
pub mod notification;
pub mod resolver;
pub mod responder;
pub mod storage;
pub mod strategy;
pub mod tombstone;
pub mod triggers;
pub mod wire;

// Re-export main types at crate root
pub use behavior::{ItemState, ReplicationBehavior, ReplicationOutcome};
pub use config::{ReplicationConfig, StraightforwardConflictResolution, TransitiveReplication};
pub use database::{Database, OutgoingBatch};
pub use entity::{Attachments, Documents, ReplicatedEntity, ReplicatedItemType};
pub use error::Error;
pub use etag::Etag;
pub use history::{History, ReplicationVersion};
pub use item::{Attachment, Document, Item, ListItem};
pub use metadata::Metadata;
pub use notification::{
    ConflictSubscriber, NotificationHub, ReplicationConflictNotification, ReplicationOperation,
    SubscriptionId,
};
pub use resolver::{
    Conflict, ConflictResolver, FnResolver, Resolution, ResolverError, StraightforwardResolver,
};
pub use responder::{BatchReport, InboundBatch, ItemFailure, ItemReport, SourceReplicationInformation};
pub use storage::{
    Change, CommitReceipt, MemoryStorage, Storage, StorageSnapshot, Transaction, TxContext,
};
pub use strategy::{ReplicationStrategy, SkipReason};

/// Type aliases for clarity
pub type Key = String;
pub type DatabaseId = String;
pub type Version = u64;
pub type Timestamp = u64;
