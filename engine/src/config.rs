//! Replication settings for one database.

use crate::{history::DEFAULT_HISTORY_LENGTH, DatabaseId};
use serde::{Deserialize, Serialize};

/// Default number of replication versions reserved per HiLo round trip.
pub const DEFAULT_HILO_CAPACITY: u64 = 32;

/// Whether data that originated elsewhere is relayed onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitiveReplication {
    /// Relay everything the destination does not already own (default)
    #[default]
    Replicate,
    /// Relay only locally authored data
    None,
}

/// Built-in automatic resolution of replication conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StraightforwardConflictResolution {
    /// Leave conflicts for an operator or a plugin (default)
    #[default]
    None,
    /// Keep the version already stored locally
    ResolveToLocal,
    /// Take the incoming version
    ResolveToRemote,
    /// Take whichever version was modified last
    ResolveToLatest,
}

/// Configuration of a replicating database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicationConfig {
    /// This database's id; the `source` of everything it authors
    pub database_id: DatabaseId,
    /// Maximum number of ancestors kept in an item's history
    pub history_length: usize,
    pub transitive: TransitiveReplication,
    pub conflict_resolution: StraightforwardConflictResolution,
    /// Versions reserved per HiLo allocation
    pub hilo_capacity: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::new(),
            history_length: DEFAULT_HISTORY_LENGTH,
            transitive: TransitiveReplication::default(),
            conflict_resolution: StraightforwardConflictResolution::default(),
            hilo_capacity: DEFAULT_HILO_CAPACITY,
        }
    }
}

impl ReplicationConfig {
    /// Default configuration for `database_id`.
    pub fn new(database_id: impl Into<DatabaseId>) -> Self {
        Self {
            database_id: database_id.into(),
            ..Self::default()
        }
    }

    pub fn with_history_length(mut self, history_length: usize) -> Self {
        self.history_length = history_length.max(1);
        self
    }

    pub fn with_transitive(mut self, transitive: TransitiveReplication) -> Self {
        self.transitive = transitive;
        self
    }

    pub fn with_conflict_resolution(
        mut self,
        conflict_resolution: StraightforwardConflictResolution,
    ) -> Self {
        self.conflict_resolution = conflict_resolution;
        self
    }

    pub fn with_hilo_capacity(mut self, hilo_capacity: u64) -> Self {
        self.hilo_capacity = hilo_capacity.max(1);
        self
    }
}
