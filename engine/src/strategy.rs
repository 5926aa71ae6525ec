//! Outbound replication filter.

use crate::{config::TransitiveReplication, DatabaseId, Metadata};
use std::fmt;

/// Prefix of the reserved system namespace.
pub const SYSTEM_PREFIX: &str = "Tangle/";

/// System keys that still replicate, so identity generation stays
/// consistent across masters.
pub const HILO_PREFIX: &str = "Tangle/Hilo/";

/// Why an item is not sent to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SystemItem,
    NotForReplication,
    Conflicted,
    OriginatedAtDestination,
    NotLocallyAuthored,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::SystemItem => "it is a system item",
            SkipReason::NotForReplication => "it is marked not for replication",
            SkipReason::Conflicted => "it is in conflict",
            SkipReason::OriginatedAtDestination => "it originated at the destination",
            SkipReason::NotLocallyAuthored => {
                "it was not authored here and transitive replication is off"
            }
        };
        f.write_str(reason)
    }
}

/// Whether `key` lies in the reserved system namespace.
pub fn is_system_key(key: &str) -> bool {
    starts_with_ignore_case(key, SYSTEM_PREFIX) && !starts_with_ignore_case(key, HILO_PREFIX)
}

fn starts_with_ignore_case(key: &str, prefix: &str) -> bool {
    key.len() >= prefix.len()
        && key.is_char_boundary(prefix.len())
        && key[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Decides, per destination, which items are sent at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStrategy {
    database_id: DatabaseId,
    transitive: TransitiveReplication,
}

impl ReplicationStrategy {
    pub fn new(database_id: impl Into<DatabaseId>, transitive: TransitiveReplication) -> Self {
        Self {
            database_id: database_id.into(),
            transitive,
        }
    }

    /// The first rule that rejects the item, or `None` if it replicates.
    pub fn skip_reason(&self, destination: &str, key: &str, metadata: &Metadata) -> Option<SkipReason> {
        if is_system_key(key) {
            return Some(SkipReason::SystemItem);
        }
        if metadata.not_for_replication {
            return Some(SkipReason::NotForReplication);
        }
        if metadata.conflict {
            return Some(SkipReason::Conflicted);
        }

        let source = metadata.source.as_deref().filter(|s| !s.is_empty());
        if source == Some(destination) {
            return Some(SkipReason::OriginatedAtDestination);
        }
        if self.transitive == TransitiveReplication::None {
            if let Some(source) = source {
                if source != self.database_id {
                    return Some(SkipReason::NotLocallyAuthored);
                }
            }
        }
        None
    }

    pub fn should_replicate(&self, destination: &str, key: &str, metadata: &Metadata) -> bool {
        match self.skip_reason(destination, key, metadata) {
            Some(reason) => {
                tracing::trace!(%key, %destination, %reason, "not replicating");
                false
            }
            None => true,
        }
    }
}
