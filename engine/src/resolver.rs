//! Conflict resolver plugins.
//!
//! A resolver is a pure decision function. It sees the incoming version,
//! the stored one and read access to other items, and either returns the
//! merged result or declines. It never writes: the conflict engine applies
//! the result so the concurrency token and transaction scope stay in one
//! place.

use crate::{
    config::StraightforwardConflictResolution, history::DEFAULT_HISTORY_LENGTH, Item, Metadata,
};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Error returned by a resolver. Treated as "did not resolve".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ResolverError(pub String);

impl ResolverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The merged version a resolver wants stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<P> {
    pub metadata: Metadata,
    pub payload: P,
}

/// One replication conflict, as offered to resolvers.
pub struct Conflict<'a, P> {
    pub key: &'a str,
    pub incoming_metadata: &'a Metadata,
    pub incoming_payload: &'a P,
    /// The stored item; a conflict placeholder if the key is already in
    /// conflict.
    pub existing: &'a Item<P>,
    lookup: &'a dyn Fn(&str) -> Option<Item<P>>,
}

impl<'a, P> Conflict<'a, P> {
    pub fn new(
        key: &'a str,
        incoming_metadata: &'a Metadata,
        incoming_payload: &'a P,
        existing: &'a Item<P>,
        lookup: &'a dyn Fn(&str) -> Option<Item<P>>,
    ) -> Self {
        Self {
            key,
            incoming_metadata,
            incoming_payload,
            existing,
            lookup,
        }
    }

    /// Read any other item of the same class, as seen by the applying
    /// transaction.
    pub fn get(&self, key: &str) -> Option<Item<P>> {
        (self.lookup)(key)
    }

    pub fn incoming_is_delete(&self) -> bool {
        self.incoming_metadata.delete_marker
    }
}

/// A pluggable automatic conflict resolver.
pub trait ConflictResolver<P>: Send + Sync {
    /// Name used in logs and outcomes.
    fn name(&self) -> &str;

    fn try_resolve(&self, conflict: &Conflict<'_, P>) -> Result<Option<Resolution<P>>, ResolverError>;
}

/// A resolver built from a closure.
pub struct FnResolver<F> {
    name: String,
    resolve: F,
}

impl<F> FnResolver<F> {
    pub fn new<P>(name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&Conflict<'_, P>) -> Result<Option<Resolution<P>>, ResolverError> + Send + Sync,
    {
        Self {
            name: name.into(),
            resolve,
        }
    }
}

impl<P, F> ConflictResolver<P> for FnResolver<F>
where
    F: Fn(&Conflict<'_, P>) -> Result<Option<Resolution<P>>, ResolverError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn try_resolve(&self, conflict: &Conflict<'_, P>) -> Result<Option<Resolution<P>>, ResolverError> {
        (self.resolve)(conflict)
    }
}

/// Resolvers of one entity class, in registration order.
pub struct ResolverRegistry<P> {
    resolvers: RwLock<Vec<Arc<dyn ConflictResolver<P>>>>,
}

impl<P> Default for ResolverRegistry<P> {
    fn default() -> Self {
        Self {
            resolvers: RwLock::new(Vec::new()),
        }
    }
}

impl<P> ResolverRegistry<P> {
    pub fn register(&self, resolver: Arc<dyn ConflictResolver<P>>) {
        if let Ok(mut resolvers) = self.resolvers.write() {
            resolvers.push(resolver);
        }
    }

    /// The registered resolvers at this moment.
    pub fn snapshot(&self) -> Vec<Arc<dyn ConflictResolver<P>>> {
        self.resolvers
            .read()
            .map(|resolvers| resolvers.to_vec())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.resolvers.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration-driven resolver: always keep one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StraightforwardResolver {
    mode: StraightforwardConflictResolution,
    history_length: usize,
}

impl StraightforwardResolver {
    pub fn new(mode: StraightforwardConflictResolution, history_length: usize) -> Self {
        Self {
            mode,
            history_length,
        }
    }

    fn incoming_wins<P>(&self, conflict: &Conflict<'_, P>) -> Option<bool> {
        let placeholder = conflict.existing.metadata.is_conflict_placeholder();
        match self.mode {
            StraightforwardConflictResolution::None => None,
            StraightforwardConflictResolution::ResolveToRemote => Some(true),
            // a placeholder holds no data worth keeping
            _ if placeholder => None,
            StraightforwardConflictResolution::ResolveToLocal => Some(false),
            StraightforwardConflictResolution::ResolveToLatest => {
                let incoming = conflict.incoming_metadata.last_modified.unwrap_or(0);
                let existing = conflict.existing.metadata.last_modified.unwrap_or(0);
                Some(incoming > existing)
            }
        }
    }
}

impl Default for StraightforwardResolver {
    fn default() -> Self {
        Self::new(StraightforwardConflictResolution::None, DEFAULT_HISTORY_LENGTH)
    }
}

impl<P: Clone> ConflictResolver<P> for StraightforwardResolver {
    fn name(&self) -> &str {
        match self.mode {
            StraightforwardConflictResolution::None => "none",
            StraightforwardConflictResolution::ResolveToLocal => "resolve-to-local",
            StraightforwardConflictResolution::ResolveToRemote => "resolve-to-remote",
            StraightforwardConflictResolution::ResolveToLatest => "resolve-to-latest",
        }
    }

    fn try_resolve(&self, conflict: &Conflict<'_, P>) -> Result<Option<Resolution<P>>, ResolverError> {
        let Some(incoming_wins) = self.incoming_wins(conflict) else {
            return Ok(None);
        };

        let existing = &conflict.existing.metadata;
        let (mut metadata, payload, loser) = if incoming_wins {
            (
                conflict.incoming_metadata.clone(),
                conflict.incoming_payload.clone(),
                existing,
            )
        } else {
            (
                existing.clone(),
                conflict.existing.payload.clone(),
                conflict.incoming_metadata,
            )
        };

        metadata
            .history
            .merge(&loser.lineage(self.history_length), self.history_length);
        Ok(Some(Resolution { metadata, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{history::ReplicationVersion, Etag};
    use serde_json::{json, Value};

    fn existing(last_modified: u64) -> Item<Value> {
        let mut meta = Metadata::authored_by("db-a", 5);
        meta.last_modified = Some(last_modified);
        Item::new("users/1", Etag::new(10), meta, json!({"side": "local"}))
    }

    fn incoming(last_modified: u64) -> Metadata {
        let mut meta = Metadata::authored_by("db-b", 2);
        meta.last_modified = Some(last_modified);
        meta
    }

    fn resolve(
        mode: StraightforwardConflictResolution,
        existing: &Item<Value>,
        incoming: &Metadata,
    ) -> Option<Resolution<Value>> {
        let payload = json!({"side": "remote"});
        let lookup = |_: &str| -> Option<Item<Value>> { None };
        let conflict = Conflict::new("users/1", incoming, &payload, existing, &lookup);
        StraightforwardResolver::new(mode, 10)
            .try_resolve(&conflict)
            .unwrap()
    }

    #[test]
    fn none_declines() {
        assert!(resolve(
            StraightforwardConflictResolution::None,
            &existing(1),
            &incoming(2)
        )
        .is_none());
    }

    #[test]
    fn local_keeps_existing_and_absorbs_incoming() {
        let resolution = resolve(
            StraightforwardConflictResolution::ResolveToLocal,
            &existing(1),
            &incoming(2),
        )
        .unwrap();
        assert_eq!(resolution.payload, json!({"side": "local"}));
        assert_eq!(resolution.metadata.source.as_deref(), Some("db-a"));
        assert!(resolution
            .metadata
            .history
            .contains(&ReplicationVersion::new("db-b", 2)));
    }

    #[test]
    fn remote_takes_incoming_and_absorbs_existing() {
        let resolution = resolve(
            StraightforwardConflictResolution::ResolveToRemote,
            &existing(1),
            &incoming(2),
        )
        .unwrap();
        assert_eq!(resolution.payload, json!({"side": "remote"}));
        assert!(resolution
            .metadata
            .history
            .contains(&ReplicationVersion::new("db-a", 5)));
    }

    #[test]
    fn latest_compares_last_modified() {
        let newer_remote = resolve(
            StraightforwardConflictResolution::ResolveToLatest,
            &existing(1),
            &incoming(2),
        )
        .unwrap();
        assert_eq!(newer_remote.payload, json!({"side": "remote"}));

        let tie = resolve(
            StraightforwardConflictResolution::ResolveToLatest,
            &existing(2),
            &incoming(2),
        )
        .unwrap();
        assert_eq!(tie.payload, json!({"side": "local"}));
    }

    #[test]
    fn local_declines_over_placeholder() {
        let mut placeholder = existing(1);
        placeholder.metadata = Metadata {
            conflict: true,
            ..Metadata::default()
        };
        assert!(resolve(
            StraightforwardConflictResolution::ResolveToLocal,
            &placeholder,
            &incoming(2)
        )
        .is_none());
        assert!(resolve(
            StraightforwardConflictResolution::ResolveToRemote,
            &placeholder,
            &incoming(2)
        )
        .is_some());
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry: ResolverRegistry<Value> = ResolverRegistry::default();
        assert!(registry.is_empty());
        registry.register(Arc::new(FnResolver::new(
            "first",
            |_: &Conflict<'_, Value>| Ok(None),
        )));
        registry.register(Arc::new(FnResolver::new(
            "second",
            |_: &Conflict<'_, Value>| Err(ResolverError::new("nope")),
        )));

        let names: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
