//! Liveness of replication sources.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// When a source was last heard from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub source: String,
    pub last_seen: DateTime<Utc>,
}

/// Last contact time per source. Memory only; a restart forgets it.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    sources: DashMap<String, DateTime<Utc>>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record contact from `source` now.
    pub fn record(&self, source: &str) -> Heartbeat {
        self.record_at(source, Utc::now())
    }

    /// Record contact at a given time. Older times never move the entry back.
    pub fn record_at(&self, source: &str, at: DateTime<Utc>) -> Heartbeat {
        let mut entry = self.sources.entry(source.to_string()).or_insert(at);
        if *entry < at {
            *entry = at;
        }
        Heartbeat {
            source: source.to_string(),
            last_seen: *entry,
        }
    }

    pub fn last_seen(&self, source: &str) -> Option<DateTime<Utc>> {
        self.sources.get(source).map(|entry| *entry)
    }

    /// Every known source, ordered by name.
    pub fn all(&self) -> Vec<Heartbeat> {
        let mut heartbeats: Vec<_> = self
            .sources
            .iter()
            .map(|entry| Heartbeat {
                source: entry.key().clone(),
                last_seen: *entry.value(),
            })
            .collect();
        heartbeats.sort_by(|a, b| a.source.cmp(&b.source));
        heartbeats
    }
}
