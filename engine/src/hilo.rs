//! Per-database replication version allocation.
//!
//! Versions are handed out from a locally cached range. When the range runs
//! out, the next one is reserved by bumping a persisted maximum in its own
//! committed transaction. A version is therefore never reused, even when the
//! transaction that asked for it rolls back or the process restarts.

use crate::{error::Result, storage::Storage, Error, Metadata, Transaction, TxContext, Version};
use serde_json::json;
use std::sync::Mutex;

/// Key of the system document holding the reserved maximum.
pub const HILO_DOCUMENT_KEY: &str = "Tangle/Replication/VersionHilo";

const MAX_RESERVE_ATTEMPTS: usize = 16;

#[derive(Debug, Default)]
struct Range {
    current: Version,
    max: Version,
}

/// Generator of strictly increasing replication versions.
#[derive(Debug)]
pub struct ReplicationHiLo {
    capacity: u64,
    range: Mutex<Range>,
}

impl ReplicationHiLo {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            range: Mutex::new(Range::default()),
        }
    }

    /// The next version for this database.
    pub fn next<S: Storage>(&self, storage: &S) -> Result<Version> {
        let mut range = self
            .range
            .lock()
            .map_err(|_| Error::Storage("hilo lock poisoned".into()))?;

        if range.current >= range.max {
            let max = self.reserve(storage)?;
            range.current = max - self.capacity;
            range.max = max;
        }

        range.current += 1;
        Ok(range.current)
    }

    fn reserve<S: Storage>(&self, storage: &S) -> Result<Version> {
        let mut last_error = None;

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let mut tx = storage.begin(TxContext::local());
            let existing = tx.document(HILO_DOCUMENT_KEY)?;
            let (stored, expected) = match &existing {
                Some(doc) => (
                    doc.payload.get("Max").and_then(|v| v.as_u64()).unwrap_or(0),
                    Some(doc.etag),
                ),
                None => (0, None),
            };

            let max = stored + self.capacity;
            tx.put_document(
                HILO_DOCUMENT_KEY,
                expected,
                Metadata::default(),
                json!({ "Max": max }),
            )?;

            match storage.commit(tx) {
                Ok(_) => {
                    tracing::debug!(max, "reserved replication version range");
                    return Ok(max);
                }
                Err(err) if err.is_retryable() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Storage("hilo reservation failed".into())))
    }
}
