//! Request handlers for replication, local writes and conflicts.
//!
//! Every call into the engine is synchronous and may block on storage
//! locks, so it runs on the blocking thread pool.

mod conflicts;
mod heartbeat;
mod items;
mod replication;
mod websocket;

pub use conflicts::*;
pub use heartbeat::*;
pub use items::*;
pub use replication::*;
pub use websocket::*;

use std::sync::Arc;

use tangle_engine::{Database, Etag, MemoryStorage};

use crate::error::{AppError, Result};

/// The hosted database, shared by every handler.
pub type SharedDatabase = Arc<Database<MemoryStorage>>;

/// Default number of items returned by range reads.
pub const DEFAULT_TAKE: usize = 100;

/// Maximum number of items returned by range reads.
pub const MAX_TAKE: usize = 1024;

/// Run an engine call on the blocking pool.
pub async fn run_engine<T, F>(database: &SharedDatabase, f: F) -> Result<T>
where
    F: FnOnce(&Database<MemoryStorage>) -> tangle_engine::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let database = Arc::clone(database);
    tokio::task::spawn_blocking(move || f(&database))
        .await
        .map_err(|e| AppError::Internal(format!("engine task failed: {e}")))?
        .map_err(AppError::from)
}

/// Parse an optional etag query parameter.
pub fn parse_etag(name: &str, raw: Option<&str>) -> Result<Option<Etag>> {
    raw.filter(|raw| !raw.trim().is_empty())
        .map(|raw| {
            raw.parse::<Etag>()
                .map_err(|_| AppError::BadRequest(format!("{name} must be an etag, got '{raw}'")))
        })
        .transpose()
}

/// Clamp a requested page size.
pub fn clamp_take(take: Option<usize>) -> usize {
    take.map(|t| t.clamp(1, MAX_TAKE)).unwrap_or(DEFAULT_TAKE)
}
