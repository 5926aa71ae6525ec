//! HTTP route definitions.

mod changes;
mod conflicts;
mod health;
mod items;
mod replication;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(replication::routes())
        .merge(items::routes())
        .merge(conflicts::routes())
        .merge(changes::routes())
}
