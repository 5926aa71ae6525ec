//! Conflict routes.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{
    handle_get_conflicts, handle_resolve_conflict, ConflictsResponse, ResolveRequest,
    ResolveResponse,
};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/conflicts/resolve", post(resolve_handler))
        .route("/conflicts/{*key}", get(conflicts_handler))
}

/// GET /conflicts/{key} - The holders of a conflicted document.
async fn conflicts_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ConflictsResponse>> {
    Ok(Json(handle_get_conflicts(&state.database, key).await?))
}

/// POST /conflicts/resolve - Pick the winning holder.
async fn resolve_handler(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>> {
    Ok(Json(handle_resolve_conflict(&state.database, request).await?))
}
