//! Replication endpoint routes.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tangle_engine::{BatchReport, SourceReplicationInformation};

use crate::error::Result;
use crate::handlers::{
    handle_get_last_etag, handle_get_tombstones, handle_heartbeat, handle_outgoing,
    handle_purge_tombstones, handle_put_last_etag, handle_replicate_attachments,
    handle_replicate_documents, handle_replication_info, Heartbeat, HeartbeatQuery, LastEtagQuery,
    OutgoingQuery, OutgoingResponse, PurgeResponse, ReplicateQuery, ReplicationInfo,
    TombstonesQuery, TombstonesResponse,
};
use crate::AppState;

/// Create replication routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/replication/replicateDocs", post(replicate_docs_handler))
        .route(
            "/replication/replicateAttachments",
            post(replicate_attachments_handler),
        )
        .route("/replication/heartbeat", post(heartbeat_handler))
        .route(
            "/replication/lastEtag",
            get(get_last_etag_handler).put(put_last_etag_handler),
        )
        .route("/replication/info", get(info_handler))
        .route(
            "/replication/tombstones",
            get(tombstones_handler).delete(purge_tombstones_handler),
        )
        .route("/replication/outgoing", get(outgoing_handler))
}

/// POST /replication/replicateDocs - Apply a document batch from another database.
async fn replicate_docs_handler(
    State(state): State<AppState>,
    Query(query): Query<ReplicateQuery>,
    Json(body): Json<Value>,
) -> Result<Json<BatchReport>> {
    let report = handle_replicate_documents(&state.database, &state.heartbeats, query, body).await?;
    Ok(Json(report))
}

/// POST /replication/replicateAttachments - Apply an attachment batch.
async fn replicate_attachments_handler(
    State(state): State<AppState>,
    Query(query): Query<ReplicateQuery>,
    Json(body): Json<Value>,
) -> Result<Json<BatchReport>> {
    let report =
        handle_replicate_attachments(&state.database, &state.heartbeats, query, body).await?;
    Ok(Json(report))
}

/// POST /replication/heartbeat - Record that a source is alive.
async fn heartbeat_handler(
    State(state): State<AppState>,
    Query(query): Query<HeartbeatQuery>,
) -> Result<Json<Heartbeat>> {
    Ok(Json(handle_heartbeat(&state.heartbeats, query)?))
}

/// GET /replication/lastEtag - Read a source's bookmark.
async fn get_last_etag_handler(
    State(state): State<AppState>,
    Query(query): Query<LastEtagQuery>,
) -> Result<Json<SourceReplicationInformation>> {
    Ok(Json(handle_get_last_etag(&state.database, query).await?))
}

/// PUT /replication/lastEtag - Move a source's bookmark.
async fn put_last_etag_handler(
    State(state): State<AppState>,
    Query(query): Query<LastEtagQuery>,
) -> Result<Json<SourceReplicationInformation>> {
    Ok(Json(handle_put_last_etag(&state.database, query).await?))
}

/// GET /replication/info - Known sources.
async fn info_handler(State(state): State<AppState>) -> Result<Json<ReplicationInfo>> {
    Ok(Json(
        handle_replication_info(&state.database, &state.heartbeats).await?,
    ))
}

/// GET /replication/tombstones - Tombstones since an etag.
async fn tombstones_handler(
    State(state): State<AppState>,
    Query(query): Query<TombstonesQuery>,
) -> Result<Json<TombstonesResponse>> {
    Ok(Json(handle_get_tombstones(&state.database, query).await?))
}

/// DELETE /replication/tombstones - Purge acknowledged tombstones.
async fn purge_tombstones_handler(
    State(state): State<AppState>,
    Query(query): Query<TombstonesQuery>,
) -> Result<Json<PurgeResponse>> {
    Ok(Json(handle_purge_tombstones(&state.database, query).await?))
}

/// GET /replication/outgoing - Items a destination should receive.
async fn outgoing_handler(
    State(state): State<AppState>,
    Query(query): Query<OutgoingQuery>,
) -> Result<Json<OutgoingResponse>> {
    Ok(Json(handle_outgoing(&state.database, query).await?))
}
