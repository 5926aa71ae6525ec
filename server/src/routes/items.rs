//! Document and attachment routes.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use tangle_engine::wire::WireAttachment;

use crate::error::Result;
use crate::handlers::{
    handle_delete_attachment, handle_delete_document, handle_get_attachment, handle_get_document,
    handle_put_attachment, handle_put_document, EtagQuery, WriteResponse,
};
use crate::AppState;

/// Create document and attachment routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/docs/{*key}",
            get(get_document).put(put_document).delete(delete_document),
        )
        .route(
            "/attachments/{*key}",
            get(get_attachment)
                .put(put_attachment)
                .delete(delete_attachment),
        )
}

async fn get_document(State(state): State<AppState>, Path(key): Path<String>) -> Result<Json<Value>> {
    Ok(Json(handle_get_document(&state.database, key).await?))
}

async fn put_document(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EtagQuery>,
    Json(payload): Json<Value>,
) -> Result<Json<WriteResponse>> {
    Ok(Json(
        handle_put_document(&state.database, key, query, payload).await?,
    ))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EtagQuery>,
) -> Result<Json<WriteResponse>> {
    Ok(Json(handle_delete_document(&state.database, key, query).await?))
}

async fn get_attachment(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<WireAttachment>> {
    Ok(Json(handle_get_attachment(&state.database, key).await?))
}

async fn put_attachment(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EtagQuery>,
    body: Bytes,
) -> Result<Json<WriteResponse>> {
    Ok(Json(
        handle_put_attachment(&state.database, key, query, body.to_vec()).await?,
    ))
}

async fn delete_attachment(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<EtagQuery>,
) -> Result<Json<WriteResponse>> {
    Ok(Json(
        handle_delete_attachment(&state.database, key, query).await?,
    ))
}
