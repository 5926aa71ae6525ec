//! Conflict change stream over WebSocket.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::handlers::handle_websocket_connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Client name used in logs
    #[serde(default)]
    pub client: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/changes", get(changes_handler))
}

/// GET /changes - Upgrade to a WebSocket receiving conflict notifications.
async fn changes_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let client = query.client.unwrap_or_else(|| "anonymous".to_string());
    let conn_manager = state.conn_manager.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, conn_manager, client))
}
