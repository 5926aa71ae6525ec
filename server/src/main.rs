//! Tangle Server - hosts one replicating database.
//!
//! Other databases push document and attachment batches over HTTP; the
//! tangle-engine conflict engine applies them. Conflicts are streamed to
//! WebSocket clients, and when `DATABASE_URL` is set every commit is
//! journaled to PostgreSQL.

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod websocket;

use crate::config::Config;
use crate::handlers::{HeartbeatTracker, SharedDatabase};
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tangle_engine::{Database, MemoryStorage, Storage};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub database: SharedDatabase,
    pub conn_manager: Arc<ConnectionManager>,
    pub heartbeats: Arc<HeartbeatTracker>,
}

impl AppState {
    /// Wrap `storage` in a database and route its conflicts to WebSocket clients.
    pub fn new(storage: MemoryStorage, config: &Config) -> Self {
        let replication = config.replication_config(storage.database_id());
        let database = Arc::new(Database::new(storage, replication));
        let conn_manager = ConnectionManager::new_shared();
        database.subscribe(conn_manager.clone());

        Self {
            database,
            conn_manager,
            heartbeats: Arc::new(HeartbeatTracker::new()),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tangle_server=debug,tangle_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tangle Server on {}:{}", config.host, config.port);

    let storage = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;

            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;

            let identity = db::load_identity(&pool, config.database_id.as_deref()).await?;
            let snapshot = db::load_snapshot(&pool, &identity).await?;
            let storage = MemoryStorage::from_snapshot(snapshot)?;
            let _journal = db::spawn_journal(pool, &storage);
            storage
        }
        None => {
            let database_id = config
                .database_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            tracing::warn!(database_id = %database_id, "DATABASE_URL not set; data lives in memory only");
            MemoryStorage::new(database_id)
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let router = app(AppState::new(storage, &config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
