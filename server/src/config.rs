//! Configuration management for the server.

use std::env;
use tangle_engine::{ReplicationConfig, StraightforwardConflictResolution, TransitiveReplication};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; without it the database lives in memory only
    pub database_url: Option<String>,
    /// Fixed database id. Otherwise the journaled id is reused or a new one generated.
    pub database_id: Option<String>,
    pub history_length: usize,
    pub transitive: TransitiveReplication,
    pub conflict_resolution: StraightforwardConflictResolution,
}

impl Default for Config {
    fn default() -> Self {
        let replication = ReplicationConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            database_id: None,
            history_length: replication.history_length,
            transitive: replication.transitive,
            conflict_resolution: replication.conflict_resolution,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let host = var("HOST").unwrap_or(defaults.host);

        let port = match var("PORT") {
            Some(port) => port.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let history_length = match var("TANGLE_HISTORY_LENGTH") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(length) if length > 0 => length,
                _ => return Err(ConfigError::InvalidHistoryLength(raw)),
            },
            None => defaults.history_length,
        };

        let transitive = match var("TANGLE_TRANSITIVE") {
            Some(raw) => parse_transitive(&raw)?,
            None => defaults.transitive,
        };

        let conflict_resolution = match var("TANGLE_CONFLICT_RESOLUTION") {
            Some(raw) => parse_conflict_resolution(&raw)?,
            None => defaults.conflict_resolution,
        };

        Ok(Self {
            host,
            port,
            database_url: var("DATABASE_URL"),
            database_id: var("TANGLE_DATABASE_ID").map(|id| id.trim().to_string()),
            history_length,
            transitive,
            conflict_resolution,
        })
    }

    /// Replication settings for the hosted database.
    pub fn replication_config(&self, database_id: &str) -> ReplicationConfig {
        ReplicationConfig::new(database_id)
            .with_history_length(self.history_length)
            .with_transitive(self.transitive)
            .with_conflict_resolution(self.conflict_resolution)
    }
}

fn parse_transitive(raw: &str) -> Result<TransitiveReplication, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "replicate" => Ok(TransitiveReplication::Replicate),
        "none" => Ok(TransitiveReplication::None),
        _ => Err(ConfigError::InvalidTransitive(raw.to_string())),
    }
}

fn parse_conflict_resolution(raw: &str) -> Result<StraightforwardConflictResolution, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(StraightforwardConflictResolution::None),
        "local" => Ok(StraightforwardConflictResolution::ResolveToLocal),
        "remote" => Ok(StraightforwardConflictResolution::ResolveToRemote),
        "latest" => Ok(StraightforwardConflictResolution::ResolveToLatest),
        _ => Err(ConfigError::InvalidConflictResolution(raw.to_string())),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid TANGLE_HISTORY_LENGTH value '{0}': expected a positive integer")]
    InvalidHistoryLength(String),

    #[error("Invalid TANGLE_TRANSITIVE value '{0}': expected 'replicate' or 'none'")]
    InvalidTransitive(String),

    #[error("Invalid TANGLE_CONFLICT_RESOLUTION value '{0}': expected 'none', 'local', 'remote' or 'latest'")]
    InvalidConflictResolution(String),
}
