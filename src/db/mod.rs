mod conflicts;
mod entities;
mod peers;
mod trust;

pub use conflicts::ConflictStore;
pub use entities::EntityStore;
pub use peers::{PeerState, PeerStateStore};
pub use trust::{Identity, PendingPairing, TrustStore};

pub(crate) use conflicts::{record_in as record_conflict, settle_by_peer};
pub(crate) use entities::{lookup, write_incoming};
pub(crate) use trust::device_type_in;

use chrono::{DateTime, SecondsFormat, Utc};
use clubsync_core::SyncError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Node not initialized. Run 'clubsync init' or 'clubsync pair join' first.")]
    NotInitialized,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Corrupt(e.to_string())
    }
}

/// Initialize the database connection pool and run migrations
pub async fn init_db(path: &Path) -> Result<SqlitePool, DbError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<uuid::Uuid, DbError> {
    uuid::Uuid::parse_str(s).map_err(|e| DbError::Corrupt(format!("bad id '{}': {}", s, e)))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let temp_dir = tempfile::tempdir().unwrap();
    let pool = init_db(&temp_dir.path().join("clubsync.db")).await.unwrap();
    (temp_dir, pool)
}
