use chrono::{DateTime, Utc};
use clubsync_core::SchemaVersion;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_opt_ts, ts, DbError};

/// Per-peer bookkeeping kept across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    /// Peer's clock at the last successful pull; the next `since`.
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set while the peer speaks an incompatible schema.
    pub incompatible_schema: Option<SchemaVersion>,
}

pub struct PeerStateStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct PeerRow {
    last_pull_at: Option<String>,
    last_sync_at: Option<String>,
    last_error: Option<String>,
    incompatible_schema: Option<String>,
}

impl PeerStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, peer_id: Uuid) -> Result<PeerState, DbError> {
        let row: Option<PeerRow> = sqlx::query_as(
            "SELECT last_pull_at, last_sync_at, last_error, incompatible_schema FROM peer_sync_state WHERE peer_id = ?",
        )
        .bind(peer_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(PeerState::default());
        };
        Ok(PeerState {
            last_pull_at: parse_opt_ts(row.last_pull_at)?,
            last_sync_at: parse_opt_ts(row.last_sync_at)?,
            last_error: row.last_error,
            incompatible_schema: row
                .incompatible_schema
                .map(|v| v.parse())
                .transpose()?,
        })
    }

    /// Records a completed exchange and the peer timestamp to pull from next.
    pub async fn record_success(
        &self,
        peer_id: Uuid,
        pulled_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO peer_sync_state (peer_id, last_pull_at, last_sync_at, last_error, incompatible_schema)
            VALUES (?, ?, ?, NULL, NULL)
            ON CONFLICT(peer_id) DO UPDATE SET
                last_pull_at = excluded.last_pull_at,
                last_sync_at = excluded.last_sync_at,
                last_error = NULL,
                incompatible_schema = NULL
            "#,
        )
        .bind(peer_id.to_string())
        .bind(ts(pulled_until))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_error(
        &self,
        peer_id: Uuid,
        error: &str,
        incompatible_schema: Option<SchemaVersion>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO peer_sync_state (peer_id, last_error, incompatible_schema)
            VALUES (?, ?, ?)
            ON CONFLICT(peer_id) DO UPDATE SET
                last_error = excluded.last_error,
                incompatible_schema = excluded.incompatible_schema
            "#,
        )
        .bind(peer_id.to_string())
        .bind(error)
        .bind(incompatible_schema.map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
