use chrono::{DateTime, Utc};
use clubsync_core::{
    superseding_time, CheckoutConflictStatus, ConflictState, EntityKind, EquipmentCheckout,
    Resolution, SyncConflict, SyncError,
};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::entities::{lookup, write_row};
use super::{parse_opt_ts, parse_ts, parse_uuid, ts, DbError};

/// Conflicts awaiting or past operator resolution. Local to this node.
pub struct ConflictStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_kind: String,
    local_entity_id: String,
    remote_entity_id: String,
    remote_device_id: String,
    detected_at: String,
    description: String,
    state: String,
    resolution: Option<String>,
    resolved_at: Option<String>,
    synced_at: Option<String>,
}

const SELECT_CONFLICT: &str = r#"
    SELECT id, entity_kind, local_entity_id, remote_entity_id, remote_device_id,
           detected_at, description, state, resolution, resolved_at, synced_at
    FROM sync_conflicts
"#;

impl ConflictStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a conflict unless one already exists for the same pair of
    /// entities. Returns whether a row was inserted.
    pub async fn insert(&self, conflict: &SyncConflict) -> Result<bool, DbError> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut conn, conflict).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SyncConflict>, DbError> {
        let row: Option<ConflictRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_CONFLICT))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(to_conflict).transpose()
    }

    pub async fn list(&self, state: Option<ConflictState>) -> Result<Vec<SyncConflict>, DbError> {
        let rows: Vec<ConflictRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "{} WHERE state = ? ORDER BY detected_at",
                    SELECT_CONFLICT
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!("{} ORDER BY detected_at", SELECT_CONFLICT))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(to_conflict).collect()
    }

    pub async fn pending_count(&self) -> Result<usize, DbError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_conflicts WHERE state = ?")
            .bind(ConflictState::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    /// Applies an operator decision together with the entity changes it
    /// implies, in one transaction. Changed entities re-enter the outbox.
    pub async fn resolve(
        &self,
        id: Uuid,
        resolution: Resolution,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SyncConflict, DbError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ConflictRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_CONFLICT))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let mut conflict = row
            .map(to_conflict)
            .transpose()?
            .ok_or_else(|| DbError::NotFound(format!("conflict {}", id)))?;

        if conflict.state != ConflictState::Pending {
            return Err(SyncError::Validation(format!(
                "conflict {} is already {}",
                id, conflict.state
            ))
            .into());
        }
        if !resolution.is_allowed_for(conflict.entity_kind) {
            return Err(SyncError::Validation(format!(
                "resolution {} does not apply to {} conflicts",
                resolution, conflict.entity_kind
            ))
            .into());
        }

        match (conflict.entity_kind, resolution) {
            (EntityKind::EquipmentCheckout, _) => {
                let cancel = match resolution {
                    Resolution::KeepLocal => conflict.remote_entity_id,
                    Resolution::AcceptRemote => conflict.local_entity_id,
                    Resolution::CancelCheckout { checkout_id }
                        if conflict.involves(checkout_id) =>
                    {
                        checkout_id
                    }
                    _ => {
                        return Err(SyncError::Validation(format!(
                            "checkout to cancel is not part of conflict {}",
                            id
                        ))
                        .into())
                    }
                };
                settle_checkouts(&mut tx, &conflict, cancel, device_id, now).await?;
            }
            (kind, Resolution::KeepLocal) => {
                bump(&mut tx, kind, conflict.local_entity_id, device_id, now).await?;
            }
            (kind, Resolution::AcceptRemote) => {
                bump(&mut tx, kind, conflict.remote_entity_id, device_id, now).await?;
            }
            _ => {}
        }

        sqlx::query(
            "UPDATE sync_conflicts SET state = ?, resolution = ?, resolved_at = ? WHERE id = ?",
        )
        .bind(ConflictState::Resolved.as_str())
        .bind(serde_json::to_string(&resolution)?)
        .bind(ts(now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(conflict_id = %id, resolution = %resolution, "Conflict resolved");

        conflict.state = ConflictState::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_at_utc = Some(now);
        Ok(conflict)
    }

    /// Moves resolved conflicts to `SYNCED` once every entity they touched
    /// has been acknowledged by a peer.
    pub async fn mark_acknowledged(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET state = ?, synced_at = ?
            WHERE state = ?
              AND NOT EXISTS (
                SELECT 1 FROM entities e
                WHERE e.id IN (sync_conflicts.local_entity_id, sync_conflicts.remote_entity_id)
                  AND (e.synced_at IS NULL OR e.synced_at < e.modified_at)
              )
            "#,
        )
        .bind(ConflictState::Synced.as_str())
        .bind(ts(now))
        .bind(ConflictState::Resolved.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Deletes `SYNCED` conflicts acknowledged before `cutoff`.
    pub async fn purge_synced(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let result = sqlx::query("DELETE FROM sync_conflicts WHERE state = ? AND synced_at < ?")
            .bind(ConflictState::Synced.as_str())
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

pub(crate) async fn insert_in(
    conn: &mut SqliteConnection,
    conflict: &SyncConflict,
) -> Result<bool, DbError> {
    let (low, high) = conflict.entity_pair();
    let resolution = conflict
        .resolution
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO sync_conflicts (
            id, entity_kind, local_entity_id, remote_entity_id, remote_device_id,
            pair_low, pair_high, detected_at, description, state, resolution, resolved_at, synced_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(conflict.id.to_string())
    .bind(conflict.entity_kind.as_str())
    .bind(conflict.local_entity_id.to_string())
    .bind(conflict.remote_entity_id.to_string())
    .bind(conflict.remote_device_id.to_string())
    .bind(low.to_string())
    .bind(high.to_string())
    .bind(ts(conflict.detected_at_utc))
    .bind(&conflict.description)
    .bind(conflict.state.as_str())
    .bind(resolution)
    .bind(conflict.resolved_at_utc.map(ts))
    .bind(conflict.synced_at_utc.map(ts))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Records `conflict` unless its pair of entities already has one, and
/// returns whichever row is stored for the pair.
pub(crate) async fn record_in(
    conn: &mut SqliteConnection,
    conflict: &SyncConflict,
) -> Result<SyncConflict, DbError> {
    if !insert_in(&mut *conn, conflict).await? {
        tracing::debug!(
            local = %conflict.local_entity_id,
            remote = %conflict.remote_entity_id,
            "Conflict already recorded"
        );
    }

    let (low, high) = conflict.entity_pair();
    let row: ConflictRow = sqlx::query_as(&format!(
        "{} WHERE pair_low = ? AND pair_high = ?",
        SELECT_CONFLICT
    ))
    .bind(low.to_string())
    .bind(high.to_string())
    .fetch_one(&mut *conn)
    .await?;
    to_conflict(row)
}

/// Closes pending conflicts involving `entity_id` because a peer already
/// resolved them. Returns the number settled.
pub(crate) async fn settle_by_peer(
    conn: &mut SqliteConnection,
    entity_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE sync_conflicts
        SET state = ?, resolution = ?, resolved_at = ?, synced_at = ?
        WHERE state = ? AND (local_entity_id = ? OR remote_entity_id = ?)
        "#,
    )
    .bind(ConflictState::Synced.as_str())
    .bind(serde_json::to_string(&Resolution::ResolvedByPeer)?)
    .bind(ts(now))
    .bind(ts(now))
    .bind(ConflictState::Pending.as_str())
    .bind(entity_id.to_string())
    .bind(entity_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() as usize)
}

async fn settle_checkouts(
    conn: &mut SqliteConnection,
    conflict: &SyncConflict,
    cancel: Uuid,
    device_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    for id in [conflict.local_entity_id, conflict.remote_entity_id] {
        let mut checkout: EquipmentCheckout = lookup::by_id(&mut *conn, id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("checkout {}", id)))?;

        if id == cancel {
            checkout.cancelled_at_utc = Some(now);
        }
        checkout.conflict_status = CheckoutConflictStatus::Resolved;
        checkout.sync.supersede(device_id, now);
        write_row(&mut *conn, &checkout, now).await?;
    }
    Ok(())
}

/// Re-stamps a stored record as a fresh local write so it wins on peers.
async fn bump(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: Uuid,
    device_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let row: Option<(String, i64, String)> = sqlx::query_as(
        "SELECT data, sync_version, modified_at FROM entities WHERE kind = ? AND id = ?",
    )
    .bind(kind.as_str())
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    let (data, version, modified_at) =
        row.ok_or_else(|| DbError::NotFound(format!("{} {}", kind, id)))?;

    let mut value: serde_json::Value = serde_json::from_str(&data)?;
    let version = version + 1;
    let modified_at = superseding_time(parse_ts(&modified_at)?, now);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("syncVersion".into(), version.into());
        obj.insert("deviceId".into(), device_id.to_string().into());
        obj.insert("modifiedAtUtc".into(), serde_json::to_value(modified_at)?);
        obj.insert("syncedAtUtc".into(), serde_json::Value::Null);
    }

    sqlx::query(
        r#"
        UPDATE entities
        SET data = ?, sync_version = ?, device_id = ?, modified_at = ?, synced_at = NULL, changed_at = ?
        WHERE kind = ? AND id = ?
        "#,
    )
    .bind(serde_json::to_string(&value)?)
    .bind(version)
    .bind(device_id.to_string())
    .bind(ts(modified_at))
    .bind(ts(now))
    .bind(kind.as_str())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn to_conflict(row: ConflictRow) -> Result<SyncConflict, DbError> {
    Ok(SyncConflict {
        id: parse_uuid(&row.id)?,
        entity_kind: row.entity_kind.parse().map_err(DbError::Corrupt)?,
        local_entity_id: parse_uuid(&row.local_entity_id)?,
        remote_entity_id: parse_uuid(&row.remote_entity_id)?,
        remote_device_id: parse_uuid(&row.remote_device_id)?,
        detected_at_utc: parse_ts(&row.detected_at)?,
        description: row.description,
        state: row.state.parse().map_err(DbError::Corrupt)?,
        resolution: row
            .resolution
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        resolved_at_utc: parse_opt_ts(row.resolved_at)?,
        synced_at_utc: parse_opt_ts(row.synced_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, EntityStore};
    use chrono::Duration;
    use clubsync_core::Member;

    async fn checkout_conflict(
        pool: &SqlitePool,
    ) -> (SyncConflict, EquipmentCheckout, EquipmentCheckout) {
        let entities = EntityStore::new(pool.clone());
        let item = Uuid::new_v4();
        let mut local = EquipmentCheckout::new(Uuid::new_v4(), item, Uuid::new_v4());
        let mut remote = EquipmentCheckout::new(Uuid::new_v4(), item, Uuid::new_v4());
        local.conflict_status = CheckoutConflictStatus::Pending;
        remote.conflict_status = CheckoutConflictStatus::Pending;
        entities.upsert(&local).await.unwrap();
        entities.upsert(&remote).await.unwrap();

        let conflict = SyncConflict::new(
            EntityKind::EquipmentCheckout,
            local.sync.id,
            remote.sync.id,
            remote.sync.device_id,
            "double checkout",
        );
        ConflictStore::new(pool.clone())
            .insert(&conflict)
            .await
            .unwrap();
        (conflict, local, remote)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_per_entity_pair() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let (conflict, _, _) = checkout_conflict(&pool).await;

        // The same pair reported from the other side.
        let mirrored = SyncConflict {
            id: Uuid::new_v4(),
            ..conflict.mirrored(Uuid::new_v4())
        };
        assert!(!store.insert(&mirrored).await.unwrap());
        assert_eq!(store.list(None).await.unwrap().len(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_cancel_checkout_updates_both() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let entities = EntityStore::new(pool.clone());
        let (conflict, local, remote) = checkout_conflict(&pool).await;
        let me = Uuid::new_v4();
        let now = Utc::now();

        let resolved = store
            .resolve(
                conflict.id,
                Resolution::CancelCheckout {
                    checkout_id: remote.sync.id,
                },
                me,
                now,
            )
            .await
            .unwrap();
        assert_eq!(resolved.state, ConflictState::Resolved);

        let kept: EquipmentCheckout = entities.get(local.sync.id).await.unwrap().unwrap();
        let cancelled: EquipmentCheckout = entities.get(remote.sync.id).await.unwrap().unwrap();
        assert!(kept.is_open());
        assert_eq!(cancelled.cancelled_at_utc, Some(now));
        for checkout in [&kept, &cancelled] {
            assert_eq!(checkout.conflict_status, CheckoutConflictStatus::Resolved);
            assert_eq!(checkout.sync.sync_version, 2);
            assert_eq!(checkout.sync.device_id, me);
            assert!(checkout.sync.needs_sync());
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_invalid_choices() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let (conflict, _, _) = checkout_conflict(&pool).await;

        let keep_both = store
            .resolve(conflict.id, Resolution::KeepBoth, Uuid::new_v4(), Utc::now())
            .await;
        assert!(matches!(keep_both, Err(DbError::Sync(SyncError::Validation(_)))));

        let stranger = store
            .resolve(
                conflict.id,
                Resolution::CancelCheckout {
                    checkout_id: Uuid::new_v4(),
                },
                Uuid::new_v4(),
                Utc::now(),
            )
            .await;
        assert!(matches!(stranger, Err(DbError::Sync(SyncError::Validation(_)))));

        store
            .resolve(conflict.id, Resolution::KeepLocal, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let again = store
            .resolve(conflict.id, Resolution::KeepLocal, Uuid::new_v4(), Utc::now())
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_keep_local_bumps_generic_entity() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let entities = EntityStore::new(pool.clone());
        let member = Member::new(Uuid::new_v4(), "A-9", "Ada", "Lovelace");
        entities.upsert(&member).await.unwrap();
        let conflict = SyncConflict::new(
            EntityKind::Member,
            member.sync.id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "manual review",
        );
        store.insert(&conflict).await.unwrap();

        let me = Uuid::new_v4();
        store
            .resolve(conflict.id, Resolution::KeepLocal, me, Utc::now())
            .await
            .unwrap();

        let bumped: Member = entities.get(member.sync.id).await.unwrap().unwrap();
        assert_eq!(bumped.sync.sync_version, 2);
        assert_eq!(bumped.sync.device_id, me);
        assert_eq!(bumped.first_name, "Ada");
    }

    #[tokio::test]
    async fn test_resolved_becomes_synced_after_ack_then_purged() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let entities = EntityStore::new(pool.clone());
        let (conflict, _, _) = checkout_conflict(&pool).await;
        let now = Utc::now();

        store
            .resolve(conflict.id, Resolution::AcceptRemote, Uuid::new_v4(), now)
            .await
            .unwrap();
        assert_eq!(store.mark_acknowledged(now).await.unwrap(), 0);

        let outbox = entities.query_unsynced().await.unwrap();
        entities
            .mark_synced(&outbox.refs(), now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(store.mark_acknowledged(now).await.unwrap(), 1);
        assert_eq!(
            store.get(conflict.id).await.unwrap().unwrap().state,
            ConflictState::Synced
        );

        assert_eq!(store.purge_synced(now - Duration::days(30)).await.unwrap(), 0);
        assert_eq!(store.purge_synced(now + Duration::days(31)).await.unwrap(), 1);
        assert!(store.get(conflict.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settle_by_peer() {
        let (_dir, pool) = test_pool().await;
        let store = ConflictStore::new(pool.clone());
        let (conflict, _, remote) = checkout_conflict(&pool).await;

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(
            settle_by_peer(&mut conn, remote.sync.id, Utc::now())
                .await
                .unwrap(),
            1
        );
        let settled = store.get(conflict.id).await.unwrap().unwrap();
        assert_eq!(settled.state, ConflictState::Synced);
        assert_eq!(settled.resolution, Some(Resolution::ResolvedByPeer));
    }
}
