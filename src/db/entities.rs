use chrono::{DateTime, NaiveDate, Utc};
use clubsync_core::{
    CheckIn, EntityBatch, EntityCounts, EntityKind, EntityRef, EquipmentCheckout,
    PracticeSession, SyncEntity,
};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_opt_ts, ts, DbError};

/// Replicated records, one row per `(kind, id)` with the record as JSON.
pub struct EntityStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    kind: String,
    data: String,
    synced_at: Option<String>,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a locally made change. The record enters the outbox if its
    /// envelope says it needs sync.
    pub async fn upsert<T: SyncEntity>(&self, entity: &T) -> Result<(), DbError> {
        entity.envelope().validate()?;
        let mut conn = self.pool.acquire().await?;
        write_row(&mut conn, entity, Utc::now()).await
    }

    pub async fn get<T: SyncEntity>(&self, id: Uuid) -> Result<Option<T>, DbError> {
        let mut conn = self.pool.acquire().await?;
        lookup::by_id(&mut conn, id).await
    }

    pub async fn list<T: SyncEntity>(&self) -> Result<Vec<T>, DbError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT kind, data, synced_at FROM entities WHERE kind = ? ORDER BY created_at",
        )
        .bind(T::KIND.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| decode(&row.data, row.synced_at))
            .collect()
    }

    /// Records with `synced_at` unset or older than `modified_at`.
    pub async fn query_unsynced(&self) -> Result<EntityBatch, DbError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT kind, data, synced_at FROM entities
            WHERE synced_at IS NULL OR synced_at < modified_at
            ORDER BY changed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        to_batch(rows)
    }

    /// Records written on this node after `since`, by the local change
    /// marker. `None` returns everything.
    pub async fn query_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<EntityBatch, DbError> {
        let rows: Vec<EntityRow> = match since {
            Some(since) => {
                sqlx::query_as(
                    "SELECT kind, data, synced_at FROM entities WHERE changed_at > ? ORDER BY changed_at",
                )
                .bind(ts(since))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT kind, data, synced_at FROM entities ORDER BY changed_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        to_batch(rows)
    }

    /// Marks the given versions as exchanged. A row whose version moved on
    /// since it was collected is left in the outbox.
    ///
    /// Returns the number of rows updated.
    pub async fn mark_synced(
        &self,
        refs: &[EntityRef],
        at: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let mut tx = self.pool.begin().await?;
        let at = ts(at);
        let mut updated = 0;

        for r in refs {
            let result = sqlx::query(
                r#"
                UPDATE entities SET synced_at = MAX(?, modified_at)
                WHERE kind = ? AND id = ? AND sync_version = ?
                "#,
            )
            .bind(&at)
            .bind(r.kind.as_str())
            .bind(r.id.to_string())
            .bind(r.sync_version)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(updated)
    }

    pub async fn counts(&self) -> Result<EntityCounts, DbError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, COUNT(*) FROM entities GROUP BY kind")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = EntityCounts::default();
        for (kind, n) in rows {
            let kind: EntityKind = kind.parse().map_err(DbError::Corrupt)?;
            counts.add(kind, n as usize);
        }
        Ok(counts)
    }

    pub async fn unsynced_count(&self) -> Result<usize, DbError> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entities WHERE synced_at IS NULL OR synced_at < modified_at",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n as usize)
    }
}

/// Writes `entity` as-is, stamping the local change marker.
pub(crate) async fn write_row<T: SyncEntity>(
    conn: &mut SqliteConnection,
    entity: &T,
    changed_at: DateTime<Utc>,
) -> Result<(), DbError> {
    let env = entity.envelope();
    let data = serde_json::to_string(entity)?;

    sqlx::query(
        r#"
        INSERT INTO entities (kind, id, device_id, sync_version, created_at, modified_at, synced_at, changed_at, data)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(kind, id) DO UPDATE SET
            device_id = excluded.device_id,
            sync_version = excluded.sync_version,
            created_at = excluded.created_at,
            modified_at = excluded.modified_at,
            synced_at = excluded.synced_at,
            changed_at = excluded.changed_at,
            data = excluded.data
        "#,
    )
    .bind(T::KIND.as_str())
    .bind(env.id.to_string())
    .bind(env.device_id.to_string())
    .bind(env.sync_version)
    .bind(ts(env.created_at_utc))
    .bind(ts(env.modified_at_utc))
    .bind(env.synced_at_utc.map(ts))
    .bind(ts(changed_at))
    .bind(data)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Stores a record received from a peer. It is already known to that peer,
/// so it is marked synced and stays out of the outbox.
pub(crate) async fn write_incoming<T: SyncEntity>(
    conn: &mut SqliteConnection,
    entity: &T,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let mut entity = entity.clone();
    let env = entity.envelope_mut();
    env.synced_at_utc = Some(now.max(env.modified_at_utc));
    write_row(conn, &entity, now).await
}

/// Point queries used by the apply path inside its transaction.
pub(crate) mod lookup {
    use super::*;

    pub async fn by_id<T: SyncEntity>(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<T>, DbError> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT kind, data, synced_at FROM entities WHERE kind = ? AND id = ?")
                .bind(T::KIND.as_str())
                .bind(id.to_string())
                .fetch_optional(&mut *conn)
                .await?;

        row.map(|row| decode(&row.data, row.synced_at)).transpose()
    }

    pub async fn check_in_for_day(
        conn: &mut SqliteConnection,
        member_id: Uuid,
        local_date: NaiveDate,
    ) -> Result<Option<CheckIn>, DbError> {
        let row: Option<EntityRow> = sqlx::query_as(
            r#"
            SELECT kind, data, synced_at FROM entities
            WHERE kind = ?
              AND json_extract(data, '$.memberId') = ?
              AND json_extract(data, '$.localDate') = ?
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(EntityKind::CheckIn.as_str())
        .bind(member_id.to_string())
        .bind(local_date.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| decode(&row.data, row.synced_at)).transpose()
    }

    pub async fn practice_sessions_for_day(
        conn: &mut SqliteConnection,
        member_id: Uuid,
        local_date: NaiveDate,
    ) -> Result<Vec<PracticeSession>, DbError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT kind, data, synced_at FROM entities
            WHERE kind = ?
              AND json_extract(data, '$.memberId') = ?
              AND json_extract(data, '$.localDate') = ?
            "#,
        )
        .bind(EntityKind::PracticeSession.as_str())
        .bind(member_id.to_string())
        .bind(local_date.to_string())
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| decode(&row.data, row.synced_at))
            .collect()
    }

    pub async fn open_checkouts_for_item(
        conn: &mut SqliteConnection,
        equipment_id: Uuid,
    ) -> Result<Vec<EquipmentCheckout>, DbError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT kind, data, synced_at FROM entities
            WHERE kind = ?
              AND json_extract(data, '$.equipmentId') = ?
              AND json_extract(data, '$.checkedInAtUtc') IS NULL
              AND json_extract(data, '$.cancelledAtUtc') IS NULL
            "#,
        )
        .bind(EntityKind::EquipmentCheckout.as_str())
        .bind(equipment_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| decode(&row.data, row.synced_at))
            .collect()
    }
}

fn decode<T: SyncEntity>(data: &str, synced_at: Option<String>) -> Result<T, DbError> {
    let mut entity: T = serde_json::from_str(data)?;
    entity.envelope_mut().synced_at_utc = parse_opt_ts(synced_at)?;
    Ok(entity)
}

fn to_batch(rows: Vec<EntityRow>) -> Result<EntityBatch, DbError> {
    let mut batch = EntityBatch::default();
    for row in rows {
        let kind: EntityKind = row.kind.parse().map_err(DbError::Corrupt)?;
        match kind {
            EntityKind::Member => batch.members.push(decode(&row.data, row.synced_at)?),
            EntityKind::NewMemberRegistration => batch
                .new_member_registrations
                .push(decode(&row.data, row.synced_at)?),
            EntityKind::EquipmentItem => {
                batch.equipment_items.push(decode(&row.data, row.synced_at)?)
            }
            EntityKind::CheckIn => batch.check_ins.push(decode(&row.data, row.synced_at)?),
            EntityKind::PracticeSession => batch
                .practice_sessions
                .push(decode(&row.data, row.synced_at)?),
            EntityKind::ScanEvent => batch.scan_events.push(decode(&row.data, row.synced_at)?),
            EntityKind::EquipmentCheckout => batch
                .equipment_checkouts
                .push(decode(&row.data, row.synced_at)?),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;
    use clubsync_core::{EquipmentItem, Member};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, 11).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool);
        let member = Member::new(Uuid::new_v4(), "A-100", "Ada", "Lovelace");

        store.upsert(&member).await.unwrap();
        let loaded: Member = store.get(member.sync.id).await.unwrap().unwrap();
        assert_eq!(loaded, member);

        let missing: Option<EquipmentItem> = store.get(member.sync.id).await.unwrap();
        assert!(missing.is_none(), "lookups are scoped by kind");
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_envelope() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool);
        let mut member = Member::new(Uuid::new_v4(), "A-100", "Ada", "Lovelace");
        member.sync.sync_version = 0;

        assert!(matches!(
            store.upsert(&member).await,
            Err(DbError::Sync(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_synced_only_for_sent_version() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool);
        let device = Uuid::new_v4();
        let mut member = Member::new(device, "A-1", "Grace", "Hopper");
        store.upsert(&member).await.unwrap();

        let sent = store.query_unsynced().await.unwrap();
        assert_eq!(sent.members.len(), 1);

        // Modified while the push was in flight.
        member.sync.touch(device, member.sync.modified_at_utc + Duration::seconds(1));
        store.upsert(&member).await.unwrap();

        let updated = store
            .mark_synced(&sent.refs(), Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(updated, 0);
        assert_eq!(store.query_unsynced().await.unwrap().members.len(), 1);

        let resent = store.query_unsynced().await.unwrap();
        store
            .mark_synced(&resent.refs(), Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert!(store.query_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_synced_never_precedes_modification() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool);
        // Written by a device whose clock runs ahead.
        let item = EquipmentItem {
            sync: clubsync_core::SyncEnvelope::created_at(
                Uuid::new_v4(),
                Utc::now() + Duration::hours(3),
            ),
            ..EquipmentItem::new(Uuid::new_v4(), "Bow #4")
        };
        store.upsert(&item).await.unwrap();

        let sent = store.query_unsynced().await.unwrap();
        store.mark_synced(&sent.refs(), Utc::now()).await.unwrap();
        assert!(store.query_unsynced().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_modified_since_uses_local_change_time() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool.clone());
        let before = Utc::now() - Duration::seconds(1);

        // Remote clock far in the past; still visible because it was written now.
        let old = Member {
            sync: clubsync_core::SyncEnvelope::created_at(
                Uuid::new_v4(),
                Utc::now() - Duration::days(30),
            ),
            ..Member::new(Uuid::new_v4(), "A-2", "Alan", "Turing")
        };
        let mut conn = pool.acquire().await.unwrap();
        write_incoming(&mut conn, &old, Utc::now()).await.unwrap();

        let batch = store.query_modified_since(Some(before)).await.unwrap();
        assert_eq!(batch.members.len(), 1);
        assert!(store.query_unsynced().await.unwrap().is_empty());

        let later = store
            .query_modified_since(Some(Utc::now() + Duration::seconds(1)))
            .await
            .unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_helpers() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool.clone());
        let device = Uuid::new_v4();
        let member = Uuid::new_v4();
        let item = Uuid::new_v4();

        store.upsert(&CheckIn::new(device, member, date())).await.unwrap();
        store
            .upsert(&PracticeSession::new(device, member, date(), "kata", 80))
            .await
            .unwrap();
        let open = EquipmentCheckout::new(device, item, member);
        let mut returned = EquipmentCheckout::new(device, item, member);
        returned.checked_in_at_utc = Some(Utc::now());
        store.upsert(&open).await.unwrap();
        store.upsert(&returned).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(lookup::check_in_for_day(&mut conn, member, date())
            .await
            .unwrap()
            .is_some());
        assert!(lookup::check_in_for_day(&mut conn, member, date().succ_opt().unwrap())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            lookup::practice_sessions_for_day(&mut conn, member, date())
                .await
                .unwrap()
                .len(),
            1
        );
        let open_now = lookup::open_checkouts_for_item(&mut conn, item).await.unwrap();
        assert_eq!(open_now.len(), 1);
        assert_eq!(open_now[0].sync.id, open.sync.id);
    }

    #[tokio::test]
    async fn test_counts_by_kind() {
        let (_dir, pool) = test_pool().await;
        let store = EntityStore::new(pool);
        let device = Uuid::new_v4();
        store
            .upsert(&Member::new(device, "A-1", "Ada", "Lovelace"))
            .await
            .unwrap();
        store
            .upsert(&EquipmentItem::new(device, "Target stand"))
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.members, 1);
        assert_eq!(counts.equipment_items, 1);
        assert_eq!(store.unsynced_count().await.unwrap(), 2);
    }
}
