use chrono::{DateTime, Utc};
use clubsync_core::{DeviceType, TrustedDevice};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_opt_ts, parse_ts, parse_uuid, ts, DbError};

/// Who this node is and which network it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: Uuid,
    pub network_id: Uuid,
    pub display_name: String,
    pub device_type: DeviceType,
    /// Bearer token this node presents to peers.
    pub trust_token: String,
}

/// An issued, not yet redeemed pairing offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairing {
    pub token_hash: String,
    pub display_name: String,
    pub device_type: DeviceType,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct TrustStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    device_id: String,
    network_id: String,
    display_name: String,
    device_type: String,
    trust_token: String,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    display_name: String,
    device_type: String,
    paired_at: String,
    last_seen: Option<String>,
    is_trusted: bool,
    token_hash: String,
    address: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    token_hash: String,
    display_name: String,
    device_type: String,
    issued_at: String,
    expires_at: String,
}

impl TrustStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn identity(&self) -> Result<Option<Identity>, DbError> {
        let row: Option<IdentityRow> = sqlx::query_as(
            "SELECT device_id, network_id, display_name, device_type, trust_token FROM identity WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Identity {
                device_id: parse_uuid(&row.device_id)?,
                network_id: parse_uuid(&row.network_id)?,
                display_name: row.display_name,
                device_type: row.device_type.parse().map_err(DbError::Corrupt)?,
                trust_token: row.trust_token,
            })
        })
        .transpose()
    }

    pub async fn require_identity(&self) -> Result<Identity, DbError> {
        self.identity().await?.ok_or(DbError::NotInitialized)
    }

    pub async fn save_identity(&self, identity: &Identity) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO identity (id, device_id, network_id, display_name, device_type, trust_token, created_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                network_id = excluded.network_id,
                display_name = excluded.display_name,
                device_type = excluded.device_type,
                trust_token = excluded.trust_token
            "#,
        )
        .bind(identity.device_id.to_string())
        .bind(identity.network_id.to_string())
        .bind(&identity.display_name)
        .bind(identity.device_type.as_str())
        .bind(&identity.trust_token)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_device(&self, device: &TrustedDevice) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        write_device(&mut conn, device).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TrustedDevice>, DbError> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM trusted_devices WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(to_device).transpose()
    }

    pub async fn list(&self) -> Result<Vec<TrustedDevice>, DbError> {
        let rows: Vec<DeviceRow> =
            sqlx::query_as("SELECT * FROM trusted_devices ORDER BY paired_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(to_device).collect()
    }

    /// Trusted devices other than `self_id`.
    pub async fn peers(&self, self_id: Uuid) -> Result<Vec<TrustedDevice>, DbError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.is_trusted && d.id != self_id)
            .collect())
    }

    /// The device presenting a token with this hash, trusted or not.
    pub async fn find_by_token_hash(&self, hash: &str) -> Result<Option<TrustedDevice>, DbError> {
        let row: Option<DeviceRow> =
            sqlx::query_as("SELECT * FROM trusted_devices WHERE token_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        row.map(to_device).transpose()
    }

    pub async fn device_type_of(&self, id: Uuid) -> Result<Option<DeviceType>, DbError> {
        let mut conn = self.pool.acquire().await?;
        device_type_in(&mut conn, id).await
    }

    /// Marks a device untrusted. Returns false if it is unknown.
    pub async fn revoke(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE trusted_devices SET is_trusted = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        address: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE trusted_devices
            SET last_seen = MAX(COALESCE(last_seen, ''), ?),
                address = COALESCE(?, address)
            WHERE id = ?
            "#,
        )
        .bind(ts(at))
        .bind(address)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merges a trust list received from a peer. Unknown devices are added,
    /// known ones combined with [`TrustedDevice::merged_with`].
    ///
    /// Returns the number of entries that changed.
    pub async fn merge(&self, incoming: &[TrustedDevice]) -> Result<usize, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for device in incoming {
            let row: Option<DeviceRow> =
                sqlx::query_as("SELECT * FROM trusted_devices WHERE id = ?")
                    .bind(device.id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;

            let merged = match row.map(to_device).transpose()? {
                Some(local) => {
                    let merged = local.merged_with(device);
                    if merged == local {
                        continue;
                    }
                    if local.is_trusted && !merged.is_trusted {
                        tracing::info!(device_id = %device.id, "Device revoked by peer");
                    }
                    merged
                }
                None => {
                    tracing::info!(
                        device_id = %device.id,
                        name = %device.display_name,
                        "Learned trusted device from peer"
                    );
                    device.clone()
                }
            };

            write_device(&mut tx, &merged).await?;
            changed += 1;
        }

        tx.commit().await?;
        Ok(changed)
    }

    pub async fn save_pending(&self, pending: &PendingPairing) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO pending_pairings (token_hash, display_name, device_type, issued_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pending.token_hash)
        .bind(&pending.display_name)
        .bind(pending.device_type.as_str())
        .bind(ts(pending.issued_at))
        .bind(ts(pending.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes and returns the offer for this token hash. Offers are
    /// single-use, so an expired offer is consumed too.
    pub async fn take_pending(&self, token_hash: &str) -> Result<Option<PendingPairing>, DbError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<PendingRow> =
            sqlx::query_as("SELECT * FROM pending_pairings WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&mut *tx)
                .await?;

        if row.is_some() {
            sqlx::query("DELETE FROM pending_pairings WHERE token_hash = ?")
                .bind(token_hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        row.map(|row| {
            Ok(PendingPairing {
                token_hash: row.token_hash,
                display_name: row.display_name,
                device_type: row.device_type.parse().map_err(DbError::Corrupt)?,
                issued_at: parse_ts(&row.issued_at)?,
                expires_at: parse_ts(&row.expires_at)?,
            })
        })
        .transpose()
    }

    pub async fn purge_expired_pending(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let result = sqlx::query("DELETE FROM pending_pairings WHERE expires_at < ?")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

pub(crate) async fn device_type_in(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<DeviceType>, DbError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT device_type FROM trusted_devices WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|(t,)| t.parse().map_err(DbError::Corrupt))
        .transpose()
}

async fn write_device(conn: &mut SqliteConnection, device: &TrustedDevice) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO trusted_devices (id, display_name, device_type, paired_at, last_seen, is_trusted, token_hash, address)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            display_name = excluded.display_name,
            device_type = excluded.device_type,
            paired_at = excluded.paired_at,
            last_seen = excluded.last_seen,
            is_trusted = excluded.is_trusted,
            token_hash = excluded.token_hash,
            address = excluded.address
        "#,
    )
    .bind(device.id.to_string())
    .bind(&device.display_name)
    .bind(device.device_type.as_str())
    .bind(ts(device.paired_at))
    .bind(device.last_seen.map(ts))
    .bind(device.is_trusted)
    .bind(&device.token_hash)
    .bind(&device.address)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn to_device(row: DeviceRow) -> Result<TrustedDevice, DbError> {
    Ok(TrustedDevice {
        id: parse_uuid(&row.id)?,
        display_name: row.display_name,
        device_type: row.device_type.parse().map_err(DbError::Corrupt)?,
        paired_at: parse_ts(&row.paired_at)?,
        last_seen: parse_opt_ts(row.last_seen)?,
        is_trusted: row.is_trusted,
        token_hash: row.token_hash,
        address: row.address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;
    use clubsync_core::hash_token;

    fn device(name: &str, token: &str) -> TrustedDevice {
        TrustedDevice {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
            device_type: DeviceType::MemberTablet,
            paired_at: Utc::now(),
            last_seen: None,
            is_trusted: true,
            token_hash: hash_token(token),
            address: None,
        }
    }

    #[tokio::test]
    async fn test_identity_round_trip() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        assert!(store.identity().await.unwrap().is_none());
        assert!(matches!(
            store.require_identity().await,
            Err(DbError::NotInitialized)
        ));

        let identity = Identity {
            device_id: Uuid::new_v4(),
            network_id: Uuid::new_v4(),
            display_name: "Office laptop".to_string(),
            device_type: DeviceType::Laptop,
            trust_token: "secret".to_string(),
        };
        store.save_identity(&identity).await.unwrap();
        assert_eq!(store.require_identity().await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_find_by_token_hash_and_revoke() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        let tablet = device("Front desk", "tok-1");
        store.upsert_device(&tablet).await.unwrap();

        let found = store
            .find_by_token_hash(&hash_token("tok-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, tablet.id);
        assert!(found.is_trusted);

        assert!(store.revoke(tablet.id).await.unwrap());
        assert!(!store.get(tablet.id).await.unwrap().unwrap().is_trusted);
        assert!(!store.revoke(Uuid::new_v4()).await.unwrap());
        assert!(store.peers(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_adds_unknown_and_keeps_revocation() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        let known = device("Front desk", "tok-1");
        store.upsert_device(&known).await.unwrap();
        store.revoke(known.id).await.unwrap();

        // A peer that has not heard about the revocation yet.
        let stale = known.clone();
        let new = device("Range kiosk", "tok-2");
        let changed = store.merge(&[stale, new.clone()]).await.unwrap();

        assert_eq!(changed, 1);
        assert!(!store.get(known.id).await.unwrap().unwrap().is_trusted);
        assert!(store.get(new.id).await.unwrap().is_some());

        // Merging the same list again changes nothing.
        assert_eq!(store.merge(&[new]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_updates_last_seen_and_address() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        let tablet = device("Front desk", "tok-1");
        store.upsert_device(&tablet).await.unwrap();

        let seen = Utc::now();
        store
            .touch(tablet.id, seen, Some("http://10.0.0.5:47801"))
            .await
            .unwrap();
        store
            .touch(tablet.id, seen - Duration::minutes(5), None)
            .await
            .unwrap();

        let loaded = store.get(tablet.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_seen, Some(seen));
        assert_eq!(loaded.address.as_deref(), Some("http://10.0.0.5:47801"));
    }

    #[tokio::test]
    async fn test_pending_offer_is_single_use() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        let now = Utc::now();
        let pending = PendingPairing {
            token_hash: hash_token("offer"),
            display_name: "Scoreboard".to_string(),
            device_type: DeviceType::DisplayScoreboard,
            issued_at: now,
            expires_at: now + Duration::minutes(5),
        };
        store.save_pending(&pending).await.unwrap();

        assert_eq!(
            store.take_pending(&pending.token_hash).await.unwrap(),
            Some(pending.clone())
        );
        assert!(store.take_pending(&pending.token_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_pending() {
        let (_dir, pool) = test_pool().await;
        let store = TrustStore::new(pool);
        let now = Utc::now();
        let offers = [
            ("old", now - Duration::minutes(1)),
            ("new", now + Duration::minutes(4)),
        ];
        for (token, expires) in offers {
            store
                .save_pending(&PendingPairing {
                    token_hash: hash_token(token),
                    display_name: token.to_string(),
                    device_type: DeviceType::Laptop,
                    issued_at: expires - Duration::minutes(5),
                    expires_at: expires,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.purge_expired_pending(now).await.unwrap(), 1);
        assert!(store.take_pending(&hash_token("new")).await.unwrap().is_some());
    }
}
