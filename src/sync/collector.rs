use chrono::{DateTime, Utc};
use clubsync_core::{EntityBatch, SyncPayload, SCHEMA_VERSION};
use sqlx::SqlitePool;

use crate::db::{DbError, EntityStore, Identity};

/// Builds outgoing batches from the entity store.
pub struct ChangeCollector {
    entities: EntityStore,
}

impl ChangeCollector {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            entities: EntityStore::new(pool),
        }
    }

    /// Everything in the outbox.
    pub async fn collect_unsynced(&self) -> Result<EntityBatch, DbError> {
        self.entities.query_unsynced().await
    }

    /// Everything written on this node after `since`.
    pub async fn collect_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<EntityBatch, DbError> {
        self.entities.query_modified_since(since).await
    }

    /// Acknowledges the exact versions in `batch`. Call only after the peer
    /// accepted them.
    pub async fn mark_synced(
        &self,
        batch: &EntityBatch,
        at: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        self.entities.mark_synced(&batch.refs(), at).await
    }

    /// Wraps a batch in the envelope peers expect.
    pub fn payload(
        identity: &Identity,
        entities: EntityBatch,
        timestamp: DateTime<Utc>,
    ) -> SyncPayload {
        SyncPayload {
            schema_version: SCHEMA_VERSION,
            device_id: identity.device_id,
            device_type: identity.device_type,
            timestamp,
            entities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use clubsync_core::{DeviceType, EquipmentItem};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_collect_then_mark_synced_empties_outbox() {
        let (_dir, pool) = test_pool().await;
        let collector = ChangeCollector::new(pool.clone());
        let store = EntityStore::new(pool);
        store
            .upsert(&EquipmentItem::new(Uuid::new_v4(), "Scoring tablet"))
            .await
            .unwrap();

        let batch = collector.collect_unsynced().await.unwrap();
        assert_eq!(batch.equipment_items.len(), 1);

        // Outbox is untouched until acknowledged.
        assert_eq!(collector.collect_unsynced().await.unwrap().len(), 1);

        assert_eq!(collector.mark_synced(&batch, Utc::now()).await.unwrap(), 1);
        assert!(collector.collect_unsynced().await.unwrap().is_empty());
        assert_eq!(collector.collect_since(None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_payload_carries_identity() {
        let identity = Identity {
            device_id: Uuid::new_v4(),
            network_id: Uuid::new_v4(),
            display_name: "Admin".to_string(),
            device_type: DeviceType::AdminTablet,
            trust_token: "t".to_string(),
        };
        let now = Utc::now();
        let payload = ChangeCollector::payload(&identity, EntityBatch::default(), now);
        assert_eq!(payload.device_id, identity.device_id);
        assert_eq!(payload.device_type, DeviceType::AdminTablet);
        assert_eq!(payload.schema_version, SCHEMA_VERSION);
        assert_eq!(payload.timestamp, now);
    }
}
