//! One complete exchange with one peer.

use async_trait::async_trait;
use chrono::Utc;
use clubsync_core::{
    AuthorityPolicy, EntityCounts, EntityRef, SyncConflict, SyncError, SCHEMA_VERSION,
};
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use super::apply::Applier;
use super::client::{PushOutcome, SyncClient};
use super::collector::ChangeCollector;
use crate::db::{DbError, EntityStore, Identity, PeerStateStore, TrustStore};

/// A peer the orchestrator should talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    /// Base URL, e.g. `http://192.168.1.20:47801`.
    pub address: String,
}

/// What one successful exchange moved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerReport {
    /// Records the peer accepted from us.
    pub pushed: EntityCounts,
    /// Records we accepted from the peer.
    pub pulled: EntityCounts,
    pub conflicts: Vec<SyncConflict>,
}

impl PeerReport {
    /// Adds conflicts, ignoring any already reported. Push and pull can
    /// both see the same clash.
    fn add_conflicts(&mut self, conflicts: Vec<SyncConflict>) {
        for conflict in conflicts {
            if !self.conflicts.iter().any(|c| c.id == conflict.id) {
                self.conflicts.push(conflict);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerOutcome {
    Synced { peer_id: Uuid, report: PeerReport },
    Failed { peer_id: Uuid, error: SyncError },
}

impl PeerOutcome {
    pub fn peer_id(&self) -> Uuid {
        match self {
            PeerOutcome::Synced { peer_id, .. } | PeerOutcome::Failed { peer_id, .. } => *peer_id,
        }
    }
}

/// Runs a full exchange with one peer. Implementations never panic on peer
/// failure; they report it as [`PeerOutcome::Failed`].
#[async_trait]
pub trait PeerExchange: Send + Sync {
    async fn exchange(&self, peer: &Peer) -> PeerOutcome;
}

/// The real exchange over HTTP: trust list, status, push, pull.
pub struct HttpExchange {
    identity: Identity,
    trust: TrustStore,
    entities: EntityStore,
    collector: ChangeCollector,
    applier: Applier,
    peer_state: PeerStateStore,
    request_timeout: Duration,
}

impl HttpExchange {
    pub fn new(
        pool: SqlitePool,
        identity: Identity,
        policy: AuthorityPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            trust: TrustStore::new(pool.clone()),
            entities: EntityStore::new(pool.clone()),
            collector: ChangeCollector::new(pool.clone()),
            applier: Applier::new(pool.clone(), policy),
            peer_state: PeerStateStore::new(pool),
            request_timeout,
        }
    }

    async fn run(&self, peer: &Peer) -> Result<PeerReport, SyncError> {
        let client = SyncClient::new(
            &peer.address,
            Some(self.identity.trust_token.clone()),
            self.request_timeout,
        )?;
        let mut report = PeerReport::default();

        // Nothing, trust lists included, crosses a major schema boundary.
        let status = client.status().await?;
        SCHEMA_VERSION.ensure_compatible(&status.schema_version)?;
        if status.device_id != peer.id {
            return Err(SyncError::Validation(format!(
                "{} answers as device {}, expected {}",
                peer.address, status.device_id, peer.id
            )));
        }

        // Trust before data, so revocations reach the peer first.
        let devices = self.trust.list().await.map_err(store_error)?;
        let theirs = client.push_trust(devices).await?;
        let learned = self.trust.merge(&theirs.devices).await.map_err(store_error)?;
        if learned > 0 {
            tracing::info!(peer_id = %peer.id, learned, "Merged peer trust list");
        }

        self.push(&client, peer, &mut report).await?;
        self.pull(&client, peer, &mut report).await?;

        let now = Utc::now();
        self.trust
            .touch(peer.id, now, Some(&peer.address))
            .await
            .map_err(store_error)?;

        Ok(report)
    }

    async fn push(
        &self,
        client: &SyncClient,
        peer: &Peer,
        report: &mut PeerReport,
    ) -> Result<(), SyncError> {
        let batch = self.collector.collect_unsynced().await.map_err(store_error)?;
        if batch.is_empty() {
            return Ok(());
        }

        let payload = ChangeCollector::payload(&self.identity, batch, Utc::now());
        tracing::debug!(peer_id = %peer.id, records = payload.entities.len(), "Pushing changes");

        let (response, flagged) = match client.push(&payload).await? {
            PushOutcome::Accepted(response) => (response, Vec::new()),
            PushOutcome::Conflicted(response) => {
                let flagged = self
                    .applier
                    .record_remote_conflicts(&response.conflicts, peer.id)
                    .await
                    .map_err(store_error)?;
                (response, flagged)
            }
        };

        // Flagged and rejected records stay in the outbox.
        let acknowledged: Vec<EntityRef> = payload
            .entities
            .refs()
            .into_iter()
            .filter(|r| !response.rejected_ids.contains(&r.id))
            .filter(|r| !flagged.iter().any(|c| c.involves(r.id)))
            .collect();
        self.entities
            .mark_synced(&acknowledged, Utc::now())
            .await
            .map_err(store_error)?;

        if response.rejected > 0 {
            tracing::warn!(
                peer_id = %peer.id,
                rejected = response.rejected,
                "Peer rejected pushed records"
            );
        }
        report.pushed.merge(&response.accepted_counts);
        report.add_conflicts(flagged);

        Ok(())
    }

    async fn pull(
        &self,
        client: &SyncClient,
        peer: &Peer,
        report: &mut PeerReport,
    ) -> Result<(), SyncError> {
        let state = self.peer_state.get(peer.id).await.map_err(store_error)?;
        let payload = client.pull(state.last_pull_at).await?;
        SCHEMA_VERSION.ensure_compatible(&payload.schema_version)?;

        let applied = self.applier.apply_batch(&payload.entities, peer.id).await;
        tracing::debug!(
            peer_id = %peer.id,
            received = payload.entities.len(),
            accepted = applied.accepted.total(),
            skipped = applied.skipped,
            rejected = applied.rejected,
            "Applied pulled changes"
        );

        report.pulled.merge(&applied.accepted);
        report.add_conflicts(applied.conflicts);

        self.peer_state
            .record_success(peer.id, payload.timestamp, Utc::now())
            .await
            .map_err(store_error)
    }
}

#[async_trait]
impl PeerExchange for HttpExchange {
    async fn exchange(&self, peer: &Peer) -> PeerOutcome {
        match self.run(peer).await {
            Ok(report) => PeerOutcome::Synced {
                peer_id: peer.id,
                report,
            },
            Err(error) => {
                let incompatible = match &error {
                    SyncError::SchemaIncompatible { remote, .. } => Some(*remote),
                    _ => None,
                };
                if let Err(e) = self
                    .peer_state
                    .record_error(peer.id, &error.to_string(), incompatible)
                    .await
                {
                    tracing::warn!(peer_id = %peer.id, error = %e, "Failed to record peer error");
                }
                PeerOutcome::Failed {
                    peer_id: peer.id,
                    error,
                }
            }
        }
    }
}

/// Local storage failures abort the exchange like a failed peer would.
fn store_error(e: DbError) -> SyncError {
    match e {
        DbError::Sync(e) => e,
        other => SyncError::Validation(format!("Local store: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pairing::{generate_token, PairingService};
    use crate::server::{router, AppState};
    use crate::db::ConflictStore;
    use clubsync_core::{
        hash_token, DeviceType, EquipmentCheckout, EquipmentItem, Member, SchemaVersion,
        StatusResponse, TrustedDevice,
    };
    use std::sync::Arc;

    struct Node {
        _dir: tempfile::TempDir,
        pool: SqlitePool,
        identity: Identity,
        url: String,
    }

    impl Node {
        fn entry(&self) -> TrustedDevice {
            TrustedDevice {
                id: self.identity.device_id,
                display_name: self.identity.display_name.clone(),
                device_type: self.identity.device_type,
                paired_at: Utc::now(),
                last_seen: None,
                is_trusted: true,
                token_hash: hash_token(&self.identity.trust_token),
                address: Some(self.url.clone()),
            }
        }

        fn exchange(&self) -> HttpExchange {
            HttpExchange::new(
                self.pool.clone(),
                self.identity.clone(),
                AuthorityPolicy::default(),
                Duration::from_secs(5),
            )
        }

        fn as_peer(&self) -> Peer {
            Peer {
                id: self.identity.device_id,
                address: self.url.clone(),
            }
        }
    }

    /// Starts a node with its protocol server on an ephemeral loopback port.
    async fn node(network_id: Uuid, name: &str, device_type: DeviceType) -> Node {
        let (dir, pool) = test_pool().await;
        let identity = Identity {
            device_id: Uuid::new_v4(),
            network_id,
            display_name: name.to_string(),
            device_type,
            trust_token: generate_token(),
        };
        TrustStore::new(pool.clone())
            .save_identity(&identity)
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = router(AppState {
            pool: pool.clone(),
            identity: Arc::new(identity.clone()),
            policy: AuthorityPolicy::default(),
            pairing: PairingService::new(pool.clone(), Duration::from_secs(1)),
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Node {
            _dir: dir,
            pool,
            identity,
            url,
        }
    }

    async fn paired_nodes() -> (Node, Node) {
        let network = Uuid::new_v4();
        let a = node(network, "Front desk", DeviceType::AdminTablet).await;
        let b = node(network, "Kiosk", DeviceType::MemberTablet).await;
        for n in [&a, &b] {
            let trust = TrustStore::new(n.pool.clone());
            trust.upsert_device(&a.entry()).await.unwrap();
            trust.upsert_device(&b.entry()).await.unwrap();
        }
        (a, b)
    }

    #[tokio::test]
    async fn test_exchange_converges_both_ways() {
        let (a, b) = paired_nodes().await;
        let member = Member::new(a.identity.device_id, "M-100", "Ada", "Lovelace");
        let item = EquipmentItem::new(b.identity.device_id, "Recurve bow #3");
        EntityStore::new(a.pool.clone()).upsert(&member).await.unwrap();
        EntityStore::new(b.pool.clone()).upsert(&item).await.unwrap();

        let outcome = a.exchange().exchange(&b.as_peer()).await;
        let PeerOutcome::Synced { report, .. } = outcome else {
            panic!("exchange failed: {:?}", outcome);
        };
        assert_eq!(report.pushed.members, 1);
        assert_eq!(report.pulled.equipment_items, 1);
        assert!(report.conflicts.is_empty());

        let on_b: Option<Member> = EntityStore::new(b.pool.clone())
            .get(member.sync.id)
            .await
            .unwrap();
        assert!(on_b.is_some());
        let on_a: Option<EquipmentItem> = EntityStore::new(a.pool.clone())
            .get(item.sync.id)
            .await
            .unwrap();
        assert!(on_a.is_some());
        assert_eq!(EntityStore::new(a.pool.clone()).unsynced_count().await.unwrap(), 0);

        // A second exchange has nothing to move.
        let outcome = a.exchange().exchange(&b.as_peer()).await;
        let PeerOutcome::Synced { report, .. } = outcome else {
            panic!("exchange failed: {:?}", outcome);
        };
        assert_eq!(report.pushed.total(), 0);
        assert_eq!(report.pulled.total(), 0);

        let state = PeerStateStore::new(a.pool.clone())
            .get(b.identity.device_id)
            .await
            .unwrap();
        assert!(state.last_pull_at.is_some());
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_revoked_device_cannot_exchange() {
        let (a, b) = paired_nodes().await;
        TrustStore::new(b.pool.clone())
            .revoke(a.identity.device_id)
            .await
            .unwrap();
        EntityStore::new(a.pool.clone())
            .upsert(&Member::new(a.identity.device_id, "M-101", "Alan", "Turing"))
            .await
            .unwrap();

        let outcome = a.exchange().exchange(&b.as_peer()).await;
        assert!(matches!(
            outcome,
            PeerOutcome::Failed {
                error: SyncError::Unauthorized(_),
                ..
            }
        ));

        let members: Vec<Member> = EntityStore::new(b.pool.clone()).list().await.unwrap();
        assert!(members.is_empty());
        let state = PeerStateStore::new(a.pool.clone())
            .get(b.identity.device_id)
            .await
            .unwrap();
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_wrong_device_at_address_is_rejected() {
        let (a, b) = paired_nodes().await;
        let impostor = Peer {
            id: Uuid::new_v4(),
            address: b.url.clone(),
        };
        let outcome = a.exchange().exchange(&impostor).await;
        assert!(matches!(
            outcome,
            PeerOutcome::Failed {
                error: SyncError::Validation(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_double_checkout_reported_once_per_exchange() {
        let (a, b) = paired_nodes().await;
        let item = Uuid::new_v4();
        let on_a = EquipmentCheckout::new(a.identity.device_id, item, Uuid::new_v4());
        let on_b = EquipmentCheckout::new(b.identity.device_id, item, Uuid::new_v4());
        EntityStore::new(a.pool.clone()).upsert(&on_a).await.unwrap();
        EntityStore::new(b.pool.clone()).upsert(&on_b).await.unwrap();

        let outcome = a.exchange().exchange(&b.as_peer()).await;
        let PeerOutcome::Synced { report, .. } = outcome else {
            panic!("exchange failed: {:?}", outcome);
        };

        // Push flags the clash on b, pull sees it again on a.
        assert_eq!(report.conflicts.len(), 1);
        let conflicts = ConflictStore::new(a.pool.clone());
        assert_eq!(conflicts.list(None).await.unwrap().len(), 1);
        let stored = conflicts.get(report.conflicts[0].id).await.unwrap();
        assert!(stored.is_some());
        assert!(stored.unwrap().involves(on_a.sync.id));

        // The flagged checkout is still waiting to be pushed.
        let outbox = EntityStore::new(a.pool.clone()).query_unsynced().await.unwrap();
        assert!(outbox
            .equipment_checkouts
            .iter()
            .any(|c| c.sync.id == on_a.sync.id));
    }

    #[tokio::test]
    async fn test_incompatible_peer_is_reported_before_trust_exchange() {
        let network = Uuid::new_v4();
        let a = node(network, "Front desk", DeviceType::AdminTablet).await;
        let peer_id = Uuid::new_v4();
        let trust_called = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let called = trust_called.clone();
        let app = axum::Router::new()
            .route(
                "/api/sync/status",
                axum::routing::get(move || async move {
                    axum::Json(StatusResponse {
                        schema_version: SchemaVersion::new(2, 0, 0),
                        device_id: peer_id,
                        device_type: DeviceType::Laptop,
                        now: Utc::now(),
                        network_id: Some(network),
                    })
                }),
            )
            .route(
                "/api/sync/trust",
                axum::routing::post(move || async move {
                    called.store(true, std::sync::atomic::Ordering::SeqCst);
                    axum::http::StatusCode::BAD_REQUEST
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let outcome = a
            .exchange()
            .exchange(&Peer {
                id: peer_id,
                address: url,
            })
            .await;
        let PeerOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure: {:?}", outcome);
        };
        assert!(matches!(error, SyncError::SchemaIncompatible { .. }));
        assert!(!error.is_retryable());
        assert!(!trust_called.load(std::sync::atomic::Ordering::SeqCst));

        let state = PeerStateStore::new(a.pool.clone()).get(peer_id).await.unwrap();
        assert_eq!(state.incompatible_schema, Some(SchemaVersion::new(2, 0, 0)));
    }

    #[tokio::test]
    async fn test_records_rejected_by_peer_stay_in_outbox() {
        let (a, b) = paired_nodes().await;
        let entities = EntityStore::new(a.pool.clone());
        let good = Member::new(a.identity.device_id, "M-200", "Grace", "Hopper");
        let bad = Member::new(a.identity.device_id, "M-201", "Bad", "Version");
        entities.upsert(&good).await.unwrap();
        entities.upsert(&bad).await.unwrap();
        // A version the peer refuses to apply.
        sqlx::query(
            "UPDATE entities SET sync_version = 0, data = json_set(data, '$.syncVersion', 0) WHERE id = ?",
        )
        .bind(bad.sync.id.to_string())
        .execute(&a.pool)
        .await
        .unwrap();

        let outcome = a.exchange().exchange(&b.as_peer()).await;
        let PeerOutcome::Synced { report, .. } = outcome else {
            panic!("exchange failed: {:?}", outcome);
        };
        assert_eq!(report.pushed.members, 1);

        let outbox = entities.query_unsynced().await.unwrap();
        assert_eq!(outbox.members.len(), 1);
        assert_eq!(outbox.members[0].sync.id, bad.sync.id);
    }
}
