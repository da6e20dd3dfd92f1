use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use clubsync_core::{
    PairRequest, PushResponse, SchemaVersion, StatusResponse, SyncPayload, TrustListRequest,
    TrustListResponse, SCHEMA_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{auth::AuthDevice, error::ApiError, AppState};
use crate::db::TrustStore;
use crate::sync::{Applier, ChangeCollector};

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        schema_version: SCHEMA_VERSION,
        device_id: state.identity.device_id,
        device_type: state.identity.device_type,
        now: Utc::now(),
        network_id: Some(state.identity.network_id),
    })
}

/// Applies a peer's batch. Responds 409 when anything was flagged.
pub async fn push(
    State(state): State<AppState>,
    Extension(AuthDevice(caller)): Extension<AuthDevice>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw: serde_json::Value = parse_json(&body)?;

    // Gate on the schema before the body is interpreted, so an incompatible
    // peer gets 426 even if its entity shapes have changed.
    let remote: SchemaVersion = raw
        .get("schemaVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::BadRequest("Missing schemaVersion".into()))?
        .parse()?;
    SCHEMA_VERSION.ensure_compatible(&remote)?;

    let payload: SyncPayload = serde_json::from_value(raw)
        .map_err(|e| ApiError::BadRequest(format!("Malformed payload: {}", e)))?;
    if payload.device_id != caller.id {
        return Err(ApiError::Unauthorized(
            "Payload device does not match credentials".into(),
        ));
    }

    let report = Applier::new(state.pool.clone(), state.policy.clone())
        .apply_batch(&payload.entities, caller.id)
        .await;
    tracing::info!(
        peer_id = %caller.id,
        received = payload.entities.len(),
        accepted = report.accepted.total(),
        skipped = report.skipped,
        rejected = report.rejected,
        conflicts = report.conflicts.len(),
        "Applied pushed changes"
    );

    let status = if report.conflicts.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(PushResponse::from(report))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    since: Option<String>,
}

pub async fn pull(
    State(state): State<AppState>,
    Extension(AuthDevice(caller)): Extension<AuthDevice>,
    Query(query): Query<PullQuery>,
) -> Result<Json<SyncPayload>, ApiError> {
    let since = query
        .since
        .as_deref()
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| ApiError::BadRequest(format!("Invalid since timestamp '{}'", s)))
        })
        .transpose()?;

    // Taken before the query so a write racing with it is sent next time.
    let timestamp = Utc::now();
    let batch = ChangeCollector::new(state.pool.clone())
        .collect_since(since)
        .await?;
    tracing::debug!(peer_id = %caller.id, records = batch.len(), "Serving pull");

    Ok(Json(ChangeCollector::payload(&state.identity, batch, timestamp)))
}

pub async fn pair(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: PairRequest = parse_json(&body)?;
    let response = state.pairing.accept_pairing(&request, Utc::now()).await?;

    // Existing peers learn about the new device in the background.
    let pairing = state.pairing.clone();
    tokio::spawn(async move {
        match pairing.propagate_trust().await {
            Ok(reached) => tracing::info!(reached, "Propagated trust list after pairing"),
            Err(e) => tracing::warn!(error = %e, "Trust propagation after pairing failed"),
        }
    });

    Ok(Json(response).into_response())
}

pub async fn trust(
    State(state): State<AppState>,
    Extension(AuthDevice(caller)): Extension<AuthDevice>,
    body: Bytes,
) -> Result<Json<TrustListResponse>, ApiError> {
    let request: TrustListRequest = parse_json(&body)?;
    let store = TrustStore::new(state.pool.clone());
    let merged = store.merge(&request.devices).await?;
    if merged > 0 {
        tracing::info!(peer_id = %caller.id, merged, "Merged trust list from peer");
    }

    Ok(Json(TrustListResponse {
        merged,
        devices: store.list().await?,
    }))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Malformed body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::*;
    use crate::db::{test_pool, EntityStore, Identity};
    use crate::pairing::{generate_token, PairingService};
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use chrono::Duration as ChronoDuration;
    use clubsync_core::{
        hash_token, AuthorityPolicy, DeviceType, EntityBatch, EquipmentCheckout, ErrorBody,
        Member, PairResponse, PairingOffer, TrustedDevice,
    };
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct Harness {
        _dir: tempfile::TempDir,
        pool: SqlitePool,
        app: Router,
        identity: Identity,
        peer: TrustedDevice,
        peer_token: String,
    }

    async fn harness() -> Harness {
        let (dir, pool) = test_pool().await;
        let pairing = PairingService::new(pool.clone(), Duration::from_millis(200));
        let identity = pairing
            .init_network("Front desk", DeviceType::AdminTablet, None)
            .await
            .unwrap();

        let peer_token = generate_token();
        let peer = TrustedDevice {
            id: Uuid::new_v4(),
            display_name: "Kiosk".to_string(),
            device_type: DeviceType::MemberTablet,
            paired_at: Utc::now(),
            last_seen: None,
            is_trusted: true,
            token_hash: hash_token(&peer_token),
            address: None,
        };
        TrustStore::new(pool.clone())
            .upsert_device(&peer)
            .await
            .unwrap();

        let app = router(AppState {
            pool: pool.clone(),
            identity: Arc::new(identity.clone()),
            policy: AuthorityPolicy::default(),
            pairing,
        });

        Harness {
            _dir: dir,
            pool,
            app,
            identity,
            peer,
            peer_token,
        }
    }

    fn payload(
        device_id: Uuid,
        schema_version: SchemaVersion,
        entities: EntityBatch,
    ) -> SyncPayload {
        SyncPayload {
            schema_version,
            device_id,
            device_type: DeviceType::MemberTablet,
            timestamp: Utc::now(),
            entities,
        }
    }

    fn push_request(token: Option<&str>, body: &SyncPayload) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/sync/push")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn one_member(device: Uuid) -> EntityBatch {
        EntityBatch {
            members: vec![Member::new(device, "M-001", "Ada", "Lovelace")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_status_is_public() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::builder()
                    .uri("/api/sync/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let status: StatusResponse = body_json(response).await;
        assert_eq!(status.device_id, h.identity.device_id);
        assert_eq!(status.schema_version, SCHEMA_VERSION);
        assert_eq!(status.network_id, Some(h.identity.network_id));
    }

    #[tokio::test]
    async fn test_push_requires_auth() {
        let h = harness().await;
        let body = payload(h.peer.id, SCHEMA_VERSION, one_member(h.peer.id));
        let response = h.app.oneshot(push_request(None, &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let error: ErrorBody = body_json(response).await;
        assert_eq!(error.error, "unauthorized");
    }

    #[tokio::test]
    async fn test_push_accepts_trusted_peer() {
        let h = harness().await;
        let body = payload(h.peer.id, SCHEMA_VERSION, one_member(h.peer.id));
        let response = h
            .app
            .oneshot(push_request(Some(&h.peer_token), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let result: PushResponse = body_json(response).await;
        assert_eq!(result.accepted_counts.members, 1);
        assert!(result.conflicts.is_empty());

        let seen = TrustStore::new(h.pool).get(h.peer.id).await.unwrap().unwrap();
        assert!(seen.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_revoked_peer_is_rejected_before_apply() {
        let h = harness().await;
        TrustStore::new(h.pool.clone()).revoke(h.peer.id).await.unwrap();

        let body = payload(h.peer.id, SCHEMA_VERSION, one_member(h.peer.id));
        let response = h
            .app
            .oneshot(push_request(Some(&h.peer_token), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let members: Vec<Member> = EntityStore::new(h.pool).list().await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_schema_gets_426_and_applies_nothing() {
        let h = harness().await;
        let body = payload(h.peer.id, SchemaVersion::new(2, 0, 0), one_member(h.peer.id));
        let response = h
            .app
            .oneshot(push_request(Some(&h.peer_token), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let error: ErrorBody = body_json(response).await;
        assert_eq!(error.error, "schema_incompatible");
        assert_eq!(error.schema_version, Some(SCHEMA_VERSION));

        let members: Vec<Member> = EntityStore::new(h.pool).list().await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_push_as_another_device_is_rejected() {
        let h = harness().await;
        let body = payload(Uuid::new_v4(), SCHEMA_VERSION, one_member(h.peer.id));
        let response = h
            .app
            .oneshot(push_request(Some(&h.peer_token), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_push_is_400() {
        let h = harness().await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/sync/push")
            .header(header::AUTHORIZATION, format!("Bearer {}", h.peer_token))
            .body(Body::from("{\"schemaVersion\": \"1.0.0\", \"entities\": 7}"))
            .unwrap();

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_double_checkout_push_is_409() {
        let h = harness().await;
        let item = Uuid::new_v4();
        let local = EquipmentCheckout::new(h.identity.device_id, item, Uuid::new_v4());
        EntityStore::new(h.pool.clone()).upsert(&local).await.unwrap();

        let incoming = EquipmentCheckout::new(h.peer.id, item, Uuid::new_v4());
        let body = payload(
            h.peer.id,
            SCHEMA_VERSION,
            EntityBatch {
                equipment_checkouts: vec![incoming.clone()],
                ..Default::default()
            },
        );
        let response = h
            .app
            .oneshot(push_request(Some(&h.peer_token), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let result: PushResponse = body_json(response).await;
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].local_entity_id, local.sync.id);
        assert_eq!(result.conflicts[0].remote_entity_id, incoming.sync.id);
    }

    #[tokio::test]
    async fn test_pull_returns_local_changes() {
        let h = harness().await;
        let member = Member::new(h.identity.device_id, "M-002", "Grace", "Hopper");
        EntityStore::new(h.pool.clone()).upsert(&member).await.unwrap();

        let request = Request::builder()
            .uri("/api/sync/pull")
            .header(header::AUTHORIZATION, format!("Bearer {}", h.peer_token))
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let pulled: SyncPayload = body_json(response).await;
        assert_eq!(pulled.device_id, h.identity.device_id);
        assert_eq!(pulled.entities.members.len(), 1);
        assert_eq!(pulled.entities.members[0].sync.id, member.sync.id);

        // Nothing changed after the first pull's timestamp.
        let since = urlencoding::encode(&pulled.timestamp.to_rfc3339()).into_owned();
        let request = Request::builder()
            .uri(format!("/api/sync/pull?since={}", since))
            .header(header::AUTHORIZATION, format!("Bearer {}", h.peer_token))
            .body(Body::empty())
            .unwrap();
        let response = h.app.oneshot(request).await.unwrap();
        let pulled: SyncPayload = body_json(response).await;
        assert!(pulled.entities.is_empty());
    }

    #[tokio::test]
    async fn test_pull_with_invalid_since_is_400() {
        let h = harness().await;
        let request = Request::builder()
            .uri("/api/sync/pull?since=yesterday")
            .header(header::AUTHORIZATION, format!("Bearer {}", h.peer_token))
            .body(Body::empty())
            .unwrap();
        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn pair_request(offer: PairingOffer) -> Request<Body> {
        let body = PairRequest {
            offer,
            address: Some("http://10.0.0.7:47801".into()),
        };
        Request::builder()
            .method("POST")
            .uri("/api/pair")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_pair_redeems_offer() {
        let h = harness().await;
        let pairing = PairingService::new(h.pool.clone(), Duration::from_millis(200));
        let offer = pairing
            .issue_pairing(DeviceType::Laptop, "Coach laptop", "http://10.0.0.1:47801", Utc::now())
            .await
            .unwrap();

        let response = h.app.oneshot(pair_request(offer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let paired: PairResponse = body_json(response).await;
        assert_eq!(paired.network_id, h.identity.network_id);
        assert_eq!(paired.trusted_device_list.len(), 3);

        let stored = TrustStore::new(h.pool)
            .get(paired.device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.address.as_deref(), Some("http://10.0.0.7:47801"));
    }

    #[tokio::test]
    async fn test_pair_with_expired_offer_is_410() {
        let h = harness().await;
        let pairing = PairingService::new(h.pool.clone(), Duration::from_millis(200));
        let offer = pairing
            .issue_pairing(
                DeviceType::Laptop,
                "Coach laptop",
                "http://10.0.0.1:47801",
                Utc::now() - ChronoDuration::minutes(6),
            )
            .await
            .unwrap();

        let response = h.app.oneshot(pair_request(offer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        let error: ErrorBody = body_json(response).await;
        assert_eq!(error.error, "pairing_expired");
    }

    #[tokio::test]
    async fn test_pair_with_unknown_token_is_401() {
        let h = harness().await;
        let offer = PairingOffer::new("guess", h.identity.network_id, "http://x", Utc::now());
        let response = h.app.oneshot(pair_request(offer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_trust_exchange_merges_revocation() {
        let h = harness().await;
        let mut revoked = h.peer.clone();
        revoked.is_trusted = false;
        let other_token = generate_token();
        let other = TrustedDevice {
            id: Uuid::new_v4(),
            display_name: "Scoreboard".to_string(),
            device_type: DeviceType::DisplayScoreboard,
            paired_at: Utc::now(),
            last_seen: None,
            is_trusted: true,
            token_hash: hash_token(&other_token),
            address: None,
        };
        // The new entry authenticates; it revokes the original peer.
        TrustStore::new(h.pool.clone()).upsert_device(&other).await.unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/sync/trust")
            .header(header::AUTHORIZATION, format!("Bearer {}", other_token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_vec(&TrustListRequest {
                    devices: vec![revoked],
                })
                .unwrap(),
            ))
            .unwrap();
        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let merged: TrustListResponse = body_json(response).await;
        assert_eq!(merged.merged, 1);
        assert_eq!(merged.devices.len(), 3);

        let peer = TrustStore::new(h.pool).get(h.peer.id).await.unwrap().unwrap();
        assert!(!peer.is_trusted);
    }
}
