//! Network bootstrap, pairing ceremony and trust propagation.
//!
//! The issuing device persists only the hash of an offer's token, so a
//! separately running `serve` process can redeem offers issued from the CLI.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use clubsync_core::{
    hash_token, DeviceType, PairRequest, PairResponse, PairingOffer, SyncError, TrustedDevice,
};
use rand::Rng;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::{Identity, PendingPairing, TrustStore};
use crate::error::Error;
use crate::sync::SyncClient;

/// Generates a cryptographically random token (32 bytes, base64url).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct PairingService {
    pool: SqlitePool,
    request_timeout: Duration,
}

impl PairingService {
    pub fn new(pool: SqlitePool, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    fn trust(&self) -> TrustStore {
        TrustStore::new(self.pool.clone())
    }

    /// Creates a new network with this device as its first member.
    pub async fn init_network(
        &self,
        display_name: &str,
        device_type: DeviceType,
        address: Option<String>,
    ) -> Result<Identity, Error> {
        let trust = self.trust();
        if let Some(existing) = trust.identity().await? {
            return Err(Error::AlreadyInitialized(existing.network_id));
        }

        let now = Utc::now();
        let identity = Identity {
            device_id: Uuid::new_v4(),
            network_id: Uuid::new_v4(),
            display_name: display_name.to_string(),
            device_type,
            trust_token: generate_token(),
        };
        trust.save_identity(&identity).await?;
        trust
            .upsert_device(&TrustedDevice {
                id: identity.device_id,
                display_name: identity.display_name.clone(),
                device_type,
                paired_at: now,
                last_seen: Some(now),
                is_trusted: true,
                token_hash: hash_token(&identity.trust_token),
                address,
            })
            .await?;

        tracing::info!(
            device_id = %identity.device_id,
            network_id = %identity.network_id,
            "Created network"
        );
        Ok(identity)
    }

    /// Issues a single-use offer for a device of `device_type`, valid for five
    /// minutes. `endpoint` is where the joining device will reach us.
    pub async fn issue_pairing(
        &self,
        device_type: DeviceType,
        display_name: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingOffer, Error> {
        let trust = self.trust();
        let identity = trust.require_identity().await?;
        trust.purge_expired_pending(now).await?;

        let offer = PairingOffer::new(generate_token(), identity.network_id, endpoint, now);
        trust
            .save_pending(&PendingPairing {
                token_hash: hash_token(&offer.token),
                display_name: display_name.to_string(),
                device_type,
                issued_at: now,
                expires_at: offer.expires_at,
            })
            .await?;

        tracing::info!(
            %device_type,
            name = display_name,
            expires_at = %offer.expires_at,
            "Issued pairing offer"
        );
        Ok(offer)
    }

    /// Issuer side of the ceremony: consumes the offer and admits a new
    /// device under the name and type recorded when the offer was issued.
    pub async fn accept_pairing(
        &self,
        request: &PairRequest,
        now: DateTime<Utc>,
    ) -> Result<PairResponse, Error> {
        let trust = self.trust();
        let identity = trust.require_identity().await?;

        if request.offer.network_id != identity.network_id {
            return Err(
                SyncError::Unauthorized("pairing offer is for another network".into()).into(),
            );
        }

        let pending = trust
            .take_pending(&hash_token(&request.offer.token))
            .await?
            .ok_or_else(|| SyncError::Unauthorized("unknown pairing token".into()))?;
        if now > pending.expires_at {
            return Err(SyncError::PairingExpired(pending.expires_at).into());
        }

        let trust_token = generate_token();
        let device = TrustedDevice {
            id: Uuid::new_v4(),
            display_name: pending.display_name,
            device_type: pending.device_type,
            paired_at: now,
            last_seen: Some(now),
            is_trusted: true,
            token_hash: hash_token(&trust_token),
            address: request.address.clone(),
        };
        trust.upsert_device(&device).await?;

        tracing::info!(device_id = %device.id, name = %device.display_name, "Paired new device");
        Ok(PairResponse {
            device_id: device.id,
            trust_token,
            network_id: identity.network_id,
            issuer_device_id: identity.device_id,
            trusted_device_list: trust.list().await?,
        })
    }

    /// Joiner side: redeems `offer` at the issuing device and adopts the
    /// returned identity and trust list.
    pub async fn redeem_pairing(
        &self,
        offer: &PairingOffer,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TrustedDevice, Error> {
        let trust = self.trust();
        if let Some(existing) = trust.identity().await? {
            return Err(Error::AlreadyInitialized(existing.network_id));
        }
        offer.ensure_valid_at(now)?;

        let client = SyncClient::new(&offer.endpoint, None, self.request_timeout)?;
        let response = client
            .pair(&PairRequest {
                offer: offer.clone(),
                address,
            })
            .await?;

        if response.network_id != offer.network_id {
            return Err(SyncError::Validation(format!(
                "issuer answered for network {}, offer was for {}",
                response.network_id, offer.network_id
            ))
            .into());
        }
        let me = response
            .trusted_device_list
            .iter()
            .find(|d| d.id == response.device_id)
            .cloned()
            .ok_or_else(|| SyncError::Validation("issuer did not list the new device".into()))?;

        trust.merge(&response.trusted_device_list).await?;
        trust
            .save_identity(&Identity {
                device_id: me.id,
                network_id: response.network_id,
                display_name: me.display_name.clone(),
                device_type: me.device_type,
                trust_token: response.trust_token,
            })
            .await?;
        trust
            .touch(response.issuer_device_id, now, Some(&offer.endpoint))
            .await?;

        tracing::info!(device_id = %me.id, network_id = %response.network_id, "Joined network");
        Ok(me)
    }

    /// Pushes our trust list to every trusted peer with a known address and
    /// merges what they send back. Returns how many peers were reached.
    pub async fn propagate_trust(&self) -> Result<usize, Error> {
        let trust = self.trust();
        let identity = trust.require_identity().await?;
        let mut reached = 0;

        for peer in trust.peers(identity.device_id).await? {
            let Some(address) = peer.address.as_deref() else {
                continue;
            };
            let client = SyncClient::new(
                address,
                Some(identity.trust_token.clone()),
                self.request_timeout,
            )?;
            match client.push_trust(trust.list().await?).await {
                Ok(response) => {
                    trust.merge(&response.devices).await?;
                    reached += 1;
                }
                Err(e) => {
                    tracing::warn!(peer_id = %peer.id, error = %e, "Trust propagation failed");
                }
            }
        }

        Ok(reached)
    }

    /// Revokes a device locally and tells every reachable peer.
    pub async fn revoke(&self, device_id: Uuid) -> Result<usize, Error> {
        let trust = self.trust();
        let identity = trust.require_identity().await?;
        if device_id == identity.device_id {
            return Err(SyncError::Validation("a device cannot revoke itself".into()).into());
        }
        if !trust.revoke(device_id).await? {
            return Err(SyncError::Validation(format!("unknown device {}", device_id)).into());
        }
        tracing::info!(%device_id, "Revoked device");
        self.propagate_trust().await
    }
}
