//! Pairing offers and the pairing code that carries them.
//!
//! A pairing code is the CBOR encoding of the offer wrapped in bs58check, so
//! it survives being typed, pasted or rendered as a QR code and a single
//! mistyped character is caught by the checksum.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::SyncError;

/// Validity window of a freshly issued offer.
pub const PAIRING_TTL_SECS: i64 = 300;

/// A one-time invitation for a new device to join the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingOffer {
    pub token: String,
    pub network_id: Uuid,
    /// Base URL of the issuing device, e.g. `http://192.168.1.10:47801`.
    pub endpoint: String,
    pub expires_at: DateTime<Utc>,
}

/// Compact field names keep the code short.
#[derive(Serialize, Deserialize)]
struct CodePayload {
    t: String,
    n: [u8; 16],
    e: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    x: DateTime<Utc>,
}

impl PairingOffer {
    pub fn new(
        token: impl Into<String>,
        network_id: Uuid,
        endpoint: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token: token.into(),
            network_id,
            endpoint: endpoint.into(),
            expires_at: issued_at + Duration::seconds(PAIRING_TTL_SECS),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<(), SyncError> {
        if self.is_expired_at(now) {
            return Err(SyncError::PairingExpired(self.expires_at));
        }
        Ok(())
    }

    pub fn to_code(&self) -> Result<String, SyncError> {
        let payload = CodePayload {
            t: self.token.clone(),
            n: *self.network_id.as_bytes(),
            e: self.endpoint.clone(),
            x: self.expires_at,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&payload, &mut bytes)
            .map_err(|e| SyncError::Validation(format!("Failed to encode pairing code: {}", e)))?;
        Ok(bs58::encode(bytes).with_check().into_string())
    }

    pub fn from_code(code: &str) -> Result<Self, SyncError> {
        let bytes = bs58::decode(code.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| SyncError::Validation(format!("Invalid pairing code: {}", e)))?;
        let payload: CodePayload = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| SyncError::Validation(format!("Invalid pairing code: {}", e)))?;

        Ok(Self {
            token: payload.t,
            network_id: Uuid::from_bytes(payload.n),
            endpoint: payload.e,
            expires_at: payload.x,
        })
    }
}

/// SHA-256 of a bearer token, lowercase hex. Only hashes are stored or
/// shared with peers.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn offer() -> PairingOffer {
        let issued = Utc.with_ymd_and_hms(2026, 5, 1, 18, 30, 0).unwrap();
        PairingOffer::new(
            "tok_4f9a",
            Uuid::new_v4(),
            "http://192.168.1.10:47801",
            issued,
        )
    }

    #[test]
    fn test_offer_expires_after_five_minutes() {
        let offer = offer();
        let issued = offer.expires_at - Duration::seconds(PAIRING_TTL_SECS);

        assert!(!offer.is_expired_at(issued));
        assert!(!offer.is_expired_at(offer.expires_at));
        assert!(offer.is_expired_at(offer.expires_at + Duration::seconds(1)));
        assert_eq!(
            offer.ensure_valid_at(issued + Duration::minutes(6)),
            Err(SyncError::PairingExpired(offer.expires_at))
        );
    }

    #[test]
    fn test_pairing_code_carries_offer() {
        let offer = offer();
        let code = offer.to_code().unwrap();
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(PairingOffer::from_code(&code).unwrap(), offer);
    }

    #[test]
    fn test_corrupted_code_rejected() {
        let code = offer().to_code().unwrap();
        let mut chars: Vec<char> = code.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();

        assert!(matches!(
            PairingOffer::from_code(&corrupted),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
