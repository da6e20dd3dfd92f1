//! clubsync core library
//!
//! Shared types and pure logic for clubsync nodes: the replicated data model,
//! the wire contract spoken between peers, the schema version gate and the
//! per-entity conflict policy. Nothing in this crate performs I/O.

pub mod conflict;
pub mod error;
pub mod models;
pub mod pairing;
pub mod payload;
pub mod schema;

pub use conflict::{ConflictFlag, Decision, SkipReason};
pub use error::SyncError;
pub use models::{
    superseding_time, AuthorityPolicy, CheckIn, CheckoutConflictStatus, ConflictState,
    DeviceType, EntityKind, EquipmentCheckout, EquipmentItem, EquipmentStatus, Member,
    MemberStatus, NewMemberRegistration, PracticeSession, RegistrationStatus, Resolution,
    ScanEvent, ScanOutcome, SyncConflict, SyncEntity, SyncEnvelope, TrustedDevice,
};
pub use pairing::{hash_token, PairingOffer, PAIRING_TTL_SECS};
pub use payload::{
    EntityBatch, EntityCounts, EntityRef, ErrorBody, PairRequest, PairResponse, PushResponse,
    StatusResponse, SyncPayload, TrustListRequest, TrustListResponse,
};
pub use schema::{SchemaVersion, SCHEMA_VERSION};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
