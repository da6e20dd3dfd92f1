//! Wire contract spoken between peers. All bodies are camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    CheckIn, DeviceType, EntityKind, EquipmentCheckout, EquipmentItem, Member,
    NewMemberRegistration, PracticeSession, ScanEvent, SyncConflict, SyncEntity, TrustedDevice,
};
use crate::pairing::PairingOffer;
use crate::schema::SchemaVersion;

/// Changed records grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBatch {
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub new_member_registrations: Vec<NewMemberRegistration>,
    #[serde(default)]
    pub equipment_items: Vec<EquipmentItem>,
    #[serde(default)]
    pub check_ins: Vec<CheckIn>,
    #[serde(default)]
    pub practice_sessions: Vec<PracticeSession>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan_events: Vec<ScanEvent>,
    #[serde(default)]
    pub equipment_checkouts: Vec<EquipmentCheckout>,
}

/// Identifies one sent version of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
    pub sync_version: i64,
}

impl EntityRef {
    pub fn of<T: SyncEntity>(entity: &T) -> Self {
        Self {
            kind: T::KIND,
            id: entity.id(),
            sync_version: entity.envelope().sync_version,
        }
    }
}

impl EntityBatch {
    pub fn len(&self) -> usize {
        self.members.len()
            + self.new_member_registrations.len()
            + self.equipment_items.len()
            + self.check_ins.len()
            + self.practice_sessions.len()
            + self.scan_events.len()
            + self.equipment_checkouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record in the batch, in apply order.
    pub fn refs(&self) -> Vec<EntityRef> {
        let mut refs = Vec::with_capacity(self.len());
        refs.extend(self.members.iter().map(EntityRef::of));
        refs.extend(self.new_member_registrations.iter().map(EntityRef::of));
        refs.extend(self.equipment_items.iter().map(EntityRef::of));
        refs.extend(self.check_ins.iter().map(EntityRef::of));
        refs.extend(self.practice_sessions.iter().map(EntityRef::of));
        refs.extend(self.scan_events.iter().map(EntityRef::of));
        refs.extend(self.equipment_checkouts.iter().map(EntityRef::of));
        refs
    }

    pub fn counts(&self) -> EntityCounts {
        let mut counts = EntityCounts::default();
        for r in self.refs() {
            counts.add(r.kind, 1);
        }
        counts
    }
}

/// Per-kind record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCounts {
    #[serde(default)]
    pub members: usize,
    #[serde(default)]
    pub new_member_registrations: usize,
    #[serde(default)]
    pub equipment_items: usize,
    #[serde(default)]
    pub check_ins: usize,
    #[serde(default)]
    pub practice_sessions: usize,
    #[serde(default)]
    pub scan_events: usize,
    #[serde(default)]
    pub equipment_checkouts: usize,
}

impl EntityCounts {
    pub fn add(&mut self, kind: EntityKind, n: usize) {
        let slot = match kind {
            EntityKind::Member => &mut self.members,
            EntityKind::NewMemberRegistration => &mut self.new_member_registrations,
            EntityKind::EquipmentItem => &mut self.equipment_items,
            EntityKind::CheckIn => &mut self.check_ins,
            EntityKind::PracticeSession => &mut self.practice_sessions,
            EntityKind::ScanEvent => &mut self.scan_events,
            EntityKind::EquipmentCheckout => &mut self.equipment_checkouts,
        };
        *slot += n;
    }

    pub fn get(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Member => self.members,
            EntityKind::NewMemberRegistration => self.new_member_registrations,
            EntityKind::EquipmentItem => self.equipment_items,
            EntityKind::CheckIn => self.check_ins,
            EntityKind::PracticeSession => self.practice_sessions,
            EntityKind::ScanEvent => self.scan_events,
            EntityKind::EquipmentCheckout => self.equipment_checkouts,
        }
    }

    pub fn merge(&mut self, other: &EntityCounts) {
        for kind in EntityKind::ALL {
            self.add(kind, other.get(kind));
        }
    }

    pub fn total(&self) -> usize {
        EntityKind::ALL.into_iter().map(|k| self.get(k)).sum()
    }
}

/// Body of `POST /api/sync/push` and response of `GET /api/sync/pull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub schema_version: SchemaVersion,
    pub device_id: Uuid,
    pub device_type: DeviceType,
    /// Sender's clock when the payload was built. On pull responses this is
    /// the next `since` value.
    pub timestamp: DateTime<Utc>,
    pub entities: EntityBatch,
}

/// Result of applying a pushed batch. Sent with 200 when `conflicts` is
/// empty and with 409 otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub accepted_counts: EntityCounts,
    #[serde(default)]
    pub skipped: usize,
    #[serde(default)]
    pub rejected: usize,
    /// Ids of the rejected records. The sender keeps them in its outbox.
    #[serde(default)]
    pub rejected_ids: Vec<Uuid>,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub schema_version: SchemaVersion,
    pub device_id: Uuid,
    pub device_type: DeviceType,
    pub now: DateTime<Utc>,
    #[serde(default)]
    pub network_id: Option<Uuid>,
}

/// Body of `POST /api/pair`: the redeemed offer plus the joining device's
/// address. Name and type were fixed by the issuer when the offer was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    #[serde(flatten)]
    pub offer: PairingOffer,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    /// Id assigned to the joining device.
    pub device_id: Uuid,
    /// Bearer token the joining device presents from now on.
    pub trust_token: String,
    pub network_id: Uuid,
    pub issuer_device_id: Uuid,
    pub trusted_device_list: Vec<TrustedDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustListRequest {
    pub devices: Vec<TrustedDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustListResponse {
    /// Entries that were new or changed on the receiver.
    pub merged: usize,
    /// Receiver's trust list after the merge.
    pub devices: Vec<TrustedDevice>,
}

/// JSON error body returned by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    /// Responder's schema version, present on 426.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<SchemaVersion>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            schema_version: None,
        }
    }
}
