use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::EntityKind;

/// Lifecycle: `Pending → Resolved → Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictState {
    Pending,
    Resolved,
    Synced,
}

impl ConflictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictState::Pending => "PENDING",
            ConflictState::Resolved => "RESOLVED",
            ConflictState::Synced => "SYNCED",
        }
    }
}

impl fmt::Display for ConflictState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ConflictState::Pending),
            "RESOLVED" => Ok(ConflictState::Resolved),
            "SYNCED" => Ok(ConflictState::Synced),
            _ => Err(format!("Invalid conflict state '{}'", s)),
        }
    }
}

/// Operator decision for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Resolution {
    KeepLocal,
    AcceptRemote,
    /// Only legal for append-only kinds.
    KeepBoth,
    /// Only legal for equipment checkouts.
    #[serde(rename_all = "camelCase")]
    CancelCheckout { checkout_id: Uuid },
    /// Another device resolved it and the outcome arrived through sync.
    ResolvedByPeer,
}

impl Resolution {
    pub fn is_allowed_for(&self, kind: EntityKind) -> bool {
        match self {
            Resolution::KeepLocal | Resolution::AcceptRemote => true,
            Resolution::KeepBoth => kind.is_append_only(),
            Resolution::CancelCheckout { .. } => kind == EntityKind::EquipmentCheckout,
            Resolution::ResolvedByPeer => false,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep-local"),
            Resolution::AcceptRemote => write!(f, "accept-remote"),
            Resolution::KeepBoth => write!(f, "keep-both"),
            Resolution::CancelCheckout { checkout_id } => write!(f, "cancel {}", checkout_id),
            Resolution::ResolvedByPeer => write!(f, "resolved-by-peer"),
        }
    }
}

/// A disagreement that needs a human. Never replicated itself; the entity
/// changes a resolution implies are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub local_entity_id: Uuid,
    pub remote_entity_id: Uuid,
    /// Device on the other side of the exchange that surfaced the conflict.
    pub remote_device_id: Uuid,
    pub detected_at_utc: DateTime<Utc>,
    pub description: String,
    pub state: ConflictState,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub resolved_at_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synced_at_utc: Option<DateTime<Utc>>,
}

impl SyncConflict {
    pub fn new(
        entity_kind: EntityKind,
        local_entity_id: Uuid,
        remote_entity_id: Uuid,
        remote_device_id: Uuid,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            local_entity_id,
            remote_entity_id,
            remote_device_id,
            detected_at_utc: Utc::now(),
            description: description.into(),
            state: ConflictState::Pending,
            resolution: None,
            resolved_at_utc: None,
            synced_at_utc: None,
        }
    }

    /// The same conflict as seen from the other device: local and remote
    /// swap, and the reporting device becomes the remote one.
    pub fn mirrored(&self, reporting_device: Uuid) -> Self {
        Self {
            id: self.id,
            entity_kind: self.entity_kind,
            local_entity_id: self.remote_entity_id,
            remote_entity_id: self.local_entity_id,
            remote_device_id: reporting_device,
            detected_at_utc: self.detected_at_utc,
            description: self.description.clone(),
            state: ConflictState::Pending,
            resolution: None,
            resolved_at_utc: None,
            synced_at_utc: None,
        }
    }

    /// Entity ids in a stable order, used to keep one conflict per pair.
    pub fn entity_pair(&self) -> (Uuid, Uuid) {
        if self.local_entity_id <= self.remote_entity_id {
            (self.local_entity_id, self.remote_entity_id)
        } else {
            (self.remote_entity_id, self.local_entity_id)
        }
    }

    pub fn involves(&self, entity_id: Uuid) -> bool {
        self.local_entity_id == entity_id || self.remote_entity_id == entity_id
    }
}
