use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityKind, SyncEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipmentStatus {
    #[default]
    Available,
    CheckedOut,
    Maintenance,
    Retired,
}

impl fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EquipmentStatus::Available => write!(f, "available"),
            EquipmentStatus::CheckedOut => write!(f, "checked-out"),
            EquipmentStatus::Maintenance => write!(f, "maintenance"),
            EquipmentStatus::Retired => write!(f, "retired"),
        }
    }
}

impl FromStr for EquipmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "available" => Ok(EquipmentStatus::Available),
            "checked-out" | "checkedout" => Ok(EquipmentStatus::CheckedOut),
            "maintenance" => Ok(EquipmentStatus::Maintenance),
            "retired" => Ok(EquipmentStatus::Retired),
            _ => Err(format!(
                "Invalid equipment status '{}'. Valid options: available, checked-out, maintenance, retired",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentItem {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub status: EquipmentStatus,
}

impl_sync_entity!(EquipmentItem, EntityKind::EquipmentItem);

impl EquipmentItem {
    pub fn new(device_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            sync: SyncEnvelope::new(device_id),
            name: name.into(),
            category: None,
            serial_number: None,
            status: EquipmentStatus::Available,
        }
    }
}

/// Conflict marker on a checkout. `Pending` blocks automatic resolution until
/// an operator decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutConflictStatus {
    #[default]
    None,
    Pending,
    Resolved,
}

/// Loan of one equipment item to one member for an open interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentCheckout {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub equipment_id: Uuid,
    pub member_id: Uuid,
    pub checked_out_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub checked_in_at_utc: Option<DateTime<Utc>>,
    /// Set when an operator cancels this checkout while resolving a conflict.
    #[serde(default)]
    pub cancelled_at_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub conflict_status: CheckoutConflictStatus,
}

impl_sync_entity!(EquipmentCheckout, EntityKind::EquipmentCheckout);

impl EquipmentCheckout {
    pub fn new(device_id: Uuid, equipment_id: Uuid, member_id: Uuid) -> Self {
        let sync = SyncEnvelope::new(device_id);
        Self {
            checked_out_at_utc: sync.created_at_utc,
            sync,
            equipment_id,
            member_id,
            checked_in_at_utc: None,
            cancelled_at_utc: None,
            notes: None,
            conflict_status: CheckoutConflictStatus::None,
        }
    }

    /// Neither returned nor cancelled.
    pub fn is_open(&self) -> bool {
        self.checked_in_at_utc.is_none() && self.cancelled_at_utc.is_none()
    }
}
