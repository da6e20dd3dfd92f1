macro_rules! impl_sync_entity {
    ($ty:ty, $kind:expr) => {
        impl $crate::models::SyncEntity for $ty {
            const KIND: $crate::models::EntityKind = $kind;

            fn envelope(&self) -> &$crate::models::SyncEnvelope {
                &self.sync
            }

            fn envelope_mut(&mut self) -> &mut $crate::models::SyncEnvelope {
                &mut self.sync
            }
        }
    };
}

mod attendance;
mod conflict;
mod device;
mod envelope;
mod equipment;
mod member;

pub use attendance::{CheckIn, PracticeSession, ScanEvent, ScanOutcome};
pub use conflict::{ConflictState, Resolution, SyncConflict};
pub use device::{AuthorityPolicy, DeviceType, TrustedDevice};
pub use envelope::{superseding_time, SyncEnvelope};
pub use equipment::{CheckoutConflictStatus, EquipmentCheckout, EquipmentItem, EquipmentStatus};
pub use member::{Member, MemberStatus, NewMemberRegistration, RegistrationStatus};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Every replicated entity kind, in the order batches are applied.
///
/// Members and equipment items come first so that event records referencing
/// them land after their targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Member,
    NewMemberRegistration,
    EquipmentItem,
    CheckIn,
    PracticeSession,
    ScanEvent,
    EquipmentCheckout,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Member,
        EntityKind::NewMemberRegistration,
        EntityKind::EquipmentItem,
        EntityKind::CheckIn,
        EntityKind::PracticeSession,
        EntityKind::ScanEvent,
        EntityKind::EquipmentCheckout,
    ];

    /// Storage and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Member => "member",
            EntityKind::NewMemberRegistration => "newMemberRegistration",
            EntityKind::EquipmentItem => "equipmentItem",
            EntityKind::CheckIn => "checkIn",
            EntityKind::PracticeSession => "practiceSession",
            EntityKind::ScanEvent => "scanEvent",
            EntityKind::EquipmentCheckout => "equipmentCheckout",
        }
    }

    /// Append-only event facts: never overwritten once stored.
    pub fn is_append_only(&self) -> bool {
        matches!(
            self,
            EntityKind::CheckIn | EntityKind::PracticeSession | EntityKind::ScanEvent
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown entity kind '{}'", s))
    }
}

/// A record that travels between peers inside a [`SyncEnvelope`].
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn envelope(&self) -> &SyncEnvelope;

    fn envelope_mut(&mut self) -> &mut SyncEnvelope;

    fn id(&self) -> Uuid {
        self.envelope().id
    }
}
