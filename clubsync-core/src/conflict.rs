//! Per-entity conflict policy.
//!
//! Every function here is pure: the caller looks up whatever local state the
//! rule needs and gets back a [`Decision`] for one incoming record. Applying
//! the decision (and recording a flagged conflict) is the caller's job.

use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::{
    AuthorityPolicy, CheckIn, DeviceType, EquipmentCheckout, PracticeSession, ScanEvent,
    SyncEnvelope,
};

/// Why an incoming record was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The exact same version is already stored.
    AlreadyApplied,
    /// The stored version wins last-write-wins ordering.
    LocalNewer,
    /// The stored member was last written by a higher-ranked device.
    Outranked,
    /// An append-only record with this id already exists.
    Exists,
    /// A different record already covers the same fact.
    Duplicate { existing: Uuid },
}

/// A true conflict that must be surfaced to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFlag {
    pub local_entity_id: Uuid,
    pub remote_entity_id: Uuid,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Skip(SkipReason),
    Flag(ConflictFlag),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

fn already_applied(local: &SyncEnvelope, incoming: &SyncEnvelope) -> bool {
    local.same_version(incoming)
}

/// Default policy for mutable records.
pub fn decide_last_write_wins(local: Option<&SyncEnvelope>, incoming: &SyncEnvelope) -> Decision {
    let Some(local) = local else {
        return Decision::Accept;
    };
    if already_applied(local, incoming) {
        return Decision::Skip(SkipReason::AlreadyApplied);
    }
    match incoming.lww_cmp(local) {
        Ordering::Greater => Decision::Accept,
        _ => Decision::Skip(SkipReason::LocalNewer),
    }
}

/// Members: the device type that last wrote each side decides first, then
/// last-write-wins among equals.
pub fn decide_member(
    local: Option<(&SyncEnvelope, Option<DeviceType>)>,
    incoming: &SyncEnvelope,
    incoming_type: Option<DeviceType>,
    policy: &AuthorityPolicy,
) -> Decision {
    let Some((local, local_type)) = local else {
        return Decision::Accept;
    };
    if already_applied(local, incoming) {
        return Decision::Skip(SkipReason::AlreadyApplied);
    }
    match policy.rank(incoming_type).cmp(&policy.rank(local_type)) {
        Ordering::Greater => Decision::Accept,
        Ordering::Less => Decision::Skip(SkipReason::Outranked),
        Ordering::Equal => decide_last_write_wins(Some(local), incoming),
    }
}

/// Check-ins are never overwritten. `same_day` is any stored check-in for
/// the same member and local date.
pub fn decide_check_in(
    incoming: &CheckIn,
    by_id: Option<&CheckIn>,
    same_day: Option<&CheckIn>,
) -> Decision {
    if let Some(existing) = by_id {
        if already_applied(&existing.sync, &incoming.sync) {
            return Decision::Skip(SkipReason::AlreadyApplied);
        }
        return Decision::Skip(SkipReason::Exists);
    }
    match same_day {
        Some(existing)
            if existing.member_id == incoming.member_id
                && existing.local_date == incoming.local_date =>
        {
            Decision::Skip(SkipReason::Duplicate {
                existing: existing.sync.id,
            })
        }
        _ => Decision::Accept,
    }
}

/// Practice sessions are only deduplicated when every identifying field
/// matches; several sessions per day are normal.
pub fn decide_practice_session(
    incoming: &PracticeSession,
    by_id: Option<&PracticeSession>,
    same_day: &[PracticeSession],
) -> Decision {
    if let Some(existing) = by_id {
        if already_applied(&existing.sync, &incoming.sync) {
            return Decision::Skip(SkipReason::AlreadyApplied);
        }
        return Decision::Skip(SkipReason::Exists);
    }
    match same_day.iter().find(|s| incoming.is_duplicate_of(s)) {
        Some(existing) => Decision::Skip(SkipReason::Duplicate {
            existing: existing.sync.id,
        }),
        None => Decision::Accept,
    }
}

pub fn decide_scan_event(incoming: &ScanEvent, by_id: Option<&ScanEvent>) -> Decision {
    match by_id {
        Some(existing) if already_applied(&existing.sync, &incoming.sync) => {
            Decision::Skip(SkipReason::AlreadyApplied)
        }
        Some(_) => Decision::Skip(SkipReason::Exists),
        None => Decision::Accept,
    }
}

/// Equipment checkouts.
///
/// Updates to a known checkout follow last-write-wins. A new open checkout
/// for an item that a different member already holds open is flagged.
/// `open_for_item` is every locally open checkout of the incoming item.
pub fn decide_checkout(
    incoming: &EquipmentCheckout,
    by_id: Option<&EquipmentCheckout>,
    open_for_item: &[EquipmentCheckout],
) -> Decision {
    if let Some(existing) = by_id {
        return decide_last_write_wins(Some(&existing.sync), &incoming.sync);
    }
    if !incoming.is_open() {
        return Decision::Accept;
    }

    let clash = open_for_item.iter().find(|c| {
        c.sync.id != incoming.sync.id
            && c.equipment_id == incoming.equipment_id
            && c.member_id != incoming.member_id
            && c.is_open()
    });

    match clash {
        Some(local) => Decision::Flag(ConflictFlag {
            local_entity_id: local.sync.id,
            remote_entity_id: incoming.sync.id,
            description: format!(
                "Equipment {} checked out to member {} on this device and to member {} on device {}",
                incoming.equipment_id, local.member_id, incoming.member_id, incoming.sync.device_id
            ),
        }),
        None => Decision::Accept,
    }
}
