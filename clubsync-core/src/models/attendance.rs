//! Append-only attendance and performance facts.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntityKind, SyncEnvelope};

/// A member's attendance on one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckIn {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub member_id: Uuid,
    /// Calendar date on the device that recorded the check-in.
    pub local_date: NaiveDate,
    pub checked_in_at_utc: DateTime<Utc>,
    /// Soft link to the scan that produced this check-in.
    #[serde(default)]
    pub scan_event_id: Option<Uuid>,
}

impl_sync_entity!(CheckIn, EntityKind::CheckIn);

impl CheckIn {
    pub fn new(device_id: Uuid, member_id: Uuid, local_date: NaiveDate) -> Self {
        let sync = SyncEnvelope::new(device_id);
        Self {
            checked_in_at_utc: sync.created_at_utc,
            sync,
            member_id,
            local_date,
            scan_event_id: None,
        }
    }
}

/// One practice result. Several per member and day are normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeSession {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub member_id: Uuid,
    pub local_date: NaiveDate,
    pub practice_type: String,
    pub score: i32,
    pub recorded_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub check_in_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl_sync_entity!(PracticeSession, EntityKind::PracticeSession);

impl PracticeSession {
    pub fn new(
        device_id: Uuid,
        member_id: Uuid,
        local_date: NaiveDate,
        practice_type: impl Into<String>,
        score: i32,
    ) -> Self {
        let sync = SyncEnvelope::new(device_id);
        Self {
            recorded_at_utc: sync.created_at_utc,
            sync,
            member_id,
            local_date,
            practice_type: practice_type.into(),
            score,
            check_in_id: None,
            notes: None,
        }
    }

    /// Same member, date, type, score and timestamp: the same real-world
    /// session recorded twice.
    pub fn is_duplicate_of(&self, other: &PracticeSession) -> bool {
        self.member_id == other.member_id
            && self.local_date == other.local_date
            && self.practice_type == other.practice_type
            && self.score == other.score
            && self.recorded_at_utc == other.recorded_at_utc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanOutcome {
    CheckedIn,
    AlreadyCheckedIn,
    UnknownMember,
    Rejected,
}

/// Raw record of a code scanned at a kiosk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub raw_code: String,
    #[serde(default)]
    pub member_id: Option<Uuid>,
    pub scanned_at_utc: DateTime<Utc>,
    pub outcome: ScanOutcome,
}

impl_sync_entity!(ScanEvent, EntityKind::ScanEvent);

impl ScanEvent {
    pub fn new(device_id: Uuid, raw_code: impl Into<String>, outcome: ScanOutcome) -> Self {
        let sync = SyncEnvelope::new(device_id);
        Self {
            scanned_at_utc: sync.created_at_utc,
            sync,
            raw_code: raw_code.into(),
            member_id: None,
            outcome,
        }
    }
}
