//! Sync envelope carried by every replicated record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    /// Assigned at creation, never reused.
    pub id: Uuid,
    /// Device that created or last modified the record.
    pub device_id: Uuid,
    /// Incremented on every accepted mutation; never decreases.
    pub sync_version: i64,
    pub created_at_utc: DateTime<Utc>,
    pub modified_at_utc: DateTime<Utc>,
    /// Last time this exact version was exchanged with a peer.
    #[serde(default)]
    pub synced_at_utc: Option<DateTime<Utc>>,
}

impl SyncEnvelope {
    /// Envelope for a record created on `device_id` right now.
    pub fn new(device_id: Uuid) -> Self {
        Self::created_at(device_id, Utc::now())
    }

    pub fn created_at(device_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            sync_version: 1,
            created_at_utc: at,
            modified_at_utc: at,
            synced_at_utc: None,
        }
    }

    /// True while this version is in the outbox.
    pub fn needs_sync(&self) -> bool {
        match self.synced_at_utc {
            None => true,
            Some(synced) => synced < self.modified_at_utc,
        }
    }

    /// Records a local mutation made by `device_id` at `at`.
    pub fn touch(&mut self, device_id: Uuid, at: DateTime<Utc>) {
        self.device_id = device_id;
        self.sync_version += 1;
        self.modified_at_utc = at;
        self.synced_at_utc = None;
    }

    /// Like [`touch`](Self::touch), but the new `modifiedAtUtc` is never at or
    /// before the current one, so the write wins last-write-wins on peers
    /// whose clocks run ahead of `at`.
    pub fn supersede(&mut self, device_id: Uuid, at: DateTime<Utc>) {
        let at = superseding_time(self.modified_at_utc, at);
        self.touch(device_id, at);
    }

    /// Same version of the same record, as far as replication is concerned.
    pub fn same_version(&self, other: &SyncEnvelope) -> bool {
        self.id == other.id
            && self.sync_version == other.sync_version
            && self.modified_at_utc == other.modified_at_utc
            && self.device_id == other.device_id
    }

    /// Last-write-wins order: `modifiedAtUtc`, then `syncVersion`, then the
    /// device id string.
    pub fn lww_cmp(&self, other: &SyncEnvelope) -> Ordering {
        self.modified_at_utc
            .cmp(&other.modified_at_utc)
            .then(self.sync_version.cmp(&other.sync_version))
            .then_with(|| self.device_id.to_string().cmp(&other.device_id.to_string()))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.id.is_nil() {
            return Err(SyncError::Validation("entity id is nil".to_string()));
        }
        if self.device_id.is_nil() {
            return Err(SyncError::Validation(format!(
                "entity {} has a nil device id",
                self.id
            )));
        }
        if self.sync_version < 1 {
            return Err(SyncError::Validation(format!(
                "entity {} has sync version {}",
                self.id, self.sync_version
            )));
        }
        Ok(())
    }
}

/// `at`, or one nanosecond past `current` if `at` does not come after it.
pub fn superseding_time(current: DateTime<Utc>, at: DateTime<Utc>) -> DateTime<Utc> {
    if at > current {
        at
    } else {
        current + chrono::Duration::nanoseconds(1)
    }
}
