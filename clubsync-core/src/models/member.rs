use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityKind, SyncEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Active => write!(f, "active"),
            MemberStatus::Inactive => write!(f, "inactive"),
            MemberStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(MemberStatus::Active),
            "inactive" => Ok(MemberStatus::Inactive),
            "suspended" => Ok(MemberStatus::Suspended),
            _ => Err(format!(
                "Invalid member status '{}'. Valid options: active, inactive, suspended",
                s
            )),
        }
    }
}

/// Master profile data. Written in practice by one authority device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub membership_number: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub status: MemberStatus,
    #[serde(default)]
    pub joined_on: Option<NaiveDate>,
}

impl_sync_entity!(Member, EntityKind::Member);

impl Member {
    pub fn new(
        device_id: Uuid,
        membership_number: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            sync: SyncEnvelope::new(device_id),
            membership_number: membership_number.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: None,
            phone: None,
            status: MemberStatus::Active,
            joined_on: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Self-service registration captured on a member tablet, approved later on
/// an admin device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMemberRegistration {
    #[serde(flatten)]
    pub sync: SyncEnvelope,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub submitted_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub status: RegistrationStatus,
    /// Member created from this registration once approved.
    #[serde(default)]
    pub member_id: Option<Uuid>,
}

impl_sync_entity!(NewMemberRegistration, EntityKind::NewMemberRegistration);

impl NewMemberRegistration {
    pub fn new(
        device_id: Uuid,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        let sync = SyncEnvelope::new(device_id);
        Self {
            submitted_at_utc: sync.created_at_utc,
            sync,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: None,
            phone: None,
            status: RegistrationStatus::Pending,
            member_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_wire_shape_flattens_envelope() {
        let member = Member::new(Uuid::new_v4(), "M-100", "Ada", "Lovelace");
        let json = serde_json::to_value(&member).unwrap();

        assert_eq!(json["membershipNumber"], "M-100");
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["syncVersion"], 1);
        assert!(json.get("sync").is_none());

        let parsed: Member = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, member);
    }

    #[test]
    fn test_member_status_from_str() {
        assert_eq!(
            MemberStatus::from_str("Suspended").unwrap(),
            MemberStatus::Suspended
        );
        assert!(MemberStatus::from_str("gone").is_err());
    }

    #[test]
    fn test_registration_defaults_to_pending() {
        let reg = NewMemberRegistration::new(Uuid::new_v4(), "Grace", "Hopper");
        assert_eq!(reg.status, RegistrationStatus::Pending);
        assert_eq!(reg.submitted_at_utc, reg.sync.created_at_utc);
        assert!(reg.member_id.is_none());
    }
}
