//! Device identity, trust entries and the authority ranking used for members.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    MemberTablet,
    AdminTablet,
    Laptop,
    DisplayKiosk,
    DisplayScoreboard,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::MemberTablet => "MEMBER_TABLET",
            DeviceType::AdminTablet => "ADMIN_TABLET",
            DeviceType::Laptop => "LAPTOP",
            DeviceType::DisplayKiosk => "DISPLAY_KIOSK",
            DeviceType::DisplayScoreboard => "DISPLAY_SCOREBOARD",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "MEMBER_TABLET" => Ok(DeviceType::MemberTablet),
            "ADMIN_TABLET" => Ok(DeviceType::AdminTablet),
            "LAPTOP" => Ok(DeviceType::Laptop),
            "DISPLAY_KIOSK" => Ok(DeviceType::DisplayKiosk),
            "DISPLAY_SCOREBOARD" => Ok(DeviceType::DisplayScoreboard),
            _ => Err(format!(
                "Invalid device type '{}'. Valid options: member-tablet, admin-tablet, laptop, display-kiosk, display-scoreboard",
                s
            )),
        }
    }
}

/// Ranks device types for member authority.
///
/// Types listed earlier outrank types listed later; unlisted types share the
/// lowest rank. The default lists only `ADMIN_TABLET`, which is the classic
/// single-master rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityPolicy {
    ranking: Vec<DeviceType>,
}

impl AuthorityPolicy {
    pub fn new(ranking: Vec<DeviceType>) -> Self {
        Self { ranking }
    }

    pub fn rank(&self, device_type: Option<DeviceType>) -> u8 {
        let Some(device_type) = device_type else {
            return 0;
        };
        self.ranking
            .iter()
            .position(|t| *t == device_type)
            .map(|pos| (self.ranking.len() - pos) as u8)
            .unwrap_or(0)
    }

    pub fn ranking(&self) -> &[DeviceType] {
        &self.ranking
    }
}

impl Default for AuthorityPolicy {
    fn default() -> Self {
        Self::new(vec![DeviceType::AdminTablet])
    }
}

/// An entry in the trust list. Revocation flips `is_trusted`; entries are
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDevice {
    pub id: Uuid,
    pub display_name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub paired_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub is_trusted: bool,
    /// SHA-256 hex digest of the device's bearer token.
    pub token_hash: String,
    /// Last known base URL, e.g. `http://192.168.1.20:47801`.
    #[serde(default)]
    pub address: Option<String>,
}

impl TrustedDevice {
    /// Combines two views of the same device. Revocation is sticky: once
    /// either side has revoked the device it stays revoked.
    pub fn merged_with(&self, incoming: &TrustedDevice) -> TrustedDevice {
        let last_seen = match (self.last_seen, incoming.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let newer = incoming.last_seen > self.last_seen;

        TrustedDevice {
            id: self.id,
            display_name: if newer {
                incoming.display_name.clone()
            } else {
                self.display_name.clone()
            },
            device_type: self.device_type,
            paired_at: self.paired_at.min(incoming.paired_at),
            last_seen,
            is_trusted: self.is_trusted && incoming.is_trusted,
            token_hash: self.token_hash.clone(),
            address: if newer {
                incoming.address.clone().or_else(|| self.address.clone())
            } else {
                self.address.clone().or_else(|| incoming.address.clone())
            },
        }
    }
}
