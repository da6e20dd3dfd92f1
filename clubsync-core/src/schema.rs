//! Schema version gate.
//!
//! Peers exchange `MAJOR.MINOR.PATCH` strings. Only the major component has to
//! match; minor and patch differences are tolerated because every payload field
//! added within a major line is optional on the wire.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Schema version spoken by this build.
pub const SCHEMA_VERSION: SchemaVersion = SchemaVersion {
    major: 1,
    minor: 2,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_compatible_with(&self, other: &SchemaVersion) -> bool {
        self.major == other.major
    }

    /// Returns `SchemaIncompatible` when `remote` has a different major version.
    pub fn ensure_compatible(&self, remote: &SchemaVersion) -> Result<(), SyncError> {
        if self.is_compatible_with(remote) {
            Ok(())
        } else {
            Err(SyncError::SchemaIncompatible {
                local: *self,
                remote: *remote,
            })
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(SyncError::Validation(format!(
                "Invalid schema version '{}'. Expected MAJOR.MINOR.PATCH",
                s
            )));
        }

        let parse = |part: &str| {
            part.parse::<u32>().map_err(|_| {
                SyncError::Validation(format!("Invalid schema version component '{}'", part))
            })
        };

        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: SchemaVersion = "1.4.2".parse().unwrap();
        assert_eq!(v, SchemaVersion::new(1, 4, 2));
        assert_eq!(v.to_string(), "1.4.2");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("1.4".parse::<SchemaVersion>().is_err());
        assert!("1.x.0".parse::<SchemaVersion>().is_err());
        assert!("".parse::<SchemaVersion>().is_err());
        assert!("1.2.3.4".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn test_major_must_match() {
        let local = SchemaVersion::new(1, 0, 0);
        assert!(local.ensure_compatible(&SchemaVersion::new(1, 9, 3)).is_ok());

        let err = local
            .ensure_compatible(&SchemaVersion::new(2, 0, 0))
            .unwrap_err();
        assert!(matches!(err, SyncError::SchemaIncompatible { .. }));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&SchemaVersion::new(1, 2, 0)).unwrap();
        assert_eq!(json, "\"1.2.0\"");

        let parsed: SchemaVersion = serde_json::from_str("\"3.0.1\"").unwrap();
        assert_eq!(parsed, SchemaVersion::new(3, 0, 1));

        assert!(serde_json::from_str::<SchemaVersion>("\"three\"").is_err());
    }
}
