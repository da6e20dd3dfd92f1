//! Error taxonomy shared by every clubsync component.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::schema::SchemaVersion;

/// Failures that can end a sync exchange or a pairing ceremony.
///
/// A detected conflict is deliberately absent: it is a normal outcome and is
/// carried by [`crate::Decision::Flag`] and the push response instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The caller is not in the trust list, or has been revoked.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Major schema versions differ; requires an application update.
    #[error("Schema incompatible: local {local}, remote {remote}")]
    SchemaIncompatible {
        local: SchemaVersion,
        remote: SchemaVersion,
    },

    /// Network failure or timeout talking to a peer.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// A pairing offer was redeemed after its validity window.
    #[error("Pairing offer expired at {0}")]
    PairingExpired(DateTime<Utc>),

    /// Malformed payload or entity.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl SyncError {
    /// Whether the orchestrator should try this peer again on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::SchemaIncompatible { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_incompatible_is_not_retryable() {
        let err = SyncError::SchemaIncompatible {
            local: "1.0.0".parse().unwrap(),
            remote: "2.0.0".parse().unwrap(),
        };
        assert!(!err.is_retryable());
        assert!(SyncError::PeerUnreachable("timeout".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::SchemaIncompatible {
            local: "1.0.0".parse().unwrap(),
            remote: "2.1.0".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "Schema incompatible: local 1.0.0, remote 2.1.0"
        );
        assert_eq!(
            SyncError::Unauthorized("revoked".into()).to_string(),
            "Unauthorized: revoked"
        );
    }
}
