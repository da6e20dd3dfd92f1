use clubsync_core::SyncError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::orchestrator::OrchestratorError;

/// Top-level error for node operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sync(SyncError),

    #[error(transparent)]
    Store(DbError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("This device already belongs to network {0}")]
    AlreadyInitialized(uuid::Uuid),
}

impl From<SyncError> for Error {
    fn from(e: SyncError) -> Self {
        Error::Sync(e)
    }
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sync(e) => Error::Sync(e),
            other => Error::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_validation_surfaces_as_sync_error() {
        let err: Error = DbError::Sync(SyncError::Validation("bad".into())).into();
        assert!(matches!(err, Error::Sync(SyncError::Validation(_))));

        let err: Error = DbError::NotInitialized.into();
        assert!(matches!(err, Error::Store(DbError::NotInitialized)));
    }
}
