use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clubsync_core::{ErrorBody, SchemaVersion, SyncError, SCHEMA_VERSION};

use crate::db::DbError;
use crate::error::Error;

/// Error returned by handlers, rendered as `{error, message}` JSON.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    SchemaIncompatible(SchemaVersion),
    PairingExpired(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SchemaIncompatible(_) => StatusCode::UPGRADE_REQUIRED,
            ApiError::PairingExpired(_) => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Unauthorized(m) => ErrorBody::new("unauthorized", m.as_str()),
            ApiError::BadRequest(m) => ErrorBody::new("bad_request", m.as_str()),
            ApiError::SchemaIncompatible(remote) => ErrorBody {
                schema_version: Some(SCHEMA_VERSION),
                ..ErrorBody::new(
                    "schema_incompatible",
                    format!(
                        "Schema {} is not compatible with {}; update the application",
                        remote, SCHEMA_VERSION
                    ),
                )
            },
            ApiError::PairingExpired(m) => ErrorBody::new("pairing_expired", m.as_str()),
            ApiError::Internal(m) => ErrorBody::new("internal_error", m.as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(m) = &self {
            tracing::error!("Request failed: {}", m);
        }
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Unauthorized(m) => ApiError::Unauthorized(m),
            SyncError::SchemaIncompatible { remote, .. } => ApiError::SchemaIncompatible(remote),
            SyncError::PairingExpired(_) => ApiError::PairingExpired(e.to_string()),
            SyncError::Validation(m) => ApiError::BadRequest(m),
            SyncError::PeerUnreachable(m) => ApiError::Internal(m),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sync(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Sync(e) => e.into(),
            Error::Store(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
