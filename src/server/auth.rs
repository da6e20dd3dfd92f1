use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use clubsync_core::{hash_token, TrustedDevice};

use super::{error::ApiError, AppState};
use crate::db::TrustStore;

/// The authenticated caller, added to request extensions after auth.
#[derive(Debug, Clone)]
pub struct AuthDevice(pub TrustedDevice);

/// Rejects callers that are unknown or revoked before any handler runs.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())?;
    let trust = TrustStore::new(state.pool.clone());

    let device = match trust.find_by_token_hash(&hash_token(&token)).await? {
        Some(device) if device.is_trusted => device,
        Some(device) => {
            tracing::warn!(device_id = %device.id, "Rejected request from revoked device");
            return Err(ApiError::Unauthorized("Device has been revoked".into()));
        }
        None => return Err(ApiError::Unauthorized("Unknown device token".into())),
    };

    if let Err(e) = trust.touch(device.id, Utc::now(), None).await {
        tracing::warn!(device_id = %device.id, error = %e, "Failed to update last seen");
    }

    request.extensions_mut().insert(AuthDevice(device));
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    match headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        Some(h) => h
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::Unauthorized("Authorization header must use Bearer scheme".into())
            }),
        None => Err(ApiError::Unauthorized(
            "Authorization header required".into(),
        )),
    }
}
