//! HTTP client for the peer protocol.

use chrono::{DateTime, SecondsFormat, Utc};
use clubsync_core::{
    ErrorBody, PairRequest, PairResponse, PushResponse, StatusResponse, SyncError, SyncPayload,
    TrustListRequest, TrustListResponse, TrustedDevice, SCHEMA_VERSION,
};
use reqwest::StatusCode;
use std::time::Duration;

/// Result of a push the peer processed.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// 200: everything accepted or skipped.
    Accepted(PushResponse),
    /// 409: some records were flagged.
    Conflicted(PushResponse),
}

/// Client for one peer's sync endpoints.
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl SyncClient {
    /// Creates a client for `base_url`. Every request is bounded by
    /// `timeout`.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::PeerUnreachable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> Result<StatusResponse, SyncError> {
        let response = self
            .http
            .get(format!("{}/api/sync/status", self.base_url))
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        response.json().await.map_err(unreachable)
    }

    pub async fn push(&self, payload: &SyncPayload) -> Result<PushOutcome, SyncError> {
        let response = self
            .authorized(self.http.post(format!("{}/api/sync/push", self.base_url)))
            .json(payload)
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            StatusCode::OK => Ok(PushOutcome::Accepted(
                response.json().await.map_err(unreachable)?,
            )),
            StatusCode::CONFLICT => Ok(PushOutcome::Conflicted(
                response.json().await.map_err(unreachable)?,
            )),
            _ => Err(error_from(response).await),
        }
    }

    /// Fetches the peer's records changed after `since` (its own clock).
    pub async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<SyncPayload, SyncError> {
        let url = match since {
            Some(since) => format!(
                "{}/api/sync/pull?since={}",
                self.base_url,
                urlencoding::encode(&since.to_rfc3339_opts(SecondsFormat::Nanos, true))
            ),
            None => format!("{}/api/sync/pull", self.base_url),
        };

        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        response.json().await.map_err(unreachable)
    }

    pub async fn push_trust(
        &self,
        devices: Vec<TrustedDevice>,
    ) -> Result<TrustListResponse, SyncError> {
        let response = self
            .authorized(self.http.post(format!("{}/api/sync/trust", self.base_url)))
            .json(&TrustListRequest { devices })
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        response.json().await.map_err(unreachable)
    }

    /// Redeems a pairing offer at the issuing device.
    pub async fn pair(&self, request: &PairRequest) -> Result<PairResponse, SyncError> {
        let response = self
            .http
            .post(format!("{}/api/pair", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(unreachable)?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(unreachable),
            StatusCode::GONE => Err(SyncError::PairingExpired(request.offer.expires_at)),
            _ => Err(error_from(response).await),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn unreachable(e: reqwest::Error) -> SyncError {
    if e.is_decode() {
        SyncError::Validation(format!("Invalid response from peer: {}", e))
    } else {
        SyncError::PeerUnreachable(e.to_string())
    }
}

async fn error_from(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body: Option<ErrorBody> = response.json().await.ok();
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized(message),
        StatusCode::UPGRADE_REQUIRED => match body.and_then(|b| b.schema_version) {
            Some(remote) => SyncError::SchemaIncompatible {
                local: SCHEMA_VERSION,
                remote,
            },
            None => SyncError::Validation(message),
        },
        StatusCode::BAD_REQUEST => SyncError::Validation(message),
        _ => SyncError::PeerUnreachable(format!("{}: {}", status, message)),
    }
}
