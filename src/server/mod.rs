//! The peer protocol server.
//!
//! # Endpoints
//!
//! - `GET /api/sync/status`: schema version and identity (no auth)
//! - `POST /api/pair`: redeem a pairing offer (no auth; the offer is the credential)
//! - `POST /api/sync/push`: apply a peer's changes (auth)
//! - `GET /api/sync/pull?since=`: changes written here after `since` (auth)
//! - `POST /api/sync/trust`: exchange trust lists (auth)

pub mod auth;
pub mod error;
pub mod routes;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clubsync_core::AuthorityPolicy;
use sqlx::SqlitePool;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::db::Identity;
use crate::pairing::PairingService;

pub use auth::AuthDevice;
pub use error::ApiError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub identity: Arc<Identity>,
    pub policy: AuthorityPolicy,
    pub pairing: PairingService,
}

pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new()
        .route("/api/sync/status", get(routes::status))
        .route("/api/pair", post(routes::pair));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/api/sync/push", post(routes::push))
        .route("/api/sync/pull", get(routes::pull))
        .route("/api/sync/trust", post(routes::trust))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the protocol on `addr` until `shutdown` completes.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Protocol server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
