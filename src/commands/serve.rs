use clap::Args;
use clubsync::db::{ConflictStore, TrustStore};
use clubsync::discovery::{LanDiscovery, PeerTable, StaticProber};
use clubsync::orchestrator::{OrchestratorSettings, TrustedPeers};
use clubsync::server::{self, AppState};
use clubsync::sync::HttpExchange;
use clubsync::{Config, Error, SyncOrchestrator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{open_pool, pairing_service};

/// Delay before the first sync, so discovery can find peers.
const STARTUP_SYNC_DELAY: Duration = Duration::from_secs(5);

/// Run the protocol server, discovery and background sync
#[derive(Args)]
pub struct ServeCommand {
    /// Port to listen on (overrides listen_port)
    #[arg(long, short)]
    port: Option<u16>,
}

impl ServeCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let identity = TrustStore::new(pool.clone()).require_identity().await?;
        let port = self.port.unwrap_or(config.listen_port.value);
        let policy = config.authority_policy();
        let request_timeout = config.sync.request_timeout();

        tracing::info!(
            device_id = %identity.device_id,
            network_id = %identity.network_id,
            database = %config.database_path().display(),
            "Starting node"
        );

        let table = PeerTable::new();
        let mut tasks = Vec::new();

        if config.discovery.enabled {
            let lan = LanDiscovery::new(
                identity.clone(),
                config.discovery.port,
                port,
                Duration::from_secs(config.discovery.announce_interval_secs.max(1)),
                table.clone(),
            );
            match lan.spawn().await {
                Ok(handles) => tasks.extend(handles),
                Err(e) => tracing::warn!(error = %e, "LAN discovery unavailable"),
            }
        }
        tasks.push(
            StaticProber::new(
                pool.clone(),
                identity.clone(),
                config.sync.peers.clone(),
                Duration::from_secs(config.discovery.announce_interval_secs.max(1)),
                request_timeout,
                table.clone(),
            )
            .spawn(),
        );

        let orchestrator = SyncOrchestrator::new(
            Arc::new(HttpExchange::new(
                pool.clone(),
                identity.clone(),
                policy.clone(),
                request_timeout,
            )),
            Arc::new(TrustedPeers::new(pool.clone(), identity.device_id, table.clone())),
            OrchestratorSettings {
                interval: config.sync.interval(),
                peer_timeout: config.sync.peer_timeout(),
                conflict_retention_days: config.conflicts.retention_days,
            },
            Some(ConflictStore::new(pool.clone())),
            Some(table),
        );
        orchestrator.start()?;

        let mut updates = orchestrator.subscribe();
        tasks.push(tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().state.clone();
                tracing::info!(%state, "Sync state changed");
            }
        }));

        let first = orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(STARTUP_SYNC_DELAY).await;
            if let Err(e) = first.sync_now().await {
                tracing::debug!(error = %e, "Startup sync skipped");
            }
        }));

        let state = AppState {
            pool: pool.clone(),
            identity: Arc::new(identity),
            policy,
            pairing: pairing_service(config, pool),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        server::serve(state, addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

        tracing::info!("Shutting down");
        orchestrator.stop();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}
