//! One-shot sync with every reachable peer.

use clap::Args;
use clubsync::db::{ConflictStore, TrustStore};
use clubsync::discovery::{PeerTable, StaticProber};
use clubsync::orchestrator::{OrchestratorSettings, TrustedPeers};
use clubsync::sync::HttpExchange;
use clubsync::{Config, Error, SyncOrchestrator};
use std::sync::Arc;

use super::{open_pool, OutputFormat};

/// Sync once with every reachable trusted peer
#[derive(Args)]
pub struct SyncCommand {
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let identity = TrustStore::new(pool.clone()).require_identity().await?;
        let request_timeout = config.sync.request_timeout();

        // Without the server's broadcast listener, reach peers directly.
        let table = PeerTable::new();
        let prober = StaticProber::new(
            pool.clone(),
            identity.clone(),
            config.sync.peers.clone(),
            config.sync.interval(),
            request_timeout,
            table.clone(),
        );
        let reachable = prober.probe_all().await;
        if matches!(self.format, OutputFormat::Text) {
            println!("Found {} reachable peer(s)", reachable);
        }

        let orchestrator = SyncOrchestrator::new(
            Arc::new(HttpExchange::new(
                pool.clone(),
                identity.clone(),
                config.authority_policy(),
                request_timeout,
            )),
            Arc::new(TrustedPeers::new(pool.clone(), identity.device_id, table.clone())),
            OrchestratorSettings {
                interval: config.sync.interval(),
                peer_timeout: config.sync.peer_timeout(),
                conflict_retention_days: config.conflicts.retention_days,
            },
            Some(ConflictStore::new(pool)),
            Some(table),
        );
        orchestrator.start()?;
        let result = orchestrator.sync_now().await;
        orchestrator.stop();
        let result = result?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Text => {
                println!(
                    "Peers: {} synced, {} failed, {} skipped",
                    result.peers_synced, result.peers_failed, result.peers_skipped
                );
                println!(
                    "Records: {} pushed, {} pulled",
                    result.pushed.total(),
                    result.pulled.total()
                );
                if !result.conflicts.is_empty() {
                    println!();
                    println!("{} conflict(s) need resolution:", result.conflicts.len());
                    for c in &result.conflicts {
                        println!("  {}  {}  {}", c.id, c.entity_kind, c.description);
                    }
                    println!("Run 'clubsync conflict list' for details.");
                }
                if let Some(error) = &result.error {
                    println!();
                    println!("Error: {}", error);
                }
            }
        }
        Ok(())
    }
}
