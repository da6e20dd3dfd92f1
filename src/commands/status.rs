use clap::Args;
use clubsync::db::{ConflictStore, EntityStore, PeerStateStore, TrustStore};
use clubsync::{Config, Error};

use super::{format_time, open_pool};

/// Show this node's sync status
#[derive(Args)]
pub struct StatusCommand;

impl StatusCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let trust = TrustStore::new(pool.clone());
        let identity = trust.require_identity().await?;
        let entities = EntityStore::new(pool.clone());
        let peer_state = PeerStateStore::new(pool.clone());

        println!("Sync Status");
        println!("===========");
        println!();
        println!("Device:    {} ({})", identity.display_name, identity.device_type);
        println!("Network:   {}", identity.network_id);
        println!("Records:   {}", entities.counts().await?.total());
        println!("Unsynced:  {}", entities.unsynced_count().await?);
        println!(
            "Conflicts: {} pending",
            ConflictStore::new(pool).pending_count().await?
        );
        println!();

        let peers = trust.peers(identity.device_id).await?;
        if peers.is_empty() {
            println!("No trusted peers. Run 'clubsync pair issue' to add one.");
            return Ok(());
        }

        println!("Peers:");
        for peer in peers {
            let state = peer_state.get(peer.id).await?;
            println!("  {} ({})", peer.display_name, peer.id);
            println!("    last sync: {}", format_time(state.last_sync_at));
            if let Some(schema) = state.incompatible_schema {
                println!("    schema {} is incompatible; update required", schema);
            }
            if let Some(error) = state.last_error {
                println!("    last error: {}", error);
            }
        }
        Ok(())
    }
}
