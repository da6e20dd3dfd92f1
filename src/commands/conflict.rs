use chrono::{Duration, Utc};
use clap::{Args, Subcommand, ValueEnum};
use clubsync::db::{ConflictStore, TrustStore};
use clubsync::{Config, Error};
use clubsync_core::{ConflictState, Resolution, SyncError};
use uuid::Uuid;

use super::{open_pool, OutputFormat};

/// Review and resolve sync conflicts
#[derive(Args)]
pub struct ConflictCommand {
    #[command(subcommand)]
    command: ConflictSubcommand,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResolutionArg {
    KeepLocal,
    AcceptRemote,
    KeepBoth,
    CancelCheckout,
}

#[derive(Subcommand)]
enum ConflictSubcommand {
    /// List conflicts (pending only unless --all)
    List {
        #[arg(long)]
        all: bool,

        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Resolve a pending conflict
    Resolve {
        /// Conflict ID
        id: Uuid,

        /// How to resolve it
        #[arg(value_enum)]
        resolution: ResolutionArg,

        /// Checkout to cancel (required with cancel-checkout)
        #[arg(long)]
        checkout: Option<Uuid>,
    },

    /// Delete settled conflicts older than the retention period
    Purge {
        /// Retention in days (overrides conflicts.retention_days)
        #[arg(long)]
        days: Option<i64>,
    },
}

impl ConflictCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let store = ConflictStore::new(pool.clone());

        match &self.command {
            ConflictSubcommand::List { all, format } => {
                let state = if *all { None } else { Some(ConflictState::Pending) };
                let conflicts = store.list(state).await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&conflicts)?)
                    }
                    OutputFormat::Text => {
                        if conflicts.is_empty() {
                            println!("No conflicts.");
                        }
                        for c in conflicts {
                            println!("{}  [{}] {}", c.id, c.state, c.entity_kind);
                            println!("  {}", c.description);
                            println!("  local:  {}", c.local_entity_id);
                            println!(
                                "  remote: {} (from {})",
                                c.remote_entity_id, c.remote_device_id
                            );
                            if let Some(resolution) = c.resolution {
                                println!("  resolution: {}", resolution);
                            }
                        }
                    }
                }
            }
            ConflictSubcommand::Resolve {
                id,
                resolution,
                checkout,
            } => {
                let resolution = match (resolution, checkout) {
                    (ResolutionArg::KeepLocal, _) => Resolution::KeepLocal,
                    (ResolutionArg::AcceptRemote, _) => Resolution::AcceptRemote,
                    (ResolutionArg::KeepBoth, _) => Resolution::KeepBoth,
                    (ResolutionArg::CancelCheckout, Some(checkout_id)) => {
                        Resolution::CancelCheckout {
                            checkout_id: *checkout_id,
                        }
                    }
                    (ResolutionArg::CancelCheckout, None) => {
                        return Err(SyncError::Validation(
                            "cancel-checkout needs --checkout <id>".into(),
                        )
                        .into())
                    }
                };
                let identity = TrustStore::new(pool).require_identity().await?;
                let resolved = store
                    .resolve(*id, resolution, identity.device_id, Utc::now())
                    .await?;
                println!("Resolved {} ({})", resolved.id, resolution);
                println!("The change reaches peers on the next sync.");
            }
            ConflictSubcommand::Purge { days } => {
                let days = days.unwrap_or(config.conflicts.retention_days);
                let purged = store.purge_synced(Utc::now() - Duration::days(days)).await?;
                println!("Purged {} conflict(s)", purged);
            }
        }
        Ok(())
    }
}
