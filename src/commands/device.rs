//! Trust list management commands.

use clap::{Args, Subcommand};
use clubsync::db::TrustStore;
use clubsync::{Config, Error};
use uuid::Uuid;

use super::{format_time, open_pool, pairing_service, OutputFormat};

/// Manage trusted devices
#[derive(Args)]
pub struct DeviceCommand {
    #[command(subcommand)]
    command: DeviceSubcommand,
}

#[derive(Subcommand)]
enum DeviceSubcommand {
    /// List every device in the trust list
    List {
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show this device's identity
    Show,

    /// Revoke a device and tell reachable peers
    Revoke {
        /// ID of the device to revoke
        id: Uuid,
    },
}

impl DeviceCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let trust = TrustStore::new(pool.clone());

        match &self.command {
            DeviceSubcommand::List { format } => {
                let identity = trust.require_identity().await?;
                let devices = trust.list().await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
                    OutputFormat::Text => {
                        if devices.is_empty() {
                            println!("No devices.");
                        }
                        for d in devices {
                            let marker = if d.id == identity.device_id {
                                " (this device)"
                            } else {
                                ""
                            };
                            let state = if d.is_trusted { "trusted" } else { "REVOKED" };
                            println!("{}  {}{}", d.id, d.display_name, marker);
                            println!("  type: {}  state: {}", d.device_type, state);
                            println!(
                                "  address: {}  last seen: {}",
                                d.address.as_deref().unwrap_or("unknown"),
                                format_time(d.last_seen)
                            );
                        }
                    }
                }
            }
            DeviceSubcommand::Show => {
                let identity = trust.require_identity().await?;
                println!("Device");
                println!("======");
                println!();
                println!("Name:    {}", identity.display_name);
                println!("Type:    {}", identity.device_type);
                println!("ID:      {}", identity.device_id);
                println!("Network: {}", identity.network_id);
            }
            DeviceSubcommand::Revoke { id } => {
                let reached = pairing_service(config, pool).revoke(*id).await?;
                println!("Revoked {}", id);
                println!("Told {} peer(s); the rest learn on their next sync.", reached);
            }
        }
        Ok(())
    }
}
