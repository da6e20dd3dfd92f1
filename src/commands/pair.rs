use chrono::Utc;
use clap::{Args, Subcommand};
use clubsync::{Config, Error};
use clubsync_core::{DeviceType, PairingOffer};

use super::{advertise_url, open_pool, pairing_service};

/// Add devices to the network
#[derive(Args)]
pub struct PairCommand {
    #[command(subcommand)]
    command: PairSubcommand,
}

#[derive(Subcommand)]
enum PairSubcommand {
    /// Issue a pairing code for a new device (valid for 5 minutes)
    Issue {
        /// Name the new device will carry
        #[arg(long, short)]
        name: String,

        /// Type of the new device
        #[arg(long = "type", short = 't')]
        device_type: DeviceType,
    },

    /// Join a network using a pairing code from an existing device
    Join {
        /// The pairing code
        code: String,
    },
}

impl PairCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let service = pairing_service(config, pool);

        match &self.command {
            PairSubcommand::Issue { name, device_type } => {
                let offer = service
                    .issue_pairing(*device_type, name, &advertise_url(config), Utc::now())
                    .await?;

                println!("Pairing code for {} ({}):", name, device_type);
                println!();
                println!("  {}", offer.to_code()?);
                println!();
                println!("On the new device, run:");
                println!("  clubsync pair join <code>");
                println!();
                println!("Expires at {}. 'clubsync serve' must be running here.", offer.expires_at);
            }
            PairSubcommand::Join { code } => {
                let offer = PairingOffer::from_code(code.trim())?;
                println!("Contacting {}...", offer.endpoint);

                let me = service
                    .redeem_pairing(&offer, Some(advertise_url(config)), Utc::now())
                    .await?;

                println!("Joined network {}", offer.network_id);
                println!("Device: {} ({})", me.display_name, me.device_type);
                println!("ID:     {}", me.id);
            }
        }
        Ok(())
    }
}
