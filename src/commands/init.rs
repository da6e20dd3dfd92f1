use clap::Args;
use clubsync::{Config, Error};
use clubsync_core::DeviceType;

use super::{advertise_url, open_pool, pairing_service};

/// Create a new network with this device as its first member
#[derive(Args)]
pub struct InitCommand {
    /// Display name (defaults to device_name from config)
    #[arg(long, short)]
    name: Option<String>,

    /// Device type (defaults to device_type from config)
    #[arg(long = "type", short = 't')]
    device_type: Option<DeviceType>,
}

impl InitCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Error> {
        let pool = open_pool(config).await?;
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| config.device_name.value.clone());
        let device_type = self.device_type.unwrap_or(config.device_type.value);
        let address = advertise_url(config);

        let identity = pairing_service(config, pool)
            .init_network(&name, device_type, Some(address.clone()))
            .await?;

        println!("Created network {}", identity.network_id);
        println!();
        println!("Device:  {} ({})", identity.display_name, identity.device_type);
        println!("ID:      {}", identity.device_id);
        println!("Address: {}", address);
        println!();
        println!("Run 'clubsync serve' to start syncing, and");
        println!("'clubsync pair issue' to add another device.");
        Ok(())
    }
}
