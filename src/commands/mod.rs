mod config_cmd;
mod conflict;
mod device;
mod init;
mod pair;
mod serve;
mod status;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use conflict::ConflictCommand;
pub use device::DeviceCommand;
pub use init::InitCommand;
pub use pair::PairCommand;
pub use serve::ServeCommand;
pub use status::StatusCommand;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use clubsync::db::init_db;
use clubsync::discovery::local_ip;
use clubsync::{Config, Error, PairingService};
use sqlx::SqlitePool;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub(crate) async fn open_pool(config: &Config) -> Result<SqlitePool, Error> {
    Ok(init_db(&config.database_path()).await?)
}

pub(crate) fn pairing_service(config: &Config, pool: SqlitePool) -> PairingService {
    PairingService::new(pool, config.sync.request_timeout())
}

/// Where peers reach this node: the configured URL, or the detected LAN
/// address and listen port.
pub(crate) fn advertise_url(config: &Config) -> String {
    match &config.advertise_url.value {
        Some(url) => url.clone(),
        None => {
            let ip = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            format!("http://{}:{}", ip, config.listen_port.value)
        }
    }
}

pub(crate) fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}
