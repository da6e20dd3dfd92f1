use clap::{Args, Subcommand};
use clubsync::{Config, Error};
use std::fs;
use std::io::Write;

use super::OutputFormat;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# clubsync configuration

# Directory holding clubsync.db
# data_dir: ~/.local/share/clubsync

# Identity used by 'clubsync init'
device_name: clubsync device
device_type: laptop

# Protocol server port, and the URL peers use to reach it (detected when unset)
listen_port: 47801
# advertise_url: http://192.168.1.10:47801

# Member edits from this device type win regardless of timestamps
authority_device_type: admin-tablet

sync:
  interval_secs: 300
  request_timeout_secs: 15
  peer_timeout_secs: 60
  # Peers to probe directly when broadcast is unavailable
  peers: []

discovery:
  enabled: true
  port: 47800
  announce_interval_secs: 10

conflicts:
  retention_days: 30
"#;

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Error> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!("device_name: {}", config.device_name.value);
                        println!("  source: {}", config.device_name.source);
                        println!("device_type: {}", config.device_type.value);
                        println!("  source: {}", config.device_type.source);
                        println!("listen_port: {}", config.listen_port.value);
                        println!("  source: {}", config.listen_port.source);
                        println!(
                            "advertise_url: {}",
                            config.advertise_url.value.as_deref().unwrap_or("(detected)")
                        );
                        println!("  source: {}", config.advertise_url.source);
                        println!("authority_device_type: {}", config.authority_device_type.value);
                        println!("  source: {}", config.authority_device_type.source);
                        println!();

                        println!(
                            "sync: every {}s, request timeout {}s, peer timeout {}s",
                            config.sync.interval_secs,
                            config.sync.request_timeout_secs,
                            config.sync.peer_timeout_secs
                        );
                        for peer in &config.sync.peers {
                            println!("  peer: {}", peer);
                        }
                        println!(
                            "discovery: {} on port {}",
                            if config.discovery.enabled { "enabled" } else { "disabled" },
                            config.discovery.port
                        );
                        println!("conflicts: kept {} days", config.conflicts.retention_days);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = Config::default_config_path();

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'clubsync config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}
