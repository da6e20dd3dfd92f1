use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use clubsync::Config;
use commands::{
    ConfigCommand, ConflictCommand, DeviceCommand, InitCommand, PairCommand, ServeCommand,
    StatusCommand, SyncCommand,
};

#[derive(Parser)]
#[command(name = "clubsync")]
#[command(version)]
#[command(about = "Peer-to-peer sync for club devices on a local network", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new network on this device
    Init(InitCommand),

    /// Run the sync server, discovery and background sync
    Serve(ServeCommand),

    /// Pair devices
    Pair(PairCommand),

    /// Manage trusted devices
    Device(DeviceCommand),

    /// Sync once with reachable peers
    Sync(SyncCommand),

    /// Show sync status
    Status(StatusCommand),

    /// Review and resolve conflicts
    Conflict(ConflictCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clubsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Init(cmd)) => cmd.run(&config).await?,
        Some(Commands::Serve(cmd)) => cmd.run(&config).await?,
        Some(Commands::Pair(cmd)) => cmd.run(&config).await?,
        Some(Commands::Device(cmd)) => cmd.run(&config).await?,
        Some(Commands::Sync(cmd)) => cmd.run(&config).await?,
        Some(Commands::Status(cmd)) => cmd.run(&config).await?,
        Some(Commands::Conflict(cmd)) => cmd.run(&config).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
