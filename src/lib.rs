//! clubsync node
//!
//! Runs one device of a club's local network: the trust list and pairing
//! ceremony, peer discovery, the HTTP sync protocol and the background
//! orchestrator that keeps every trusted device's copy of the club data
//! converging. The data model and conflict policy live in `clubsync-core`.

pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod pairing;
pub mod server;
pub mod sync;

pub use config::{Config, ConfigError};
pub use error::Error;
pub use orchestrator::{SyncOrchestrator, SyncResult, SyncState, SyncStatus};
pub use pairing::PairingService;
