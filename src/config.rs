use clubsync_core::{AuthorityPolicy, DeviceType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_PORT: u16 = 47801;
pub const DEFAULT_DISCOVERY_PORT: u16 = 47800;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    fn set(&mut self, value: T, source: ConfigSource) {
        self.value = value;
        self.source = source;
    }
}

/// Sync scheduling and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between background sync cycles
    pub interval_secs: u64,
    /// Bound on each HTTP request
    pub request_timeout_secs: u64,
    /// Bound on one full exchange with a peer
    pub peer_timeout_secs: u64,
    /// Peers probed directly, e.g. "http://10.0.0.12:47801"
    pub peers: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            request_timeout_secs: 15,
            peer_timeout_secs: 60,
            peers: Vec::new(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }
}

/// LAN broadcast discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub port: u16,
    pub announce_interval_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictSettings {
    /// Days a settled conflict is kept before purge
    pub retention_days: i64,
}

impl Default for ConflictSettings {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

/// Node configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding the node database
    pub data_dir: ConfigValue<PathBuf>,
    /// Name this device announces when it creates a network
    pub device_name: ConfigValue<String>,
    /// Type this device takes when it creates a network
    pub device_type: ConfigValue<DeviceType>,
    /// Port the protocol server binds
    pub listen_port: ConfigValue<u16>,
    /// URL peers use to reach this node; detected when unset
    pub advertise_url: ConfigValue<Option<String>>,
    /// Device type whose member edits win regardless of timestamps
    pub authority_device_type: ConfigValue<DeviceType>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncSettings,
    pub discovery: DiscoverySettings,
    pub conflicts: ConflictSettings,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    device_name: Option<String>,
    device_type: Option<String>,
    listen_port: Option<u16>,
    advertise_url: Option<String>,
    authority_device_type: Option<String>,
    sync: Option<SyncSettings>,
    discovery: Option<DiscoverySettings>,
    conflicts: Option<ConflictSettings>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
            config.apply_file(file, &path)?;
            config.config_file = Some(path);
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn defaults() -> Self {
        Self {
            data_dir: ConfigValue::new(Self::default_data_dir(), ConfigSource::Default),
            device_name: ConfigValue::new("clubsync device".to_string(), ConfigSource::Default),
            device_type: ConfigValue::new(DeviceType::Laptop, ConfigSource::Default),
            listen_port: ConfigValue::new(DEFAULT_LISTEN_PORT, ConfigSource::Default),
            advertise_url: ConfigValue::new(None, ConfigSource::Default),
            authority_device_type: ConfigValue::new(DeviceType::AdminTablet, ConfigSource::Default),
            config_file: None,
            sync: SyncSettings::default(),
            discovery: DiscoverySettings::default(),
            conflicts: ConflictSettings::default(),
        }
    }

    fn apply_file(&mut self, file: ConfigFile, path: &std::path::Path) -> Result<(), ConfigError> {
        let source = ConfigSource::File;
        if let Some(dir) = file.data_dir {
            // Relative paths resolve against the config file's directory
            let resolved = if dir.is_relative() {
                path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
            } else {
                dir
            };
            self.data_dir.set(resolved, source.clone());
        }
        if let Some(name) = file.device_name {
            self.device_name.set(name, source.clone());
        }
        if let Some(t) = file.device_type {
            self.device_type.set(parse_device_type("device_type", &t)?, source.clone());
        }
        if let Some(port) = file.listen_port {
            self.listen_port.set(port, source.clone());
        }
        if let Some(url) = file.advertise_url {
            self.advertise_url.set(Some(url), source.clone());
        }
        if let Some(t) = file.authority_device_type {
            self.authority_device_type
                .set(parse_device_type("authority_device_type", &t)?, source);
        }
        if let Some(sync) = file.sync {
            self.sync = sync;
        }
        if let Some(discovery) = file.discovery {
            self.discovery = discovery;
        }
        if let Some(conflicts) = file.conflicts {
            self.conflicts = conflicts;
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let source = ConfigSource::Environment;
        if let Some(dir) = var("CLUBSYNC_DATA_DIR") {
            self.data_dir.set(PathBuf::from(dir), source.clone());
        }
        if let Some(name) = var("CLUBSYNC_DEVICE_NAME") {
            self.device_name.set(name, source.clone());
        }
        if let Some(t) = var("CLUBSYNC_DEVICE_TYPE") {
            self.device_type
                .set(parse_device_type("CLUBSYNC_DEVICE_TYPE", &t)?, source.clone());
        }
        if let Some(port) = var("CLUBSYNC_LISTEN_PORT") {
            let parsed = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CLUBSYNC_LISTEN_PORT".into(), port))?;
            self.listen_port.set(parsed, source.clone());
        }
        if let Some(url) = var("CLUBSYNC_ADVERTISE_URL") {
            self.advertise_url.set(Some(url), source.clone());
        }
        if let Some(t) = var("CLUBSYNC_AUTHORITY_DEVICE_TYPE") {
            self.authority_device_type
                .set(parse_device_type("CLUBSYNC_AUTHORITY_DEVICE_TYPE", &t)?, source);
        }
        if let Some(peers) = var("CLUBSYNC_SYNC_PEERS") {
            self.sync.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(enabled) = var("CLUBSYNC_DISCOVERY_ENABLED") {
            self.discovery.enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.value.join("clubsync.db")
    }

    pub fn authority_policy(&self) -> AuthorityPolicy {
        AuthorityPolicy::new(vec![self.authority_device_type.value])
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/clubsync/
    /// - macOS: ~/Library/Application Support/clubsync/
    /// - Windows: %APPDATA%/clubsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clubsync")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clubsync")
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn parse_device_type(key: &str, value: &str) -> Result<DeviceType, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, serde_yaml::Error),
    #[error("Invalid value for {0}: '{1}'")]
    InvalidValue(String, String),
}
