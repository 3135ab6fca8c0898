//! # Bridge Configuration
//!
//! Configuration for the bridge process.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BRIDGE_DEVICE_HOST=192.168.1.40                                    │
//! │     BRIDGE_DEVICE_SECURITY_KEY=abc1234                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     Path given by BRIDGE_CONFIG, e.g. /etc/spoolbridge/bridge.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Everything except device host and security key has a default.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! host = "192.168.1.40"
//! port = 80
//! scheme = "http"
//! security_key = "abc1234"
//!
//! [inventory]
//! host = "localhost"
//! port = 8000
//!
//! [sync]
//! poll_interval_secs = 30
//! delta_threshold_g = 0.1
//! initial_delay_secs = 5
//! request_timeout_secs = 10
//!
//! [storage]
//! mapping_path = "/data/mapping.toml"
//!
//! [log]
//! level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Length of the Device security key, fixed by the firmware.
pub const SECURITY_KEY_LEN: usize = 7;

// =============================================================================
// Device Scheme
// =============================================================================

/// URL scheme used to reach the Device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceScheme {
    /// Plain HTTP (factory default for the Device).
    #[default]
    Http,

    /// HTTPS, for Devices behind a TLS-terminating proxy.
    Https,
}

impl std::fmt::Display for DeviceScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceScheme::Http => write!(f, "http"),
            DeviceScheme::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for DeviceScheme {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(DeviceScheme::Http),
            "https" => Ok(DeviceScheme::Https),
            other => Err(SyncError::Config(format!(
                "unknown device scheme '{other}', expected http or https"
            ))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Connection settings for the Device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Hostname or IP of the Device. Required.
    #[serde(default)]
    pub host: String,

    /// TCP port of the Device HTTP server.
    #[serde(default = "default_device_port")]
    pub port: u16,

    /// URL scheme.
    #[serde(default)]
    pub scheme: DeviceScheme,

    /// 7-character security key shared with the Device. Required.
    #[serde(default)]
    pub security_key: String,
}

fn default_device_port() -> u16 {
    80
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            host: String::new(),
            port: default_device_port(),
            scheme: DeviceScheme::default(),
            security_key: String::new(),
        }
    }
}

/// Connection settings for the Inventory service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySettings {
    /// Hostname or IP of the Inventory service.
    #[serde(default = "default_inventory_host")]
    pub host: String,

    /// TCP port of the Inventory service.
    #[serde(default = "default_inventory_port")]
    pub port: u16,
}

fn default_inventory_host() -> String {
    "localhost".to_string()
}

fn default_inventory_port() -> u16 {
    8000
}

impl Default for InventorySettings {
    fn default() -> Self {
        InventorySettings {
            host: default_inventory_host(),
            port: default_inventory_port(),
        }
    }
}

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Seconds between catalog polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum consumption delta (grams) worth pushing to the Inventory.
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold_g: f64,

    /// Seconds to wait after startup before the first full sync, giving
    /// both services time to settle.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Per-request deadline for every network call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_delta_threshold() -> f64 {
    0.1
}
fn default_initial_delay() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval_secs: default_poll_interval(),
            delta_threshold_g: default_delta_threshold(),
            initial_delay_secs: default_initial_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Path of the mapping file.
    #[serde(default = "default_mapping_path")]
    pub mapping_path: PathBuf,
}

fn default_mapping_path() -> PathBuf {
    PathBuf::from("/data/mapping.toml")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            mapping_path: default_mapping_path(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// tracing filter directive, e.g. "info" or "spoolbridge_sync=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Bridge Configuration
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device connection settings.
    #[serde(default)]
    pub device: DeviceSettings,

    /// Inventory connection settings.
    #[serde(default)]
    pub inventory: InventorySettings,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings.
    #[serde(default)]
    pub log: LogSettings,
}

impl BridgeConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file, if `config_path` (or `BRIDGE_CONFIG`) points at one
    /// 3. `BRIDGE_*` environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        let path = config_path.or_else(|| std::env::var("BRIDGE_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = path {
            if path.exists() {
                debug!(?path, "Loading bridge config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
                config = toml::from_str(&contents)
                    .map_err(|e| SyncError::Config(format!("cannot parse {}: {e}", path.display())))?;
            } else {
                warn!(?path, "Config file not found, using defaults and environment");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.host.is_empty() {
            return Err(SyncError::Config(
                "device host is required (BRIDGE_DEVICE_HOST)".into(),
            ));
        }

        if self.device.security_key.len() != SECURITY_KEY_LEN {
            return Err(SyncError::Config(format!(
                "device security key must be exactly {SECURITY_KEY_LEN} characters"
            )));
        }
        if !self
            .device
            .security_key
            .bytes()
            .all(|b| (0x21..=0x7e).contains(&b))
        {
            return Err(SyncError::Config(
                "device security key must be printable ASCII".into(),
            ));
        }

        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll interval must be at least 1s".into()));
        }
        if !self.sync.delta_threshold_g.is_finite() || self.sync.delta_threshold_g < 0.0 {
            return Err(SyncError::Config(
                "delta threshold must be a non-negative number of grams".into(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(SyncError::Config("request timeout must be at least 1s".into()));
        }

        url::Url::parse(&self.device_base_url())
            .map_err(|e| SyncError::Config(format!("device URL is invalid: {e}")))?;
        url::Url::parse(&self.inventory_base_url())
            .map_err(|e| SyncError::Config(format!("inventory URL is invalid: {e}")))?;

        Ok(())
    }

    /// Applies `BRIDGE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BRIDGE_DEVICE_HOST") {
            self.device.host = host;
        }
        if let Some(port) = env_parse("BRIDGE_DEVICE_PORT") {
            self.device.port = port;
        }
        if let Ok(scheme) = std::env::var("BRIDGE_DEVICE_SCHEME") {
            match scheme.parse() {
                Ok(parsed) => self.device.scheme = parsed,
                Err(_) => warn!(scheme = %scheme, "Ignoring unknown BRIDGE_DEVICE_SCHEME"),
            }
        }
        if let Ok(key) = std::env::var("BRIDGE_DEVICE_SECURITY_KEY") {
            self.device.security_key = key;
        }
        if let Ok(host) = std::env::var("BRIDGE_INVENTORY_HOST") {
            self.inventory.host = host;
        }
        if let Some(port) = env_parse("BRIDGE_INVENTORY_PORT") {
            self.inventory.port = port;
        }
        if let Some(secs) = env_parse("BRIDGE_POLL_INTERVAL_SECS") {
            self.sync.poll_interval_secs = secs;
        }
        if let Some(grams) = env_parse("BRIDGE_DELTA_THRESHOLD_G") {
            self.sync.delta_threshold_g = grams;
        }
        if let Some(secs) = env_parse("BRIDGE_INITIAL_DELAY_SECS") {
            self.sync.initial_delay_secs = secs;
        }
        if let Some(secs) = env_parse("BRIDGE_REQUEST_TIMEOUT_SECS") {
            self.sync.request_timeout_secs = secs;
        }
        if let Ok(path) = std::env::var("BRIDGE_MAPPING_PATH") {
            self.storage.mapping_path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("BRIDGE_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    // =========================================================================
    // Derived URLs
    // =========================================================================

    /// Base URL of the Device REST API.
    pub fn device_base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.device.scheme, self.device.host, self.device.port
        )
    }

    /// Base URL of the Inventory REST API.
    pub fn inventory_base_url(&self) -> String {
        format!("http://{}:{}", self.inventory.host, self.inventory.port)
    }

    /// WebSocket URL of the Inventory event feed.
    pub fn inventory_ws_url(&self) -> String {
        format!("ws://{}:{}", self.inventory.host, self.inventory.port)
    }

    /// Per-request network deadline.
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.request_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
