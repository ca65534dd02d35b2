//! # Configuration Management Module
//!
//! TOML configuration for the monitor: radio endpoint, coordinator tuning,
//! tracked repeaters and clients, decryptable channels, RX-log correlation,
//! storage paths and logging. Values are validated on load; `meshmon init`
//! writes a commented default file to start from.
//!
//! ## Configuration Structure
//!
//! - [`RadioConfig`] - companion radio endpoint
//! - [`CoordinatorConfig`] - tick cadence, rate limiter, failure thresholds
//! - [`NodeConfig`] - one tracked repeater or client
//! - [`ChannelConfig`] - channel secrets for RX-log decryption
//! - [`RxLogConfig`] - correlation cache tuning
//! - [`StorageConfig`] - data directory and contact store
//! - [`LoggingConfig`] - level and optional log file

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::fs;

use crate::meshcore::PUBKEY_PREFIX_LEN;

/// Minimum per-node update interval. Anything faster would dominate mesh
/// airtime once a handful of nodes are tracked.
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// TCP host of the companion radio (or a serial-TCP bridge).
    pub host: String,
    pub port: u16,
    /// Name announced to the radio on app start.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Send our own advertisement after connecting.
    #[serde(default)]
    pub advert_on_connect: bool,
}

fn default_app_name() -> String {
    "meshmon".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between coordinator ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_rate_capacity")]
    pub rate_limiter_capacity: u32,
    #[serde(default = "default_rate_refill")]
    pub rate_limiter_refill_seconds: f64,
    /// Hours without a successful update before a node is auto-disabled.
    #[serde(default = "default_auto_disable_hours")]
    pub auto_disable_hours: u64,
    /// Consecutive failures before attempting a repeater login.
    #[serde(default = "default_failures_before_login")]
    pub max_repeater_failures_before_login: u32,
    /// Consecutive failures before resetting the outbound path.
    #[serde(default = "default_failures_before_path_reset")]
    pub max_failures_before_path_reset: u32,
    /// Seconds between login retry attempts for an unreachable repeater.
    #[serde(default = "default_login_cooldown")]
    pub login_cooldown_seconds: u64,
    /// Seconds between merged-contact refreshes when nothing is dirty.
    #[serde(default = "default_contact_refresh")]
    pub contact_refresh_seconds: u64,
    /// Seconds between local-radio telemetry snapshots.
    #[serde(default = "default_self_telemetry")]
    pub self_telemetry_seconds: u64,
    /// Cap on the persisted discovered-contact store.
    #[serde(default = "default_max_discovered")]
    pub max_discovered_contacts: usize,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_rate_capacity() -> u32 {
    20
}

fn default_rate_refill() -> f64 {
    120.0
}

fn default_auto_disable_hours() -> u64 {
    120
}

fn default_failures_before_login() -> u32 {
    5
}

fn default_failures_before_path_reset() -> u32 {
    3
}

fn default_login_cooldown() -> u64 {
    3600
}

fn default_contact_refresh() -> u64 {
    60
}

fn default_self_telemetry() -> u64 {
    300
}

fn default_max_discovered() -> usize {
    200
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval(),
            rate_limiter_capacity: default_rate_capacity(),
            rate_limiter_refill_seconds: default_rate_refill(),
            auto_disable_hours: default_auto_disable_hours(),
            max_repeater_failures_before_login: default_failures_before_login(),
            max_failures_before_path_reset: default_failures_before_path_reset(),
            login_cooldown_seconds: default_login_cooldown(),
            contact_refresh_seconds: default_contact_refresh(),
            self_telemetry_seconds: default_self_telemetry(),
            max_discovered_contacts: default_max_discovered(),
        }
    }
}

/// One tracked node. Repeaters and clients share the shape; repeaters
/// additionally support login and path reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// First 12 hex characters of the node's public key.
    pub pubkey_prefix: String,
    /// Display name for logs; the advertised name is used when unset.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: u64,
    #[serde(default)]
    pub telemetry_enabled: bool,
    #[serde(default)]
    pub disable_path_reset: bool,
    #[serde(default)]
    pub disabled: bool,
    /// Repeater admin password; login is attempted after repeated failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_password: Option<String>,
}

fn default_update_interval() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_idx: u8,
    pub name: String,
    /// 32 hex characters: the 16-byte channel secret.
    pub secret: String,
}

impl ChannelConfig {
    pub fn secret_bytes(&self) -> Result<[u8; 16]> {
        let raw = crate::meshcore::protocol::hex_decode(&self.secret)
            .map_err(|_| anyhow!("channel {} secret is not valid hex", self.channel_idx))?;
        raw.try_into()
            .map_err(|_| anyhow!("channel {} secret must be 32 hex characters", self.channel_idx))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxLogConfig {
    #[serde(default = "default_rx_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rx_ttl")]
    pub ttl_seconds: f64,
    #[serde(default = "default_rx_cache_max")]
    pub cache_max_size: usize,
}

fn default_rx_enabled() -> bool {
    true
}

fn default_rx_ttl() -> f64 {
    5.0
}

fn default_rx_cache_max() -> usize {
    100
}

impl Default for RxLogConfig {
    fn default() -> Self {
        Self {
            enabled: default_rx_enabled(),
            ttl_seconds: default_rx_ttl(),
            cache_max_size: default_rx_cache_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub radio: RadioConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub rx_log: RxLogConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub repeaters: Vec<NodeConfig>,
    #[serde(default)]
    pub clients: Vec<NodeConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a starter configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::metadata(path).await.is_ok() {
            return Err(anyhow!("Config file {} already exists", path));
        }
        fs::write(path, DEFAULT_CONFIG_TOML)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.radio.host.is_empty() {
            return Err(anyhow!("radio.host must not be empty"));
        }
        let mut seen = HashSet::new();
        for node in self.repeaters.iter().chain(self.clients.iter()) {
            if node.pubkey_prefix.len() != PUBKEY_PREFIX_LEN
                || !node.pubkey_prefix.chars().all(|c| c.is_ascii_hexdigit())
                || node.pubkey_prefix.chars().any(|c| c.is_ascii_uppercase())
            {
                return Err(anyhow!(
                    "node pubkey_prefix {:?} must be {} lowercase hex characters",
                    node.pubkey_prefix,
                    PUBKEY_PREFIX_LEN
                ));
            }
            if !seen.insert(node.pubkey_prefix.clone()) {
                return Err(anyhow!(
                    "duplicate node pubkey_prefix {}",
                    node.pubkey_prefix
                ));
            }
            if node.update_interval_seconds < MIN_UPDATE_INTERVAL_SECS {
                return Err(anyhow!(
                    "node {} update_interval_seconds must be at least {}",
                    node.pubkey_prefix,
                    MIN_UPDATE_INTERVAL_SECS
                ));
            }
        }
        let mut channel_idxs = HashSet::new();
        for channel in &self.channels {
            channel.secret_bytes()?;
            if !channel_idxs.insert(channel.channel_idx) {
                return Err(anyhow!("duplicate channel_idx {}", channel.channel_idx));
            }
        }
        if self.coordinator.rate_limiter_capacity == 0 {
            return Err(anyhow!("coordinator.rate_limiter_capacity must be positive"));
        }
        if self.coordinator.rate_limiter_refill_seconds <= 0.0 {
            return Err(anyhow!(
                "coordinator.rate_limiter_refill_seconds must be positive"
            ));
        }
        if self.coordinator.tick_interval_seconds == 0 {
            return Err(anyhow!("coordinator.tick_interval_seconds must be positive"));
        }
        Ok(())
    }

    /// Path of the persisted discovered-contact store.
    pub fn contacts_store_path(&self) -> std::path::PathBuf {
        crate::storage::default_store_path(std::path::Path::new(&self.storage.data_dir))
    }
}

const DEFAULT_CONFIG_TOML: &str = r#"# meshmon configuration

[radio]
# Companion radio reachable over TCP (e.g. a WiFi node or ser2net bridge).
host = "192.168.1.50"
port = 5000
app_name = "meshmon"
advert_on_connect = false

[coordinator]
tick_interval_seconds = 60
rate_limiter_capacity = 20
rate_limiter_refill_seconds = 120.0
auto_disable_hours = 120
max_repeater_failures_before_login = 5
max_failures_before_path_reset = 3
login_cooldown_seconds = 3600
contact_refresh_seconds = 60
self_telemetry_seconds = 300
max_discovered_contacts = 200

[rx_log]
enabled = true
ttl_seconds = 5.0
cache_max_size = 100

# Channels whose traffic the RX-log correlator may decrypt.
# The secret is the 16-byte channel key as 32 hex characters.
#[[channels]]
#channel_idx = 0
#name = "Public"
#secret = "8b3387e9c5cdea6ac9e5edbaa115cd72"

# Tracked repeaters. Status is polled every update_interval_seconds.
#[[repeaters]]
#pubkey_prefix = "aabbccddeeff"
#name = "Hilltop"
#update_interval_seconds = 900
#telemetry_enabled = false
#disable_path_reset = false
#disabled = false
#login_password = "password"

# Tracked clients (sensor/companion nodes).
#[[clients]]
#pubkey_prefix = "112233445566"
#update_interval_seconds = 900
#telemetry_enabled = true

[storage]
data_dir = "data"

[logging]
level = "info"
#file = "meshmon.log"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        toml::from_str(
            r#"
            [radio]
            host = "localhost"
            port = 5000
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = base_config();
        assert_eq!(config.coordinator.rate_limiter_capacity, 20);
        assert_eq!(config.coordinator.rate_limiter_refill_seconds, 120.0);
        assert_eq!(config.rx_log.ttl_seconds, 5.0);
        assert_eq!(config.rx_log.cache_max_size, 100);
        assert_eq!(config.coordinator.auto_disable_hours, 120);
        config.validate().unwrap();
    }

    #[test]
    fn default_template_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_short_prefix_and_fast_interval() {
        let mut config = base_config();
        config.repeaters.push(NodeConfig {
            pubkey_prefix: "abc".into(),
            name: None,
            update_interval_seconds: 900,
            telemetry_enabled: false,
            disable_path_reset: false,
            disabled: false,
            login_password: None,
        });
        assert!(config.validate().is_err());

        config.repeaters[0].pubkey_prefix = "aabbccddeeff".into();
        config.repeaters[0].update_interval_seconds = 60;
        assert!(config.validate().is_err());

        config.repeaters[0].update_interval_seconds = 300;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_prefixes_across_node_kinds() {
        let mut config = base_config();
        let node = NodeConfig {
            pubkey_prefix: "aabbccddeeff".into(),
            name: None,
            update_interval_seconds: 900,
            telemetry_enabled: false,
            disable_path_reset: false,
            disabled: false,
            login_password: None,
        };
        config.repeaters.push(node.clone());
        config.clients.push(node);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_channel_secret() {
        let mut config = base_config();
        config.channels.push(ChannelConfig {
            channel_idx: 0,
            name: "Public".into(),
            secret: "nothex".into(),
        });
        assert!(config.validate().is_err());
        config.channels[0].secret = "00112233445566778899aabbccddeeff".into();
        config.validate().unwrap();
    }
}
