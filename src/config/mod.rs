//! Configuration module
//!
//! Handles loading and saving multicom configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_PORT, MAX_DATAGRAM_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// UDP broadcast channels
    #[serde(default)]
    pub udp: UdpConfig,

    /// BLE channel
    #[serde(default)]
    pub ble: BleConfig,

    /// Request timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Discovery timing
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// UDP channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Port devices listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local address to bind to (default: all interfaces)
    pub local_ip: Option<String>,
    /// Subnets to broadcast into, one channel each (e.g. "192.168.1.0/24").
    /// Empty means a single channel using the platform broadcast address.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Number of discovery probes per discovery round
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    /// Spacing between discovery probes in ms
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    /// Receive buffer size in bytes
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_probe_count() -> u32 {
    5
}

fn default_probe_interval() -> u64 {
    200
}

fn default_recv_buffer() -> usize {
    MAX_DATAGRAM_SIZE
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            local_ip: None,
            subnets: Vec::new(),
            probe_count: default_probe_count(),
            probe_interval_ms: default_probe_interval(),
            recv_buffer: default_recv_buffer(),
        }
    }
}

impl UdpConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// BLE channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// Enable the BLE channel
    #[serde(default)]
    pub enabled: bool,
    /// How long to scan for peripherals in ms
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,
}

fn default_scan_timeout() -> u64 {
    2000
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_timeout_ms: default_scan_timeout(),
        }
    }
}

impl BleConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

/// Session request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Total time budget of one request in ms
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Default number of transmissions of a GET/POST
    #[serde(default = "default_retransmits")]
    pub retransmits: u32,
}

fn default_timeout() -> u64 {
    8000
}

fn default_retransmits() -> u32 {
    4
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
            retransmits: default_retransmits(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum length of a discovery round in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Forget devices not seen for this long (default: never)
    pub device_ttl_secs: Option<u64>,
}

fn default_window() -> u64 {
    4
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            device_ttl_secs: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn device_ttl(&self) -> Option<Duration> {
        self.device_ttl_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("multicom/config.toml")),
            Some(PathBuf::from("./multicom.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        udp: UdpConfig {
            subnets: vec!["192.168.1.0/24".to_string(), "10.0.1.0/24".to_string()],
            ..Default::default()
        },
        discovery: DiscoveryConfig {
            device_ttl_secs: Some(600),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.udp.port, DEFAULT_PORT);
        assert_eq!(config.udp.probe_count, 5);
        assert_eq!(config.session.timeout(), Duration::from_secs(8));
        assert_eq!(config.session.retransmits, 4);
        assert_eq!(config.discovery.window(), Duration::from_secs(4));
        assert_eq!(config.discovery.device_ttl(), None);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.session.timeout_ms = 2000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.udp.port, config.udp.port);
        assert_eq!(loaded.session.timeout_ms, 2000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[udp]\nsubnets = [\"10.0.0.0/8\"]\n").unwrap();
        assert_eq!(config.udp.subnets, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(config.udp.port, DEFAULT_PORT);
        assert_eq!(config.ble.scan_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/multicom.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.udp.subnets.len(), 2);
        assert_eq!(parsed.discovery.device_ttl_secs, Some(600));
    }
}
