//! Configuration system for GSP
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/gsp/config.toml
//! - Linux: ~/.config/gsp/config.toml
//! - Windows: %APPDATA%/gsp/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DEFAULT_AUX_PORT, DEFAULT_MAIN_PORT, DEFAULT_RELAY_PORT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Room server settings
    pub room: RoomConfig,
    /// Relay service settings
    pub relay: RelayConfig,
    /// Client endpoint settings
    pub client: ClientConfig,
}

/// Room server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Bind address for both UDP ports
    pub bind: IpAddr,
    /// Address advertised to members as the UDP server
    pub public_address: String,
    /// Main room server port
    pub main_port: u16,
    /// Auxiliary NAT echo port
    pub aux_port: u16,
    /// Worker threads on the main port
    pub threads: usize,
    /// Maximum members per room, owner included
    pub max_peers: usize,
    /// Members silent for longer than this are removed
    pub dead_member_timeout_secs: u64,
    /// Interval between dead member sweeps
    pub dead_member_sweep_secs: u64,
    /// Interval between launch resend passes
    pub launch_resend_interval_ms: u64,
    /// Delay before a LaunchEvent is sent again
    pub launch_retry_ms: u64,
    /// A LaunchEvent not acked within this time is abandoned
    pub launch_ack_timeout_secs: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_address: "127.0.0.1".into(),
            main_port: DEFAULT_MAIN_PORT,
            aux_port: DEFAULT_AUX_PORT,
            threads: 1,
            max_peers: 3,
            dead_member_timeout_secs: 30,
            dead_member_sweep_secs: 10,
            launch_resend_interval_ms: 500,
            launch_retry_ms: 1000,
            launch_ack_timeout_secs: 10,
        }
    }
}

impl RoomConfig {
    /// UDP server endpoint handed out to joining members
    pub fn public_endpoint(&self) -> String {
        format!("{}:{}", self.public_address, self.main_port)
    }

    pub fn dead_member_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_member_timeout_secs)
    }

    pub fn dead_member_sweep(&self) -> Duration {
        Duration::from_secs(self.dead_member_sweep_secs)
    }

    pub fn launch_resend_interval(&self) -> Duration {
        Duration::from_millis(self.launch_resend_interval_ms)
    }

    pub fn launch_retry(&self) -> Duration {
        Duration::from_millis(self.launch_retry_ms)
    }

    pub fn launch_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_ack_timeout_secs)
    }
}

/// Relay service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Address advertised to the room server as the relay endpoint
    pub public_address: IpAddr,
    /// UDP port
    pub port: u16,
    /// Pending and live pairings idle for longer than this are removed
    pub client_timeout_secs: u64,
    /// Interval between idle sweeps
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_RELAY_PORT,
            client_timeout_secs: 120,
            sweep_interval_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Client endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval between ping batches
    pub ping_batch_ms: u64,
    /// Delay before the next ping once the previous one was answered
    pub ping_interval_ms: u64,
    /// Delay before an unanswered ping is repeated
    pub ping_repeat_ms: u64,
    /// An unanswered ping sequence is abandoned after this
    pub ping_give_up_secs: u64,
    /// Interval between server liveness pings
    pub server_ping_secs: u64,
    /// Server considered unreachable after this
    pub server_timeout_secs: u64,
    /// Host launch request fails after this
    pub launch_timeout_secs: u64,
    /// Interval between Launch retransmissions
    pub launch_repeat_ms: u64,
    /// Interval between roster refresh requests
    pub roster_poll_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_batch_ms: 300,
            ping_interval_ms: 1000,
            ping_repeat_ms: 2000,
            ping_give_up_secs: 20,
            server_ping_secs: 3,
            server_timeout_secs: 10,
            launch_timeout_secs: 20,
            launch_repeat_ms: 2000,
            roster_poll_secs: 5,
        }
    }
}

impl ClientConfig {
    pub fn ping_batch(&self) -> Duration {
        Duration::from_millis(self.ping_batch_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_repeat(&self) -> Duration {
        Duration::from_millis(self.ping_repeat_ms)
    }

    pub fn ping_give_up(&self) -> Duration {
        Duration::from_secs(self.ping_give_up_secs)
    }

    pub fn server_ping(&self) -> Duration {
        Duration::from_secs(self.server_ping_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn launch_repeat(&self) -> Duration {
        Duration::from_millis(self.launch_repeat_ms)
    }

    pub fn roster_poll(&self) -> Duration {
        Duration::from_secs(self.roster_poll_secs)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "gsplatform", "gsp")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.room.main_port, 10000);
        assert_eq!(config.room.aux_port, 10001);
        assert_eq!(config.relay.port, 10002);
        assert_eq!(config.room.max_peers, 3);
        assert_eq!(config.room.public_endpoint(), "127.0.0.1:10000");
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [room]
            main_port = 20000
            threads = 4
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.room.main_port, 20000);
        assert_eq!(config.room.threads, 4);
        // Other values should be defaults
        assert_eq!(config.room.aux_port, 10001);
        assert_eq!(config.client.launch_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.relay.port = 12345;
        config.client.ping_batch_ms = 150;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.relay.port, 12345);
        assert_eq!(loaded.client.ping_batch(), Duration::from_millis(150));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[room\nmain_port = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[room]"));
        assert!(sample.contains("[relay]"));
        assert!(sample.contains("[client]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.room.main_port, 10000);
    }
}
