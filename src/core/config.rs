//! Configuration management

use super::error::HeadsetError;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delay before a finished conversation's state record is dropped
pub const DEFAULT_CLEANUP_DELAY_MS: u64 = 3000;

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Cleanup delay after a call is rejected or ended, in milliseconds
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay_ms: u64,
    /// Buffered canonical events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_cleanup_delay() -> u64 {
    DEFAULT_CLEANUP_DELAY_MS
}
fn default_event_capacity() -> usize {
    64
}

impl ServiceConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_ms: default_cleanup_delay(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Binary-report HID headset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YealinkConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// USB Vendor ID
    #[serde(default = "default_yealink_vendor_id")]
    pub vendor_id: u16,
    /// How long to wait for the user to grant a device, in milliseconds
    #[serde(default = "default_permission_timeout")]
    pub permission_timeout_ms: u64,
    /// Input report read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: i32,
}

fn default_enabled() -> bool {
    true
}
fn default_yealink_vendor_id() -> u16 {
    0x6993
}
fn default_permission_timeout() -> u64 {
    30_000
}
fn default_read_timeout() -> i32 {
    50
}

impl Default for YealinkConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            vendor_id: default_yealink_vendor_id(),
            permission_timeout_ms: default_permission_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

/// WebSocket SDK headset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SennheiserConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// SDK socket address
    #[serde(default = "default_sennheiser_url")]
    pub url: String,
    /// Session establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_sennheiser_url() -> String {
    "ws://127.0.0.1:41108".to_string()
}
fn default_connect_timeout() -> u64 {
    5000
}

impl Default for SennheiserConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            url: default_sennheiser_url(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// REST hub headset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Hub base URL
    #[serde(default = "default_poly_url")]
    pub base_url: String,
    /// Plugin name registered with the hub
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Device status polling interval in milliseconds
    #[serde(default = "default_device_poll")]
    pub device_poll_interval_ms: u64,
    /// Call event polling interval in milliseconds
    #[serde(default = "default_call_poll")]
    pub call_poll_interval_ms: u64,
}

fn default_poly_url() -> String {
    headset_protocol::DEFAULT_SPOKES_URL.to_string()
}
fn default_plugin_name() -> String {
    "headset-bridge".to_string()
}
fn default_device_poll() -> u64 {
    2000
}
fn default_call_poll() -> u64 {
    1000
}

impl Default for PolyConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            base_url: default_poly_url(),
            plugin_name: default_plugin_name(),
            connect_timeout_ms: default_connect_timeout(),
            device_poll_interval_ms: default_device_poll(),
            call_poll_interval_ms: default_call_poll(),
        }
    }
}

/// Native-host bridge headset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JabraConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Native host executable
    #[serde(default = "default_host_command")]
    pub host_command: String,
    /// Extra arguments for the native host
    #[serde(default)]
    pub host_args: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host_command() -> String {
    "jabra-native-host".to_string()
}

impl Default for JabraConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host_command: default_host_command(),
            host_args: Vec::new(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub yealink: YealinkConfig,
    #[serde(default)]
    pub sennheiser: SennheiserConfig,
    #[serde(default)]
    pub poly: PolyConfig,
    #[serde(default)]
    pub jabra: JabraConfig,
}

impl Config {
    /// Load configuration from the platform config directory
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Return default config if file doesn't exist
            Ok(Config::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> std::result::Result<(), HeadsetError> {
        if self.poly.device_poll_interval_ms == 0 || self.poly.call_poll_interval_ms == 0 {
            return Err(HeadsetError::Config(
                "poly polling intervals must be non-zero".to_string(),
            ));
        }
        if self.service.event_capacity == 0 {
            return Err(HeadsetError::Config(
                "service.event_capacity must be non-zero".to_string(),
            ));
        }
        if self.jabra.enabled && self.jabra.host_command.trim().is_empty() {
            return Err(HeadsetError::Config(
                "jabra.host_command is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "headset-bridge", "HeadsetBridge")
            .context("Failed to determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Get the default configuration embedded in the binary
    pub fn default_config_str() -> &'static str {
        include_str!("../../config/default.toml")
    }
}
