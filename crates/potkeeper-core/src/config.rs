//! Configuration management for potkeeper
//!
//! Handles loading and validation of `potkeeper.toml`. Every field has a
//! default, so an absent file or an empty one yields a working config once an
//! output root is supplied (usually via `--path`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Label that marks containers and networks as belonging to a pot.
pub const DEFAULT_POT_LABEL: &str = "pot.name";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Rotation and discovery settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Packet capture settings
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Container runtime settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,
}

/// Rotation and discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Root directory for working directories and archives
    #[serde(default)]
    pub output_root: Option<PathBuf>,

    /// Hours between rotation cycles
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Seconds between network discovery ticks
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Label whose value names the pot
    #[serde(default = "default_pot_label")]
    pub pot_label: String,

    /// How long a rotation waits for the capture to confirm it stopped
    #[serde(default = "default_stop_ack_timeout")]
    pub stop_ack_timeout_secs: u64,

    /// How long shutdown waits for in-flight rotations before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            output_root: None,
            interval_hours: default_interval_hours(),
            discovery_interval_secs: default_discovery_interval(),
            pot_label: default_pot_label(),
            stop_ack_timeout_secs: default_stop_ack_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_interval_hours() -> u64 {
    1
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_pot_label() -> String {
    DEFAULT_POT_LABEL.to_string()
}

fn default_stop_ack_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    30
}

/// Packet capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Bytes captured per packet
    #[serde(default = "default_snap_len")]
    pub snap_len: u32,

    /// Put the interface into promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,

    /// Idle period after which buffered records are flushed
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// tcpdump binary used by the capture backend
    #[serde(default = "default_tcpdump")]
    pub tcpdump_path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snap_len: default_snap_len(),
            promiscuous: true,
            read_timeout_ms: default_read_timeout(),
            tcpdump_path: default_tcpdump(),
        }
    }
}

fn default_snap_len() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_tcpdump() -> String {
    "tcpdump".to_string()
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// docker binary
    #[serde(default = "default_docker")]
    pub binary: String,

    /// Timeout for metadata commands, 0 disables it
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_docker() -> String {
    "docker".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

impl CollectorConfig {
    #[must_use]
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }

    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

impl CaptureConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DockerConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// The output root, which must be set before the collector starts
    pub fn output_root(&self) -> Result<&Path, ConfigError> {
        self.collector
            .output_root
            .as_deref()
            .ok_or_else(|| ConfigError::ValidationError("output root is not set".to_string()))
    }

    /// Reject values the collector cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.output_root()?;
        if root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "output root must not be empty".to_string(),
            ));
        }
        if self.collector.interval_hours == 0 {
            return Err(ConfigError::ValidationError(
                "interval_hours must be at least 1".to_string(),
            ));
        }
        if self.collector.discovery_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "discovery_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.collector.pot_label.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "pot_label must not be empty".to_string(),
            ));
        }
        if self.capture.snap_len == 0 {
            return Err(ConfigError::ValidationError(
                "snap_len must be at least 1".to_string(),
            ));
        }
        if self.capture.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "read_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
