//! Configuration management for BlueTransfer.
//!
//! This module handles loading, saving, and validating the configuration file.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/bluetransfer/config.toml` |
//! | macOS | `~/Library/Application Support/BlueTransfer/config.toml` |
//! | Windows | `%APPDATA%\BlueTransfer\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use bluetransfer_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Listening on port {}", config.network.port);
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transfer::EngineConfig;

/// Main configuration struct for BlueTransfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network settings
    pub network: NetworkConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port used for both requests and file data
    pub port: u16,
    /// Address the listener binds to
    pub bind_address: IpAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per DATA message
    pub chunk_size: usize,
    /// Read size used while hashing a file before sending it
    pub hash_chunk_size: usize,
    /// Bandwidth limit (bytes per second, None for unlimited)
    pub bandwidth_limit: Option<u64>,
    /// How often throughput is sampled and pushed to the UI
    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Duration,
    /// How long to wait for the peer to accept or reject a request
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Default output directory for received files
    pub default_output: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            hash_chunk_size: crate::DEFAULT_HASH_CHUNK_SIZE,
            bandwidth_limit: None,
            telemetry_interval: crate::DEFAULT_TELEMETRY_INTERVAL,
            response_timeout: crate::DEFAULT_RESPONSE_TIMEOUT,
            default_output: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(&path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that would make the engine misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| Error::InvalidConfig {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > crate::protocol::MAX_PAYLOAD_SIZE
        {
            return Err(invalid(
                "transfer.chunk_size",
                "must be between 1 byte and 16 MB",
            ));
        }
        if self.transfer.hash_chunk_size == 0 {
            return Err(invalid("transfer.hash_chunk_size", "must be positive"));
        }
        if self.transfer.bandwidth_limit == Some(0) {
            return Err(invalid(
                "transfer.bandwidth_limit",
                "must be positive, omit it for unlimited",
            ));
        }
        if self.transfer.telemetry_interval.is_zero() {
            return Err(invalid("transfer.telemetry_interval", "must be positive"));
        }
        Ok(())
    }

    /// Build the runtime engine settings from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bind_address: self.network.bind_address,
            port: self.network.port,
            chunk_size: self.transfer.chunk_size,
            hash_chunk_size: self.transfer.hash_chunk_size,
            bandwidth_limit: self.transfer.bandwidth_limit,
            telemetry_interval: self.transfer.telemetry_interval,
            response_timeout: self.transfer.response_timeout,
        }
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "bluetransfer", "BlueTransfer")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map_err(serde::de::Error::custom)
                        .and_then(|m| {
                            m.checked_mul(60)
                                .ok_or_else(|| serde::de::Error::custom("duration too large"))
                        })
                        .map(Duration::from_secs)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.port, 15556);
        assert_eq!(config.transfer.chunk_size, 8192);
        assert_eq!(config.transfer.telemetry_interval, Duration::from_millis(100));
        assert!(config.transfer.bandwidth_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.network.port = 12345;
        original.transfer.chunk_size = 4096;
        original.transfer.bandwidth_limit = Some(1_000_000);
        original.transfer.response_timeout = Duration::from_secs(90);

        let content = toml::to_string_pretty(&original).expect("serialize");
        std::fs::write(&config_path, &content).expect("write");

        let loaded_content = std::fs::read_to_string(&config_path).expect("read");
        let loaded: Config = toml::from_str(&loaded_content).expect("parse");

        assert_eq!(loaded.network.port, 12345);
        assert_eq!(loaded.transfer.chunk_size, 4096);
        assert_eq!(loaded.transfer.bandwidth_limit, Some(1_000_000));
        assert_eq!(loaded.transfer.response_timeout, Duration::from_secs(90));
        assert_eq!(loaded.transfer.telemetry_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[network]
port = 9999

[transfer]
telemetry_interval = "250ms"
response_timeout = "2m"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.network.port, 9999);
        assert_eq!(config.transfer.telemetry_interval, Duration::from_millis(250));
        assert_eq!(config.transfer.response_timeout, Duration::from_secs(120));
        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_invalid_duration() {
        let result: std::result::Result<Config, _> =
            toml::from_str("[transfer]\nresponse_timeout = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_huge_minute_duration_is_rejected() {
        let content = format!("[transfer]\nresponse_timeout = \"{}m\"\n", u64::MAX / 2);
        let result: std::result::Result<Config, _> = toml::from_str(&content);
        let err = result.expect_err("overflowing duration");
        assert!(err.to_string().contains("duration too large"), "{err}");
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;

        match config.validate() {
            Err(Error::InvalidConfig { key, .. }) => assert_eq!(key, "transfer.chunk_size"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = Config::default();
        config.network.port = 4000;
        config.transfer.bandwidth_limit = Some(512);

        let engine = config.engine_config();
        assert_eq!(engine.port, 4000);
        assert_eq!(engine.bandwidth_limit, Some(512));
        assert_eq!(engine.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(
            path.ends_with("config.toml"),
            "Config path should end with config.toml"
        );
    }
}
