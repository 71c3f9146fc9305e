//! Configuration management for Handoff.
//!
//! This module handles loading, saving, and validating Handoff configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/handoff/config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use handoff_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Buffer capacity: {}", config.transfer.capacity);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::Backend;

/// Main configuration struct for Handoff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer settings
    pub transfer: TransferConfig,
    /// IPC key settings
    pub ipc: IpcConfig,
    /// Wait budgets
    pub timeouts: TimeoutConfig,
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Shared buffer capacity in bytes
    pub capacity: usize,
    /// Synchronizer backend
    pub backend: Backend,
    /// Default output file for the receiver
    pub output: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::DEFAULT_CAPACITY,
            backend: Backend::default(),
            output: PathBuf::from(crate::DEFAULT_OUTPUT),
        }
    }
}

/// IPC key derivation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// File whose inode seeds the System V key
    pub key_file: PathBuf,
    /// Project id mixed into the key
    pub project_id: char,
    /// Create the key file when it is missing
    pub create_key_file: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from(crate::DEFAULT_KEY_FILE),
            project_id: crate::DEFAULT_PROJECT_ID,
            create_key_file: true,
        }
    }
}

/// Timeouts and polling intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long to wait for the peer to attach
    #[serde(with = "duration_text")]
    pub peer_discovery: Duration,
    /// How long a single handshake wait may block (0 disables)
    #[serde(with = "duration_text")]
    pub handshake: Duration,
    /// First discovery poll interval
    #[serde(with = "duration_text")]
    pub poll_interval: Duration,
    /// Slice after which a blocked wait checks the peer still exists
    #[serde(with = "duration_text")]
    pub liveness_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            peer_discovery: Duration::from_secs(60),
            handshake: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            liveness_interval: Duration::from_millis(500),
        }
    }
}

impl TimeoutConfig {
    /// Handshake budget, `None` when waits are unbounded.
    #[must_use]
    pub fn handshake_budget(&self) -> Option<Duration> {
        (!self.handshake.is_zero()).then_some(self.handshake)
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
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
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
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that would otherwise fail deep inside a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.capacity == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        // Chunk lengths travel as a C int in both backends.
        if i32::try_from(self.transfer.capacity).is_err() {
            return Err(Error::InvalidConfig {
                key: "transfer.capacity".to_string(),
                reason: format!("must not exceed {}", i32::MAX),
            });
        }
        if self.ipc.project_id == '\0' || !self.ipc.project_id.is_ascii() {
            return Err(Error::InvalidConfig {
                key: "ipc.project_id".to_string(),
                reason: "must be a non-NUL ASCII character".to_string(),
            });
        }
        for (key, value) in [
            ("timeouts.poll_interval", self.timeouts.poll_interval),
            ("timeouts.liveness_interval", self.timeouts.liveness_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "handoff", "Handoff")
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

/// Parse a whole-number duration with a unit suffix: `ms`, `s`, `m` or `h`.
#[must_use]
pub fn parse_duration(text: &str) -> Option<Duration> {
    const UNITS: [(&str, u64); 4] = [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];

    let text = text.trim();
    let (digits, unit) = text.split_at(text.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = digits.parse().ok()?;
    let (_, millis) = UNITS.iter().find(|(name, _)| *name == unit)?;
    value.checked_mul(*millis).map(Duration::from_millis)
}

mod duration_text {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).ok_or_else(|| {
            D::Error::custom(format!("invalid duration '{text}' (expected e.g. 500ms, 30s, 2m)"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.transfer.capacity, crate::DEFAULT_CAPACITY);
        assert_eq!(config.transfer.backend, Backend::Signal);
        assert_eq!(config.transfer.output, PathBuf::from("recvfile"));
        assert_eq!(config.ipc.project_id, 'a');
        assert_eq!(config.timeouts.peer_discovery, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.transfer.capacity = 4096;
        original.transfer.backend = Backend::Queue;
        original.ipc.project_id = 'z';
        original.timeouts.poll_interval = Duration::from_millis(50);

        original.save_to(&config_path).expect("save");
        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded.transfer.capacity, 4096);
        assert_eq!(loaded.transfer.backend, Backend::Queue);
        assert_eq!(loaded.ipc.project_id, 'z');
        assert_eq!(loaded.timeouts.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.capacity, crate::DEFAULT_CAPACITY);
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[transfer]
backend = "queue"

[timeouts]
handshake = "0s"
peer_discovery = "2m"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.transfer.backend, Backend::Queue);
        assert_eq!(config.transfer.capacity, crate::DEFAULT_CAPACITY);
        assert_eq!(config.timeouts.handshake_budget(), None);
        assert_eq!(config.timeouts.peer_discovery, Duration::from_secs(120));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration(" 5m "), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("2d"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_duration_fields_serialize_as_text() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("handshake = \"30s\""));
        assert!(toml_str.contains("poll_interval = \"250ms\""));
        assert!(toml_str.contains("backend = \"signal\""));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref key, .. }) if key == "transfer.capacity"
        ));

        let mut config = Config::default();
        config.transfer.capacity = usize::try_from(i64::from(i32::MAX) + 1).unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ipc.project_id = '\0';
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\ncapacity = \"lots\"\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }
}
