//! Configuration management module for CoentroVPN.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the account service and its tooling.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON formatted records (default: false)
    #[serde(default)]
    pub json: bool,

    /// Also write records to a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for rolling log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Base file name for rolling log files (default: "coentro-account")
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file_name() -> String {
    "coentro-account".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            json: false,
            log_to_file: false,
            log_dir: default_log_dir(),
            log_file_name: default_log_file_name(),
        }
    }
}

/// Local IPC endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Unix socket the account service listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Per-frame write timeout in milliseconds (default: 5000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Largest frame accepted from a peer, in bytes (default: 1 MiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_socket_path() -> String {
    "/var/run/coentrovpn/account.sock".to_string()
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            socket_path: default_socket_path(),
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl IpcConfig {
    /// Returns the write timeout as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Account session coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Reject state writes issued before a newer write to the same field
    /// (default: true)
    #[serde(default = "default_true")]
    pub stale_write_guard: bool,

    /// Refresh the account expiry whenever the daemon reports a new account
    /// number (default: true)
    #[serde(default = "default_true")]
    pub auto_fetch_expiry: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            stale_write_guard: default_true(),
            auto_fetch_expiry: default_true(),
        }
    }
}

/// Main configuration structure for the CoentroVPN account service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// IPC endpoint configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Account coordinator configuration
    #[serde(default)]
    pub account: AccountConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            ipc: IpcConfig::default(),
            account: AccountConfig::default(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load from `path`, resolving overrides through `var`. The environment
    /// wins over the file and the merged result is validated.
    fn load_with_env<P: AsRef<Path>>(
        path: P,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        Self::apply_env_overrides(&mut config, var);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                message: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }

        if self.ipc.socket_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ipc.socket_path".to_string(),
                message: "socket path cannot be empty".to_string(),
            });
        }

        if self.ipc.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ipc.write_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.ipc.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ipc.max_frame_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.logging.log_to_file && self.logging.log_dir.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "logging.log_dir".to_string(),
                message: "log directory cannot be empty when log_to_file=true".to_string(),
            });
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: COENTROVPN_)
    /// Keys:
    /// - COENTROVPN_LOG_LEVEL
    /// - COENTROVPN_LOGGING_JSON, COENTROVPN_LOGGING_TO_FILE, COENTROVPN_LOGGING_DIR
    /// - COENTROVPN_IPC_SOCKET_PATH, COENTROVPN_IPC_WRITE_TIMEOUT_MS, COENTROVPN_IPC_MAX_FRAME_BYTES
    /// - COENTROVPN_ACCOUNT_STALE_WRITE_GUARD, COENTROVPN_ACCOUNT_AUTO_FETCH_EXPIRY
    fn apply_env_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Some(v) = var("COENTROVPN_LOG_LEVEL") {
            cfg.log_level = v;
        }

        // Logging
        if let Some(b) = var("COENTROVPN_LOGGING_JSON").as_deref().and_then(parse_bool) {
            cfg.logging.json = b;
        }
        if let Some(b) = var("COENTROVPN_LOGGING_TO_FILE")
            .as_deref()
            .and_then(parse_bool)
        {
            cfg.logging.log_to_file = b;
        }
        if let Some(v) = var("COENTROVPN_LOGGING_DIR") {
            if !v.is_empty() {
                cfg.logging.log_dir = v;
            }
        }

        // IPC
        if let Some(v) = var("COENTROVPN_IPC_SOCKET_PATH") {
            if !v.is_empty() {
                cfg.ipc.socket_path = v;
            }
        }
        if let Some(n) = var("COENTROVPN_IPC_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.ipc.write_timeout_ms = n;
        }
        if let Some(n) = var("COENTROVPN_IPC_MAX_FRAME_BYTES").and_then(|v| v.parse().ok()) {
            cfg.ipc.max_frame_bytes = n;
        }

        // Account
        if let Some(b) = var("COENTROVPN_ACCOUNT_STALE_WRITE_GUARD")
            .as_deref()
            .and_then(parse_bool)
        {
            cfg.account.stale_write_guard = b;
        }
        if let Some(b) = var("COENTROVPN_ACCOUNT_AUTO_FETCH_EXPIRY")
            .as_deref()
            .and_then(parse_bool)
        {
            cfg.account.auto_fetch_expiry = b;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("coentrovpn").join("account.toml")
        } else {
            PathBuf::from("account.toml")
        }
    }

    /// Load the configuration at `path`, or the defaults (with environment
    /// overrides) when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = Config::default();
                Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.ipc.socket_path, "/var/run/coentrovpn/account.sock");
        assert_eq!(config.ipc.write_timeout(), Duration::from_secs(5));
        assert!(config.account.stale_write_guard);
        assert!(config.account.auto_fetch_expiry);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "debug"

            [ipc]
            socket_path = "/tmp/coentro-account.sock"
            max_frame_bytes = 4096

            [account]
            stale_write_guard = false
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.ipc.socket_path, "/tmp/coentro-account.sock");
        assert_eq!(config.ipc.max_frame_bytes, 4096);
        assert_eq!(config.ipc.write_timeout_ms, 5_000);
        assert!(!config.account.stale_write_guard);
        assert!(config.account.auto_fetch_expiry);
    }

    #[test]
    fn test_save_config() {
        let config = Config {
            log_level: "warn".to_string(),
            account: AccountConfig {
                auto_fetch_expiry: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.log_level, "warn");
        assert!(!loaded.account.auto_fetch_expiry);
        assert!(loaded.account.stale_write_guard);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_validation() {
        let config = Config {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ipc: IpcConfig {
                socket_path: "  ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ipc: IpcConfig {
                write_timeout_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("COENTROVPN_LOG_LEVEL", "trace"),
            ("COENTROVPN_IPC_SOCKET_PATH", "/run/acct.sock"),
            ("COENTROVPN_IPC_WRITE_TIMEOUT_MS", "250"),
            ("COENTROVPN_ACCOUNT_STALE_WRITE_GUARD", "no"),
            ("COENTROVPN_ACCOUNT_AUTO_FETCH_EXPIRY", "garbage"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        Config::apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.ipc.socket_path, "/run/acct.sock");
        assert_eq!(config.ipc.write_timeout_ms, 250);
        assert!(!config.account.stale_write_guard);
        // Unparseable values leave the setting alone
        assert!(config.account.auto_fetch_expiry);
    }

    #[test]
    fn test_env_override_repairs_invalid_file_value() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"log_level = \"loud\"\n").unwrap();

        assert!(matches!(
            Config::load_with_env(file.path(), |_| None),
            Err(ConfigError::InvalidValue { .. })
        ));

        let config = Config::load_with_env(file.path(), |key| {
            (key == "COENTROVPN_LOG_LEVEL").then(|| "debug".to_string())
        })
        .unwrap();
        assert_eq!(config.log_level, "debug");
    }
}
