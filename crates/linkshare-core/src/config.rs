//! Configuration system for LinkShare
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/linkshare/config.toml
//! - Linux: ~/.config/linkshare/config.toml
//! - Windows: %APPDATA%/linkshare/config.toml
//!
//! The signal binary layers command-line flags and environment variables on
//! top of whatever the file provides.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::{
    DEFAULT_INACTIVITY_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_TOKEN_ALPHABET, DEFAULT_TOKEN_ATTEMPTS,
    DEFAULT_TOKEN_LENGTH,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Token and session lifecycle settings
    pub session: SessionConfig,
    /// Admission rate limiting
    pub limits: LimitsConfig,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Staging,
    #[default]
    Production,
}

impl Environment {
    /// Whether the protocol documentation endpoint is exposed
    pub fn shows_docs(self) -> bool {
        matches!(self, Environment::Local | Environment::Staging)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(name)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Environment::Local),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!("unknown environment: {}", other))),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for both WebSocket and HTTP endpoints
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Deployment environment
    pub environment: Environment,
    /// Use the first `X-Forwarded-For` address as the client origin
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            environment: Environment::default(),
            trust_forwarded_for: false,
        }
    }
}

/// Token and session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Issued token length in characters
    pub token_length: usize,
    /// Characters tokens are drawn from
    pub token_alphabet: String,
    /// Generation attempts before admission fails on collisions
    pub token_attempts: usize,
    /// Close connections silent for this long (seconds)
    pub inactivity_timeout_secs: u64,
    /// Messages queued per connection before a send counts as failed
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_length: DEFAULT_TOKEN_LENGTH,
            token_alphabet: DEFAULT_TOKEN_ALPHABET.to_string(),
            token_attempts: DEFAULT_TOKEN_ATTEMPTS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            outbound_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

/// Admission rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Connections admitted per origin within one window
    pub connections_per_window: u32,
    /// Moving window length in seconds
    pub window_secs: u64,
    /// How often idle origins are purged (seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_window: 10,
            window_secs: 60,
            cleanup_interval_secs: 60,
        }
    }
}

impl LimitsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
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

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "linkshare", "linkshare")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.token_length == 0 {
            return Err(ConfigError::Invalid("token_length must be > 0".into()));
        }
        if session.token_alphabet.is_empty() || !session.token_alphabet.is_ascii() {
            return Err(ConfigError::Invalid(
                "token_alphabet must be non-empty ASCII".into(),
            ));
        }
        let unique: HashSet<u8> = session.token_alphabet.bytes().collect();
        if unique.len() != session.token_alphabet.len() {
            return Err(ConfigError::Invalid(
                "token_alphabet must not repeat characters".into(),
            ));
        }
        if session.token_attempts == 0 {
            return Err(ConfigError::Invalid("token_attempts must be > 0".into()));
        }
        if session.inactivity_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "inactivity_timeout_secs must be > 0".into(),
            ));
        }
        if session.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be > 0".into()));
        }
        if self.limits.connections_per_window == 0 || self.limits.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "connections_per_window and window_secs must be > 0".into(),
            ));
        }
        if self.limits.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cleanup_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.session.token_length, 5);
        assert_eq!(config.session.token_attempts, 10);
        assert_eq!(config.server.environment, Environment::Production);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.session.token_alphabet, config.session.token_alphabet);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [session]
            token_length = 8

            [server]
            environment = "staging"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.token_length, 8);
        assert_eq!(config.server.environment, Environment::Staging);
        // Other values should be defaults
        assert_eq!(config.limits.connections_per_window, 10);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[session]"));
        assert!(sample.contains("[limits]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits]\nconnections_per_window = 3\nwindow_secs = 5").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.limits.connections_per_window, 3);
        assert_eq!(config.limits.window(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_load_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session\ntoken_length = ").unwrap();

        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.session.token_length = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.token_alphabet = "AAB".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.inactivity_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment() {
        assert!("local".parse::<Environment>().unwrap().shows_docs());
        assert!("Staging".parse::<Environment>().unwrap().shows_docs());
        assert!(!"production".parse::<Environment>().unwrap().shows_docs());
        assert!("qa".parse::<Environment>().is_err());
        assert_eq!(Environment::Local.to_string(), "local");
    }
}
