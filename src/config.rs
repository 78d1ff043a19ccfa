//! Runtime configuration parsing.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::context::{Encoding, Options};
use crate::platform::{DEFAULT_TIMEOUT, Platform};

pub use crate::bridge::memory::DEFAULT_MEMORY_SIZE as DEFAULT_CONNECTION_MEMORY;
use crate::bridge::memory::ARENA_START;

/// Runtime configuration loaded from a TOML file.
///
/// Every section is optional:
///
/// ```toml
/// [options]
/// encoding = "utf-16"
///
/// [connection]
/// memory_size = 131072
/// timeout_ms = 5000
///
/// [logging]
/// level = "debug"
/// format = "json"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Call options.
    pub options: Options,
    /// Bridge connection settings.
    pub connection: ConnectionConfig,
    /// Subscriber settings, used by binaries.
    pub logging: LoggingConfig,
}

/// Bridge connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Size of each end's transfer buffer.
    pub memory_size: usize,
    /// How long a worker waits for main to answer a call.
    pub timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_CONNECTION_MEMORY,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `wit_bridge=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.memory_size <= ARENA_START as usize {
            return Err(ConfigError::Invalid(format!(
                "connection.memory_size must be larger than the {} byte header",
                ARENA_START
            )));
        }
        if u32::try_from(self.connection.memory_size).is_err() {
            return Err(ConfigError::Invalid("connection.memory_size must fit in 32 bits".to_string()));
        }
        if self.connection.timeout_ms == 0 {
            return Err(ConfigError::Invalid("connection.timeout_ms must be positive".to_string()));
        }
        if self.options.encoding == Encoding::Latin1Utf16 {
            return Err(ConfigError::Invalid("the latin1+utf-16 encoding is not supported".to_string()));
        }
        Ok(())
    }

    /// Call options for a [`WasmContext`](crate::WasmContext).
    pub fn options(&self) -> Options {
        self.options
    }

    /// A platform using the configured timeout.
    pub fn platform(&self) -> Platform {
        Platform::default().with_timeout(self.connection.timeout())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(String, std::io::Error),
    /// TOML parse error.
    Parse(toml::de::Error),
    /// A value out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Failed to read config file '{}': {}", path, e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(message) => write!(f, "Invalid config: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[options]
encoding = "utf-16"

[connection]
memory_size = 131072
timeout_ms = 250

[logging]
level = "wit_bridge=debug"
format = "json"
"#;
        let config = RuntimeConfig::from_str(toml).unwrap();
        assert_eq!(config.options().encoding, Encoding::Utf16);
        assert_eq!(config.connection.memory_size, 131072);
        assert_eq!(config.platform().default_timeout(), Duration::from_millis(250));
        assert_eq!(config.logging.level, "wit_bridge=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_str("").unwrap();
        assert_eq!(config.options().encoding, Encoding::Utf8);
        assert_eq!(config.connection.memory_size, DEFAULT_CONNECTION_MEMORY);
        assert_eq!(config.connection.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let tiny = "[connection]\nmemory_size = 8\n";
        assert!(matches!(RuntimeConfig::from_str(tiny), Err(ConfigError::Invalid(_))));

        let header_only = format!("[connection]\nmemory_size = {}\n", ARENA_START);
        assert!(matches!(RuntimeConfig::from_str(&header_only), Err(ConfigError::Invalid(_))));
        let smallest = format!("[connection]\nmemory_size = {}\n", ARENA_START + 1);
        assert!(RuntimeConfig::from_str(&smallest).is_ok());

        let legacy = "[options]\nencoding = \"latin1+utf-16\"\n";
        assert!(matches!(RuntimeConfig::from_str(legacy), Err(ConfigError::Invalid(_))));

        let unknown = "[connection]\nsize = 8\n";
        assert!(matches!(RuntimeConfig::from_str(unknown), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::from_file("/nonexistent/wit-bridge.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wit-bridge.toml"));
    }
}
