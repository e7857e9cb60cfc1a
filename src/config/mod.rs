use crate::net::pool::PoolConfig;
use crate::utils::error::{Result, SockPoolError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SockPoolError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| SockPoolError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.pool.idle_timeout_ms == 0 {
            return Err(SockPoolError::Config(
                "pool.idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.connect.connect_timeout_ms == 0 {
            return Err(SockPoolError::Config(
                "pool.connect.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(SockPoolError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[pool]
idle_timeout_ms = 10000  # Close pooled connections unused for this long

[pool.connect]
connect_timeout_ms = 10000
tcp_nodelay = true

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            SockPoolError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.idle_timeout_ms, 10_000);
        assert_eq!(config.pool.connect.connect_timeout_ms, 10_000);
        assert!(config.pool.connect.tcp_nodelay);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.pool.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.connect.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = Config::from_toml("[pool]\nidle_timeout_ms = 250\n").unwrap();
        assert_eq!(config.pool.idle_timeout_ms, 250);
        assert_eq!(config.pool.connect.connect_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn example_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sockpool.toml");
        Config::create_example(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_file_is_config_error() {
        let result = Config::from_file("/nonexistent/sockpool.toml");
        assert!(matches!(result, Err(SockPoolError::Config(_))));
    }
}
