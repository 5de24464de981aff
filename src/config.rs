//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout for outbound HTTP deliveries and actor fetches, in seconds
    pub delivery_timeout_seconds: u64,
    /// Maximum number of concurrent outbound deliveries
    pub max_concurrent_deliveries: usize,
    /// Page size for followers/following/outbox collections
    pub collection_page_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (ROOST_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.delivery_timeout_seconds", 15)?
            .set_default("federation.max_concurrent_deliveries", 10)?
            .set_default("federation.collection_page_size", 20)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (ROOST_*)
            .add_source(
                Environment::with_prefix("ROOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        match self.server.protocol.as_str() {
            "http" | "https" => {}
            other => {
                return Err(crate::error::AppError::Config(format!(
                    "server.protocol must be http or https, got: {}",
                    other
                )));
            }
        }

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.federation.delivery_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_concurrent_deliveries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_concurrent_deliveries must be greater than 0".to_string(),
            ));
        }

        if self.federation.collection_page_size == 0 {
            return Err(crate::error::AppError::Config(
                "federation.collection_page_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "example.test".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/roost-test.db"),
            },
            federation: FederationConfig {
                delivery_timeout_seconds: 15,
                max_concurrent_deliveries: 10,
                collection_page_size: 20,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_protocol() {
        let mut config = valid_config();
        config.server.protocol = "gopher".to_string();

        let error = config
            .validate()
            .expect_err("unknown protocols must be rejected");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol")
        ));
    }

    #[test]
    fn validate_rejects_zero_delivery_timeout() {
        let mut config = valid_config();
        config.federation.delivery_timeout_seconds = 0;

        let error = config
            .validate()
            .expect_err("zero delivery timeout must be rejected");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("delivery_timeout_seconds")
        ));
    }

    #[test]
    fn base_url_combines_protocol_and_domain() {
        let config = valid_config();
        assert_eq!(config.server.base_url(), "https://example.test");
    }
}
