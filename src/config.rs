//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
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
    /// Port number (e.g., 3000)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "forge.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://forge.example.com"
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

/// Federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Accept and send federated activities at all
    pub enabled: bool,
    /// Reject inbound activities that carry no valid HTTP signature
    pub signature_enforced: bool,
    /// Timeout applied to every outbound request
    pub http_timeout_seconds: u64,
    /// RSA modulus size for newly generated actor keys
    pub key_bits: usize,
    /// Interval between refresh sweeps of known federated users (0 disables)
    pub refresh_interval_seconds: u64,
    pub queue: QueueConfig,
}

/// Worker queue tuning shared by the pending, delivery and refresh queues
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Concurrent workers per queue
    pub workers: usize,
    /// Items handed to a handler per batch
    pub batch_size: usize,
    /// Idle workers look for due jobs at least this often
    pub poll_interval_ms: u64,
    /// A claimed job becomes available again after this long without being settled
    pub lease_seconds: u64,
    /// First retry delay in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound for retry delay
    pub max_backoff_seconds: u64,
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
    /// 4. Environment variables (FORGEFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/forgefed.db")?
            .set_default("federation.enabled", true)?
            .set_default("federation.signature_enforced", true)?
            .set_default("federation.http_timeout_seconds", 30)?
            .set_default("federation.key_bits", 3072)?
            .set_default("federation.refresh_interval_seconds", 86400)?
            .set_default("federation.queue.workers", 4)?
            .set_default("federation.queue.batch_size", 8)?
            .set_default("federation.queue.poll_interval_ms", 1000)?
            .set_default("federation.queue.lease_seconds", 300)?
            .set_default("federation.queue.base_backoff_ms", 500)?
            .set_default("federation.queue.max_backoff_seconds", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FORGEFED")
                    .prefix_separator("__")
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

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.federation.key_bits < 1024 {
            return Err(crate::error::AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        let queue = &self.federation.queue;
        if queue.workers == 0 || queue.batch_size == 0 || queue.poll_interval_ms == 0 {
            return Err(crate::error::AppError::Config(
                "federation.queue workers, batch_size and poll_interval_ms must be greater than 0"
                    .to_string(),
            ));
        }

        if queue.lease_seconds <= self.federation.http_timeout_seconds {
            return Err(crate::error::AppError::Config(
                "federation.queue.lease_seconds must exceed federation.http_timeout_seconds"
                    .to_string(),
            ));
        }

        if self.federation.http_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.http_timeout_seconds must be greater than 0".to_string(),
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
                port: 3000,
                domain: "forge.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/forgefed-test.db"),
            },
            federation: FederationConfig {
                enabled: true,
                signature_enforced: true,
                http_timeout_seconds: 30,
                key_bits: 2048,
                refresh_interval_seconds: 0,
                queue: QueueConfig {
                    workers: 2,
                    batch_size: 4,
                    poll_interval_ms: 50,
                    lease_seconds: 60,
                    base_backoff_ms: 10,
                    max_backoff_seconds: 1,
                },
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_protocol() {
        let mut config = valid_config();
        config.server.protocol = "ftp".to_string();
        assert!(matches!(
            config.validate(),
            Err(crate::error::AppError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid_config();
        config.federation.queue.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_lease_shorter_than_http_timeout() {
        let mut config = valid_config();
        config.federation.queue.lease_seconds = config.federation.http_timeout_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_weak_keys() {
        let mut config = valid_config();
        config.federation.key_bits = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn base_url_joins_protocol_and_domain() {
        assert_eq!(
            valid_config().server.base_url(),
            "https://forge.example.com"
        );
    }
}
