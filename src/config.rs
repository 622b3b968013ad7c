//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub instance: InstanceConfig,
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

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
    /// Username of the instance service actor used for signed fetches
    /// and relay subscriptions (default: "instance.actor")
    #[serde(default = "default_instance_actor")]
    pub actor_username: String,
}

fn default_instance_actor() -> String {
    "instance.actor".to_string()
}

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout for remote fetches and deliveries, in seconds (default: 10)
    pub request_timeout_secs: u64,
    /// Maximum redirect hops followed during resolution (default: 3)
    pub max_redirects: usize,
    /// Concurrent outbound deliveries per fan-out batch (default: 10)
    pub delivery_concurrency: usize,
    /// Delivery attempts before an activity is marked permanently failed
    /// (default: 3)
    pub delivery_attempts: u32,
    /// Base of the quadratic delivery backoff, in seconds (default: 60,
    /// giving attempt² minutes between attempts)
    pub retry_base_secs: u64,
    /// Freshness TTL for cached remote actors, in seconds (default: 86400)
    pub actor_cache_ttl_secs: u64,
    /// Mirror public local posts to accepted relays (default: true)
    pub mirror_to_relays: bool,
    /// Allow resolution/delivery to loopback and private addresses.
    /// Only for development and tests (default: false)
    #[serde(default)]
    pub allow_private_addresses: bool,
    /// Replay window for inbound request Date headers, in seconds
    /// (default: 300)
    pub signature_replay_window_secs: i64,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_secs)
    }
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
    /// 4. Environment variables (LAGOON_*)
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
            .set_default("instance.title", "Lagoon")?
            .set_default("instance.description", "A federated publishing node")?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.max_redirects", 3)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("federation.delivery_attempts", 3)?
            .set_default("federation.retry_base_secs", 60)?
            .set_default("federation.actor_cache_ttl_secs", 86_400)?
            .set_default("federation.mirror_to_relays", true)?
            .set_default("federation.signature_replay_window_secs", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (LAGOON_*)
            .add_source(
                Environment::with_prefix("LAGOON")
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
        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        match self.server.protocol.as_str() {
            "http" | "https" => {}
            other => {
                return Err(crate::error::AppError::Config(format!(
                    "server.protocol must be http or https, got {}",
                    other
                )));
            }
        }

        if self.federation.delivery_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_attempts must be at least 1".to_string(),
            ));
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be at least 1".to_string(),
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
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            instance: InstanceConfig {
                title: "Lagoon".to_string(),
                description: "Test instance".to_string(),
                actor_username: default_instance_actor(),
            },
            federation: FederationConfig {
                request_timeout_secs: 10,
                max_redirects: 3,
                delivery_concurrency: 10,
                delivery_attempts: 3,
                retry_base_secs: 60,
                actor_cache_ttl_secs: 86_400,
                mirror_to_relays: true,
                allow_private_addresses: false,
                signature_replay_window_secs: 300,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_default_shape() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_protocol() {
        let mut config = valid_config();
        config.server.protocol = "gopher".to_string();

        let error = config.validate().expect_err("unknown protocol must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol")
        ));
    }

    #[test]
    fn validate_rejects_zero_delivery_attempts() {
        let mut config = valid_config();
        config.federation.delivery_attempts = 0;

        let error = config.validate().expect_err("zero attempts must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("delivery_attempts")
        ));
    }
}
