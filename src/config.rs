use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the bridge engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub adapter: AdapterConfig,
    pub policy: PolicyConfig,
    pub security: SecurityConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sustained requests per second allowed per client on public routes
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: u64,
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,
}

/// External-chain adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Base URL of the chain gateway exposing verify-burn / submit-mint
    pub base_url: String,
    #[serde(default = "default_adapter_timeout_secs")]
    pub timeout_secs: u64,
}

/// Settlement policy knobs
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Bounded retries for lost storage races before surfacing the error
    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,
    /// Retries for the mandatory post-mint-failure refund before escalating
    #[serde(default = "default_refund_retry_attempts")]
    pub refund_retry_attempts: u32,
    /// Age after which a non-terminal transaction is considered stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// How often the staleness watcher sweeps
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,
}

/// Security monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Critical events within the window strictly above this count trip the breaker
    #[serde(default = "default_critical_trip_threshold")]
    pub critical_trip_threshold: u64,
    #[serde(default = "default_trip_window_secs")]
    pub trip_window_secs: u64,
    /// Failed unlocks by one user within the window that flag a probing attack
    #[serde(default = "default_repeated_unlock_threshold")]
    pub repeated_unlock_threshold: u64,
}

/// Default functions
fn default_max_connections() -> u32 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_rate_per_second() -> u64 {
    5
}

fn default_rate_burst() -> u32 {
    20
}

fn default_adapter_timeout_secs() -> u64 {
    30
}

fn default_storage_retry_attempts() -> u32 {
    3
}

fn default_refund_retry_attempts() -> u32 {
    5
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_stale_check_interval_secs() -> u64 {
    60
}

fn default_critical_trip_threshold() -> u64 {
    3
}

fn default_trip_window_secs() -> u64 {
    3600
}

fn default_repeated_unlock_threshold() -> u64 {
    3
}

impl AdapterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PolicyConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }
}

impl SecurityConfig {
    pub fn trip_window(&self) -> Duration {
        Duration::from_secs(self.trip_window_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", default_max_connections()),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: env_parse("API_PORT", default_port()),
            rate_per_second: env_parse("API_RATE_PER_SECOND", default_rate_per_second()),
            rate_burst: env_parse("API_RATE_BURST", default_rate_burst()),
        };

        let adapter = AdapterConfig {
            base_url: env::var("CHAIN_GATEWAY_URL")
                .map_err(|_| eyre!("CHAIN_GATEWAY_URL environment variable is required"))?,
            timeout_secs: env_parse("CHAIN_GATEWAY_TIMEOUT_SECS", default_adapter_timeout_secs()),
        };

        let policy = PolicyConfig {
            storage_retry_attempts: env_parse(
                "STORAGE_RETRY_ATTEMPTS",
                default_storage_retry_attempts(),
            ),
            refund_retry_attempts: env_parse(
                "REFUND_RETRY_ATTEMPTS",
                default_refund_retry_attempts(),
            ),
            stale_after_secs: env_parse("STALE_AFTER_SECS", default_stale_after_secs()),
            stale_check_interval_secs: env_parse(
                "STALE_CHECK_INTERVAL_SECS",
                default_stale_check_interval_secs(),
            ),
        };

        let security = SecurityConfig {
            critical_trip_threshold: env_parse(
                "CRITICAL_TRIP_THRESHOLD",
                default_critical_trip_threshold(),
            ),
            trip_window_secs: env_parse("TRIP_WINDOW_SECS", default_trip_window_secs()),
            repeated_unlock_threshold: env_parse(
                "REPEATED_UNLOCK_THRESHOLD",
                default_repeated_unlock_threshold(),
            ),
        };

        let config = Config {
            database,
            api,
            adapter,
            policy,
            security,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(eyre!("database.max_connections must be at least 1"));
        }

        if self.adapter.base_url.is_empty() {
            return Err(eyre!("adapter.base_url cannot be empty"));
        }

        if !self.adapter.base_url.starts_with("http://")
            && !self.adapter.base_url.starts_with("https://")
        {
            return Err(eyre!("adapter.base_url must be an http(s) URL"));
        }

        if self.adapter.timeout_secs == 0 {
            return Err(eyre!("adapter.timeout_secs must be at least 1"));
        }

        if self.security.trip_window_secs == 0 {
            return Err(eyre!("security.trip_window_secs must be at least 1"));
        }

        if self.policy.stale_after_secs == 0 {
            return Err(eyre!("policy.stale_after_secs must be at least 1"));
        }

        if self.policy.stale_check_interval_secs == 0 {
            return Err(eyre!("policy.stale_check_interval_secs must be at least 1"));
        }

        if self.api.rate_per_second == 0 || self.api.rate_burst == 0 {
            return Err(eyre!("api rate limit values must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sample_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 10,
            },
            api: ApiConfig {
                bind_address: default_bind_address(),
                port: default_port(),
                rate_per_second: default_rate_per_second(),
                rate_burst: default_rate_burst(),
            },
            adapter: AdapterConfig {
                base_url: "http://localhost:9545".to_string(),
                timeout_secs: default_adapter_timeout_secs(),
            },
            policy: PolicyConfig {
                storage_retry_attempts: default_storage_retry_attempts(),
                refund_retry_attempts: default_refund_retry_attempts(),
                stale_after_secs: default_stale_after_secs(),
                stale_check_interval_secs: default_stale_check_interval_secs(),
            },
            security: SecurityConfig {
                critical_trip_threshold: default_critical_trip_threshold(),
                trip_window_secs: default_trip_window_secs(),
                repeated_unlock_threshold: default_repeated_unlock_threshold(),
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_adapter_timeout_secs(), 30);
        assert_eq!(default_critical_trip_threshold(), 3);
        assert_eq!(default_trip_window_secs(), 3600);
        assert_eq!(default_stale_after_secs(), 900);
        assert_eq!(default_refund_retry_attempts(), 5);
        assert_eq!(default_storage_retry_attempts(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_adapter_url() {
        let mut config = sample_config();
        assert!(config.validate().is_ok());

        config.adapter.base_url = "localhost:9545".to_string();
        assert!(config.validate().is_err());

        config.adapter.base_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_knobs() {
        let mut config = sample_config();
        config.security.trip_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.policy.stale_after_secs = 0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.api.rate_burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_url_is_redacted_in_debug() {
        let config = sample_config();
        let debug = format!("{:?}", config.database);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("postgres://"));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        env::set_var("DATABASE_URL", "postgres://localhost/bridge_test");
        env::set_var("CHAIN_GATEWAY_URL", "http://localhost:9545");
        env::set_var("CRITICAL_TRIP_THRESHOLD", "7");
        env::remove_var("TRIP_WINDOW_SECS");

        let config = Config::load_from_env().expect("config should load");
        assert_eq!(config.security.critical_trip_threshold, 7);
        assert_eq!(config.security.trip_window_secs, default_trip_window_secs());

        env::remove_var("DATABASE_URL");
        env::remove_var("CHAIN_GATEWAY_URL");
        env::remove_var("CRITICAL_TRIP_THRESHOLD");
    }

    #[test]
    #[serial]
    fn test_load_requires_database_url() {
        env::remove_var("DATABASE_URL");
        env::set_var("CHAIN_GATEWAY_URL", "http://localhost:9545");
        assert!(Config::load_from_env().is_err());
        env::remove_var("CHAIN_GATEWAY_URL");
    }
}
