use avatar_sync_core::{CacheLocation, ServiceEndpoint};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_host: String,
    pub use_tls: bool,
    pub cache_dir: PathBuf,
    pub cache_file: String,
    pub avatar_dir: PathBuf,
    pub broadcast_interval: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_host = std::env::var("SYNC_API_HOST")
            .ok()
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("SYNC_API_HOST".to_string()))?;
        if api_host.contains("://") {
            return Err(ConfigError::InvalidValue(
                "SYNC_API_HOST".to_string(),
                "expected host[:port] without a scheme; use SYNC_USE_TLS for https/wss"
                    .to_string(),
            ));
        }

        let use_tls = match std::env::var("SYNC_USE_TLS") {
            Ok(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "SYNC_USE_TLS".to_string(),
                    format!("'{}' is not a boolean", value),
                )
            })?,
            Err(_) => false,
        };

        let cache_dir = std::env::var("SYNC_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./network"));
        let cache_file =
            std::env::var("SYNC_CACHE_FILE").unwrap_or_else(|_| "session.json".to_string());
        let avatar_dir = std::env::var("SYNC_AVATAR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./avatars"));

        let interval_str =
            std::env::var("SYNC_BROADCAST_INTERVAL_MS").unwrap_or_else(|_| "50".to_string());
        let interval_ms = interval_str
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "SYNC_BROADCAST_INTERVAL_MS".to_string(),
                    format!("'{}' is not a positive number of milliseconds", interval_str),
                )
            })?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_host,
            use_tls,
            cache_dir,
            cache_file,
            avatar_dir,
            broadcast_interval: Duration::from_millis(interval_ms),
            log_level,
        })
    }

    pub fn endpoint(&self) -> ServiceEndpoint {
        ServiceEndpoint::new(self.api_host.clone(), self.use_tls)
    }

    pub fn cache_location(&self) -> CacheLocation {
        CacheLocation::new(self.cache_dir.clone(), self.cache_file.clone())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
