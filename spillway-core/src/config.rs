//! Centralized configuration for the Spillway gateway.
//!
//! All tunable parameters live here, grouped into logical sections with
//! environment variable loading for the values operators must supply.

use std::path::PathBuf;
use std::time::Duration;

/// HTTP listen port used when neither `BIND_ADDR` nor `PORT` is set.
const DEFAULT_PORT: &str = "2040";

/// Persistence path for resolved channel access handles.
const DEFAULT_ACCESS_CACHE_FILE: &str = "channel_access_cache.json";

/// Errors raised while loading configuration from the environment.
///
/// Any of these is fatal at startup; the process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is absent or empty.
    #[error("missing required environment variable {name}")]
    MissingVar {
        /// Name of the absent variable.
        name: &'static str,
    },

    /// A variable is present but cannot be parsed.
    #[error("invalid value for {name}: {reason}")]
    InvalidVar {
        /// Name of the offending variable.
        name: &'static str,
        /// Human-readable description of the parse failure.
        reason: String,
    },
}

/// Central configuration for all gateway components.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream platform credentials and the source channel.
    pub upstream: UpstreamConfig,
    /// HTTP server settings.
    pub http: HttpConfig,
    /// Cache sizing and persistence settings.
    pub cache: CacheConfig,
    /// Streaming and failover settings.
    pub streaming: StreamingConfig,
}

/// Upstream application credentials and the channel to re-export.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Application id issued by the upstream platform.
    pub api_id: i32,
    /// Application hash paired with `api_id`.
    pub api_hash: String,
    /// Raw bot credentials; each one becomes a pool worker.
    pub bot_tokens: Vec<String>,
    /// Signed identifier of the source channel.
    pub channel_id: i64,
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Address the server binds to.
    pub bind_addr: String,
    /// How long in-flight requests may drain after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            shutdown_grace: Duration::from_secs(15),
        }
    }
}

/// Cache sizing and persistence settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of a cached file location.
    pub location_ttl: Duration,
    /// Entry cap for the location cache before LRU eviction.
    pub location_capacity: usize,
    /// Path of the persisted channel access map.
    pub access_cache_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            location_ttl: Duration::from_secs(3 * 60 * 60),
            location_capacity: 4096,
            access_cache_path: PathBuf::from(DEFAULT_ACCESS_CACHE_FILE),
        }
    }
}

/// Streaming and failover settings.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Upper bound on workers tried for one request, including the first.
    pub max_attempts: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl GatewayConfig {
    /// Loads configuration from the environment.
    ///
    /// `API_ID`, `API_HASH`, `BOT_TOKENS`, and `CHANNEL_ID` are required.
    /// The listen address comes from `BIND_ADDR`, falling back to
    /// `0.0.0.0:$PORT` and then to port 2040; `CHANNEL_CACHE_FILE`
    /// overrides the access-map persistence path.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required variable is missing or a
    /// present variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_id = require("API_ID")?
            .parse::<i32>()
            .map_err(|err| ConfigError::InvalidVar {
                name: "API_ID",
                reason: err.to_string(),
            })?;
        let api_hash = require("API_HASH")?;

        let bot_tokens: Vec<String> = require("BOT_TOKENS")?
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(String::from)
            .collect();
        if bot_tokens.is_empty() {
            return Err(ConfigError::InvalidVar {
                name: "BOT_TOKENS",
                reason: "no usable tokens in list".to_string(),
            });
        }

        let channel_id = require("CHANNEL_ID")?
            .parse::<i64>()
            .map_err(|err| ConfigError::InvalidVar {
                name: "CHANNEL_ID",
                reason: err.to_string(),
            })?;

        let bind_addr = match optional("BIND_ADDR") {
            Some(addr) => addr,
            None => {
                let port = optional("PORT").unwrap_or_else(|| DEFAULT_PORT.to_string());
                format!("0.0.0.0:{port}")
            }
        };

        let mut cache = CacheConfig::default();
        if let Some(path) = optional("CHANNEL_CACHE_FILE") {
            cache.access_cache_path = PathBuf::from(path);
        }

        Ok(Self {
            upstream: UpstreamConfig {
                api_id,
                api_hash,
                bot_tokens,
                channel_id,
            },
            http: HttpConfig {
                bind_addr,
                ..HttpConfig::default()
            },
            cache,
            streaming: StreamingConfig::default(),
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar { name }),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_defaults() {
        let http = HttpConfig::default();
        assert_eq!(http.bind_addr, "0.0.0.0:2040");
        assert_eq!(http.shutdown_grace, Duration::from_secs(15));

        let cache = CacheConfig::default();
        assert_eq!(cache.location_ttl, Duration::from_secs(3 * 60 * 60));
        assert_eq!(cache.location_capacity, 4096);
        assert_eq!(
            cache.access_cache_path,
            PathBuf::from("channel_access_cache.json")
        );

        assert_eq!(StreamingConfig::default().max_attempts, 2);
    }

    #[test]
    fn test_from_env_round_trip() {
        unsafe {
            std::env::remove_var("BIND_ADDR");
            std::env::set_var("API_ID", "424242");
            std::env::set_var("API_HASH", "deadbeef");
            std::env::set_var("BOT_TOKENS", "101:alpha, 202:beta,,");
            std::env::set_var("CHANNEL_ID", "-1001234567");
            std::env::set_var("PORT", "8099");
            std::env::set_var("CHANNEL_CACHE_FILE", "/tmp/spillway-access.json");
        }

        let config = GatewayConfig::from_env().expect("config should load");

        assert_eq!(config.upstream.api_id, 424242);
        assert_eq!(config.upstream.api_hash, "deadbeef");
        assert_eq!(config.upstream.bot_tokens, vec!["101:alpha", "202:beta"]);
        assert_eq!(config.upstream.channel_id, -1_001_234_567);
        assert_eq!(config.http.bind_addr, "0.0.0.0:8099");
        assert_eq!(
            config.cache.access_cache_path,
            PathBuf::from("/tmp/spillway-access.json")
        );

        // With a required variable gone, loading must fail fast.
        unsafe {
            std::env::remove_var("API_ID");
        }
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(ConfigError::MissingVar { name: "API_ID" })
        ));

        unsafe {
            std::env::remove_var("API_HASH");
            std::env::remove_var("BOT_TOKENS");
            std::env::remove_var("CHANNEL_ID");
            std::env::remove_var("PORT");
            std::env::remove_var("CHANNEL_CACHE_FILE");
        }
    }
}
