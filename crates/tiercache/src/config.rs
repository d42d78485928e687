use serde::{Deserialize, Serialize};
use std::time::Duration;
use tiercache_core::{CacheError, DEFAULT_SCOPE_SEPARATOR};

/// Settings for a hybrid cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridCacheSettings {
    /// Pub/sub channel carrying invalidation messages.
    /// All instances that must stay coherent share this name.
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Interval of the background expiration sweep in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// TTL applied by `set` when the caller passes none.
    /// Default: unset (entries live until removed or invalidated)
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,

    /// Separator placed between a scope name and the key
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Redis configuration for the distributed tier and the bus
    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_channel_name() -> String {
    "cache-messages".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    50
}

fn default_scope_separator() -> String {
    DEFAULT_SCOPE_SEPARATOR.to_string()
}

impl Default for HybridCacheSettings {
    fn default() -> Self {
        Self {
            channel_name: default_channel_name(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_ttl_secs: None,
            scope_separator: default_scope_separator(),
            logging: LoggingConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl HybridCacheSettings {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.channel_name.trim().is_empty() {
            return Err(CacheError::configuration("channel_name must not be empty"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CacheError::configuration("sweep_interval_ms must be > 0"));
        }
        if self.default_ttl_secs == Some(0) {
            return Err(CacheError::configuration(
                "default_ttl_secs must be > 0 when set",
            ));
        }
        if self.scope_separator.is_empty() {
            return Err(CacheError::configuration(
                "scope_separator must not be empty",
            ));
        }
        self.redis.validate()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Builder-style override of the channel name.
    pub fn with_channel_name(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    /// Builder-style override of the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis().max(1) as u64;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis configuration for the distributed tier and the invalidation bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Shared by the connection pool and the dedicated pub/sub connections.
    /// A trailing `/N` selects the logical database.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on pooled connections used for commands and `PUBLISH`.
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Applied to pool waits, connection creation and recycling.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.url.trim().is_empty() {
            return Err(CacheError::configuration("redis.url must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(CacheError::configuration("redis.pool_size must be > 0"));
        }
        if self.timeout_ms == 0 {
            return Err(CacheError::configuration("redis.timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub mod loader {
    use super::HybridCacheSettings;
    use config::{Config, Environment, File};
    use std::path::PathBuf;
    use tiercache_core::CacheError;

    pub fn load_settings(path: Option<&str>) -> Result<HybridCacheSettings, CacheError> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("tiercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., TIERCACHE__SWEEP_INTERVAL_MS=25
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::configuration(format!("config build error: {e}")))?;
        let merged: HybridCacheSettings = cfg
            .try_deserialize()
            .map_err(|e| CacheError::configuration(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = HybridCacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.channel_name, "cache-messages");
        assert_eq!(settings.sweep_interval(), Duration::from_millis(50));
        assert_eq!(settings.default_ttl(), None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let settings = HybridCacheSettings {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = HybridCacheSettings::default().with_channel_name("  ");
        assert!(settings.validate().is_err());

        let settings = HybridCacheSettings {
            default_ttl_secs: Some(0),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let mut settings = HybridCacheSettings::default();
        settings.redis.pool_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_with_sweep_interval_rounds_up_to_one_ms() {
        let settings = HybridCacheSettings::default().with_sweep_interval(Duration::from_micros(10));
        assert_eq!(settings.sweep_interval_ms, 1);
    }
}
