//! Configuration for the cache engine and individual caches.
//!
//! Loaded from an optional TOML file plus `TIERCACHE__*` environment
//! overrides, e.g. `TIERCACHE__ENGINE__LOCK_TTL_MS=20000`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tiercache_store::RedisConfig;

use crate::error::{CacheError, CacheResult};
use crate::refresh::MAX_REFRESH_SLOTS;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tiercache.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TIERCACHE";

/// Longest TTL accepted for either tier: ten years.
pub const MAX_TTL_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// When the in-process expiry timer is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireMode {
    /// Reset only when the entry is written.
    #[default]
    AfterWrite,
    /// Reset on every read.
    AfterAccess,
}

/// In-process tier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstTierSettings {
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    #[serde(default = "default_maximum_size")]
    pub maximum_size: u64,

    /// Entry lifetime in milliseconds
    #[serde(default = "default_first_expire_ms")]
    pub expire_ms: u64,

    #[serde(default)]
    pub expire_mode: ExpireMode,
}

fn default_initial_capacity() -> usize {
    10
}

fn default_maximum_size() -> u64 {
    500
}

fn default_first_expire_ms() -> u64 {
    60_000
}

impl Default for FirstTierSettings {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            maximum_size: default_maximum_size(),
            expire_ms: default_first_expire_ms(),
            expire_mode: ExpireMode::default(),
        }
    }
}

impl FirstTierSettings {
    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms)
    }
}

/// Distributed tier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondTierSettings {
    /// Entry lifetime in milliseconds
    #[serde(default = "default_expiration_ms")]
    pub expiration_ms: u64,

    /// Refresh window before expiry in milliseconds
    #[serde(default = "default_preload_ms")]
    pub preload_ms: u64,

    /// Reload the value inside the refresh window instead of extending its TTL
    #[serde(default)]
    pub force_refresh: bool,

    /// Store keys as `<name>:<key>`; required for `clear`
    #[serde(default = "default_use_prefix")]
    pub use_prefix: bool,

    /// Cache null loader results
    #[serde(default)]
    pub allow_null: bool,

    /// Divisor applied to the TTL and refresh window of cached nulls
    #[serde(default = "default_magnification")]
    pub magnification: u32,
}

fn default_expiration_ms() -> u64 {
    3_600_000
}

fn default_preload_ms() -> u64 {
    720_000
}

fn default_use_prefix() -> bool {
    true
}

fn default_magnification() -> u32 {
    1
}

impl Default for SecondTierSettings {
    fn default() -> Self {
        Self {
            expiration_ms: default_expiration_ms(),
            preload_ms: default_preload_ms(),
            force_refresh: false,
            use_prefix: default_use_prefix(),
            allow_null: false,
            magnification: default_magnification(),
        }
    }
}

impl SecondTierSettings {
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    pub fn preload(&self) -> Duration {
        Duration::from_millis(self.preload_ms)
    }

    /// TTL for a cached null.
    pub fn null_expiration(&self) -> Duration {
        self.expiration() / self.magnification.max(1)
    }

    /// Refresh window for a cached null.
    pub fn null_preload(&self) -> Duration {
        self.preload() / self.magnification.max(1)
    }
}

/// Full settings of one named cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Keep an in-process tier in front of the distributed tier
    #[serde(default = "default_use_first_tier")]
    pub use_first_tier: bool,

    #[serde(default)]
    pub first: FirstTierSettings,

    #[serde(default)]
    pub second: SecondTierSettings,
}

fn default_use_first_tier() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            use_first_tier: default_use_first_tier(),
            first: FirstTierSettings::default(),
            second: SecondTierSettings::default(),
        }
    }
}

impl CacheSettings {
    pub fn new(first: FirstTierSettings, second: SecondTierSettings) -> Self {
        Self {
            use_first_tier: true,
            first,
            second,
        }
    }

    /// Identity string distinguishing differently-configured caches sharing a name.
    ///
    /// Format: `<first expire ms>-<second expiration ms>-<preload ms>`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}-{}-{}",
            self.first.expire_ms, self.second.expiration_ms, self.second.preload_ms
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        let first = &self.first;
        if first.maximum_size == 0 {
            return Err("first.maximum_size must be > 0".into());
        }
        if first.initial_capacity as u64 > first.maximum_size {
            return Err("first.initial_capacity must be <= first.maximum_size".into());
        }
        if first.expire_ms == 0 {
            return Err("first.expire_ms must be > 0".into());
        }
        if first.expire_ms > MAX_TTL_MS {
            return Err(format!("first.expire_ms must be <= {MAX_TTL_MS}"));
        }

        let second = &self.second;
        if second.expiration_ms == 0 {
            return Err("second.expiration_ms must be > 0".into());
        }
        if second.expiration_ms > MAX_TTL_MS {
            return Err(format!("second.expiration_ms must be <= {MAX_TTL_MS}"));
        }
        if second.preload_ms >= second.expiration_ms {
            return Err("second.preload_ms must be < second.expiration_ms".into());
        }
        if second.magnification == 0 {
            return Err("second.magnification must be >= 1".into());
        }
        if second.magnification > 1 && !second.allow_null {
            return Err("second.magnification > 1 requires second.allow_null=true".into());
        }
        if second.expiration_ms / u64::from(second.magnification) == 0 {
            return Err("second.expiration_ms / second.magnification must be >= 1ms".into());
        }
        Ok(())
    }
}

/// Engine-wide tuning shared by every cache of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of distributed locks; bounds how long a crashed holder blocks others
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long a blocking lock acquire polls before giving up
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,

    /// Attempts of the lock-serialized load before loading unprotected
    #[serde(default = "default_load_retry_count")]
    pub load_retry_count: u32,

    /// Wait between load attempts in milliseconds
    #[serde(default = "default_load_wait_ms")]
    pub load_wait_ms: u64,

    /// Upper bound for a single loader call
    #[serde(default = "default_loader_timeout_ms")]
    pub loader_timeout_ms: u64,

    /// Hard refreshes allowed to run at the same time
    #[serde(default = "default_max_concurrent_refreshes")]
    pub max_concurrent_refreshes: usize,

    /// Reject a second settings fingerprint under an already registered name
    #[serde(default)]
    pub strict_settings: bool,
}

fn default_lock_ttl_ms() -> u64 {
    10_000
}

fn default_lock_acquire_timeout_ms() -> u64 {
    500
}

fn default_load_retry_count() -> u32 {
    20
}

fn default_load_wait_ms() -> u64 {
    20
}

fn default_loader_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent_refreshes() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
            load_retry_count: default_load_retry_count(),
            load_wait_ms: default_load_wait_ms(),
            loader_timeout_ms: default_loader_timeout_ms(),
            max_concurrent_refreshes: default_max_concurrent_refreshes(),
            strict_settings: false,
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn load_wait(&self) -> Duration {
        Duration::from_millis(self.load_wait_ms)
    }

    pub fn loader_timeout(&self) -> Duration {
        Duration::from_millis(self.loader_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lock_ttl_ms == 0 {
            return Err("engine.lock_ttl_ms must be > 0".into());
        }
        if self.load_wait_ms == 0 {
            return Err("engine.load_wait_ms must be > 0".into());
        }
        if self.loader_timeout_ms == 0 {
            return Err("engine.loader_timeout_ms must be > 0".into());
        }
        // A loader outliving the lock would let a second process load concurrently.
        if self.loader_timeout_ms > self.lock_ttl_ms {
            return Err("engine.loader_timeout_ms must be <= engine.lock_ttl_ms".into());
        }
        if self.max_concurrent_refreshes == 0 {
            return Err("engine.max_concurrent_refreshes must be > 0".into());
        }
        if self.max_concurrent_refreshes > MAX_REFRESH_SLOTS {
            return Err(format!(
                "engine.max_concurrent_refreshes must be <= {MAX_REFRESH_SLOTS}"
            ));
        }
        Ok(())
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

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierCacheConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Settings for caches without an entry in `caches`
    #[serde(default)]
    pub defaults: CacheSettings,
    /// Per-name cache settings
    #[serde(default)]
    pub caches: BTreeMap<String, CacheSettings>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TierCacheConfig {
    /// Settings for `name`, falling back to `defaults`.
    pub fn settings_for(&self, name: &str) -> &CacheSettings {
        self.caches.get(name).unwrap_or(&self.defaults)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.redis.validate()?;
        self.engine.validate()?;
        self.defaults
            .validate()
            .map_err(|e| format!("defaults: {e}"))?;
        for (name, settings) in &self.caches {
            settings
                .validate()
                .map_err(|e| format!("caches.{name}: {e}"))?;
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Load configuration from `path` (or [`DEFAULT_CONFIG_FILE`]) and the environment.
///
/// A missing file is not an error; defaults and environment overrides still apply.
pub fn load_config(path: Option<&str>) -> CacheResult<TierCacheConfig> {
    let mut builder = Config::builder();
    let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
    if pathbuf.exists() {
        builder = builder.add_source(File::from(pathbuf));
    }
    // Environment variable overrides, e.g., TIERCACHE__REDIS__URL=redis://cache:6379
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .separator("__"),
    );
    let cfg = builder
        .build()
        .map_err(|e| CacheError::Config(format!("config build error: {e}")))?;
    let merged: TierCacheConfig = cfg
        .try_deserialize()
        .map_err(|e| CacheError::Config(format!("config deserialize error: {e}")))?;
    merged.validate().map_err(CacheError::Config)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CacheSettings::default().validate().is_ok());
        assert!(EngineConfig::default().validate().is_ok());
        assert!(TierCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_fingerprint_format() {
        let settings = CacheSettings::new(
            FirstTierSettings {
                expire_ms: 4_000,
                ..Default::default()
            },
            SecondTierSettings {
                expiration_ms: 10_000,
                preload_ms: 4_000,
                ..Default::default()
            },
        );
        assert_eq!(settings.fingerprint(), "4000-10000-4000");
    }

    #[test]
    fn test_magnification_requires_allow_null() {
        let mut settings = CacheSettings::default();
        settings.second.magnification = 10;
        assert_eq!(
            settings.validate().unwrap_err(),
            "second.magnification > 1 requires second.allow_null=true"
        );

        settings.second.allow_null = true;
        assert!(settings.validate().is_ok());
        assert_eq!(settings.second.null_expiration(), Duration::from_secs(360));
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = CacheSettings::default();
        settings.second.preload_ms = settings.second.expiration_ms;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.first.initial_capacity = 1_000;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.second.magnification = 0;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.second.allow_null = true;
        settings.second.expiration_ms = 5;
        settings.second.preload_ms = 1;
        settings.second.magnification = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ttls_and_refresh_slots_are_bounded() {
        let mut settings = CacheSettings::default();
        settings.second.expiration_ms = u64::MAX;
        assert_eq!(
            settings.validate().unwrap_err(),
            format!("second.expiration_ms must be <= {MAX_TTL_MS}")
        );

        let mut settings = CacheSettings::default();
        settings.first.expire_ms = MAX_TTL_MS + 1;
        assert!(settings.validate().is_err());

        let engine = EngineConfig {
            max_concurrent_refreshes: MAX_REFRESH_SLOTS + 1,
            ..Default::default()
        };
        assert!(engine.validate().is_err());
        let engine = EngineConfig {
            max_concurrent_refreshes: MAX_REFRESH_SLOTS,
            ..Default::default()
        };
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_loader_timeout_bounded_by_lock_ttl() {
        let engine = EngineConfig {
            loader_timeout_ms: 20_000,
            ..Default::default()
        };
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiercache.toml");
        std::fs::write(
            &path,
            r#"
[engine]
strict_settings = true

[defaults.second]
expiration_ms = 60000
preload_ms = 10000

[caches.users.first]
expire_ms = 4000
expire_mode = "after_access"

[caches.users.second]
expiration_ms = 10000
preload_ms = 4000
force_refresh = true
"#,
        )
        .unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert!(config.engine.strict_settings);
        assert_eq!(config.engine.load_retry_count, 20);
        assert_eq!(config.defaults.second.expiration_ms, 60_000);

        let users = config.settings_for("users");
        assert_eq!(users.first.expire_mode, ExpireMode::AfterAccess);
        assert!(users.second.force_refresh);
        assert_eq!(users.fingerprint(), "4000-10000-4000");

        assert_eq!(config.settings_for("orders"), &config.defaults);
    }

    #[test]
    fn test_load_config_rejects_invalid_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiercache.toml");
        std::fs::write(
            &path,
            r#"
[caches.broken.second]
expiration_ms = 1000
preload_ms = 2000
"#,
        )
        .unwrap();

        let err = load_config(path.to_str()).unwrap_err();
        assert!(err.to_string().contains("caches.broken"));
    }
}
