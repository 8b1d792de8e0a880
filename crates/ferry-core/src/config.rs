//! Configuration parsing and validation.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::app::{DispatchOptions, SessionOptions};
use crate::queue::{RetryPolicy, StoreOptions};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Queue store settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite file. Without it the queue lives in memory only.
    pub path: Option<PathBuf>,
    pub capacity: usize,
    pub max_attempts: u32,
    /// Staleness grace period for in-flight items.
    pub stale_after_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: 10_000,
            max_attempts: 5,
            stale_after_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 600_000,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let defaults = DispatchOptions::default();
        Self {
            batch_size: defaults.batch_size,
            concurrency: defaults.concurrency,
        }
    }
}

/// Wake timing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Budget used when the host does not pass one (`processQueue`).
    pub default_budget_secs: u64,
    pub safety_margin_ratio: f64,
    pub min_safety_margin_ms: u64,
    pub max_safety_margin_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_budget_secs: 30,
            safety_margin_ratio: 0.1,
            min_safety_margin_ms: 500,
            max_safety_margin_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
        }
    }
}

/// Top-level configuration, usually read from `ferry.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FerryConfig {
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    pub reaper: ReaperConfig,
}

impl FerryConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }

        if self.store.capacity == 0 {
            return invalid("store.capacity must be greater than zero");
        }
        if self.store.max_attempts == 0 {
            return invalid("store.max_attempts must be at least 1");
        }
        if self.store.stale_after_secs == 0 {
            return invalid("store.stale_after_secs must be greater than zero");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be a finite number >= 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.dispatch.batch_size == 0 {
            return invalid("dispatch.batch_size must be greater than zero");
        }
        if self.dispatch.concurrency == 0 {
            return invalid("dispatch.concurrency must be greater than zero");
        }
        if self.session.default_budget_secs == 0 {
            return invalid("session.default_budget_secs must be greater than zero");
        }
        let ratio = self.session.safety_margin_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return invalid("session.safety_margin_ratio must be in [0.0, 1.0)");
        }
        if self.session.min_safety_margin_ms > self.session.max_safety_margin_ms {
            return invalid("session.min_safety_margin_ms must not exceed max_safety_margin_ms");
        }
        if self.reaper.enabled && self.reaper.interval_secs == 0 {
            return invalid("reaper.interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            capacity: self.store.capacity,
            max_attempts: self.store.max_attempts,
            stale_after: Duration::from_secs(self.store.stale_after_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                multiplier: self.retry.multiplier,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
            },
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            batch_size: self.dispatch.batch_size,
            concurrency: self.dispatch.concurrency,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            safety_margin_ratio: self.session.safety_margin_ratio,
            min_safety_margin: Duration::from_millis(self.session.min_safety_margin_ms),
            max_safety_margin: Duration::from_millis(self.session.max_safety_margin_ms),
        }
    }

    pub fn default_budget(&self) -> Duration {
        Duration::from_secs(self.session.default_budget_secs)
    }

    pub fn reaper_interval(&self) -> Option<Duration> {
        self.reaper
            .enabled
            .then(|| Duration::from_secs(self.reaper.interval_secs))
    }
}
