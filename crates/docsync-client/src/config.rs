//! RON configuration for a sync session.
//!
//! ```ron
//! (
//!     scheduler: (
//!         initial_delay_ms: 500,
//!         fetch_period_ms: 2000,
//!         push_period_ms: 5000,
//!         max_backoff_ms: 30000,
//!     ),
//!     log_filter: Some("docsync=debug"),
//! )
//! ```
//!
//! No timing has a default; the embedding application chooses them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scheduler timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay before the first fetch and the first push.
    pub initial_delay_ms: u64,
    pub fetch_period_ms: u64,
    pub push_period_ms: u64,
    /// Upper bound on the retry delay after consecutive failures.
    pub max_backoff_ms: u64,
}

impl SchedulerConfig {
    pub fn new(initial_delay: Duration, fetch_period: Duration, push_period: Duration) -> Self {
        let fetch_period_ms = duration_ms(fetch_period);
        Self {
            initial_delay_ms: duration_ms(initial_delay),
            fetch_period_ms,
            push_period_ms: duration_ms(push_period),
            max_backoff_ms: fetch_period_ms.saturating_mul(16),
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff_ms = duration_ms(max_backoff);
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn fetch_period(&self) -> Duration {
        Duration::from_millis(self.fetch_period_ms)
    }

    pub fn push_period(&self) -> Duration {
        Duration::from_millis(self.push_period_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_period_ms == 0 || self.push_period_ms == 0 {
            return Err(ConfigError::Invalid("scheduler periods must be non-zero".into()));
        }
        if self.max_backoff_ms < self.fetch_period_ms.max(self.push_period_ms) {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_ms ({}) is shorter than a regular period",
                self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Top-level session configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl SyncConfig {
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = ron::from_str(text)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }
}
