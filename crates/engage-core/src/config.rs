//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.

use crate::error::ConfigError;
use crate::types::ScoreBounds;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound for any duration setting (ten years)
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngageConfig {
    /// Ticket lifetime from issuance
    pub ticket_ttl_secs: u64,
    /// Idle time after which an open session lapses
    pub inactivity_timeout_secs: u64,
    /// Bound on the live session map
    pub max_live_sessions: usize,
    /// Batches allowed in flight per session before backpressure
    pub max_pending_batches: usize,
    /// Samples allowed per batch
    pub max_batch_size: usize,
    /// Lowest valid score
    pub score_min: f64,
    /// Highest valid score
    pub score_max: f64,
    /// Sampling interval when the catalog gives none
    pub default_sampling_interval_secs: f64,
    /// Coverage a finished session must exceed to count as completed
    pub completion_threshold: f64,
    /// Memoized session results
    pub result_cache_capacity: u64,
    /// Period of the background sweep, 0 disables it
    pub sweep_interval_secs: u64,
    /// How long archived sessions and finished tickets are kept before a sweep drops them
    pub archive_retention_secs: u64,
}

impl EngageConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// With ticket TTL
    #[inline]
    #[must_use]
    pub fn with_ticket_ttl_secs(mut self, secs: u64) -> Self {
        self.ticket_ttl_secs = secs;
        self
    }

    /// With inactivity timeout
    #[inline]
    #[must_use]
    pub fn with_inactivity_timeout_secs(mut self, secs: u64) -> Self {
        self.inactivity_timeout_secs = secs;
        self
    }

    /// With live session bound
    #[inline]
    #[must_use]
    pub fn with_max_live_sessions(mut self, max: usize) -> Self {
        self.max_live_sessions = max;
        self
    }

    /// With pending batch bound
    #[inline]
    #[must_use]
    pub fn with_max_pending_batches(mut self, max: usize) -> Self {
        self.max_pending_batches = max;
        self
    }

    /// With batch size bound
    #[inline]
    #[must_use]
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// With archive retention
    #[inline]
    #[must_use]
    pub fn with_archive_retention_secs(mut self, secs: u64) -> Self {
        self.archive_retention_secs = secs;
        self
    }

    /// With completion threshold
    #[inline]
    #[must_use]
    pub fn with_completion_threshold(mut self, threshold: f64) -> Self {
        self.completion_threshold = threshold;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, secs) in [
            ("ticket_ttl_secs", self.ticket_ttl_secs),
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be within 1..={MAX_DURATION_SECS}"),
                ));
            }
        }
        for (field, secs) in [
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("archive_retention_secs", self.archive_retention_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be at most {MAX_DURATION_SECS}"),
                ));
            }
        }
        if self.max_live_sessions == 0 {
            return Err(ConfigError::invalid("max_live_sessions", "must be positive"));
        }
        if self.max_pending_batches == 0 {
            return Err(ConfigError::invalid("max_pending_batches", "must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size", "must be positive"));
        }
        if !(self.score_min.is_finite() && self.score_max.is_finite())
            || self.score_min > self.score_max
        {
            return Err(ConfigError::invalid(
                "score_min",
                "score bounds must be finite with min <= max",
            ));
        }
        if !(self.default_sampling_interval_secs.is_finite()
            && self.default_sampling_interval_secs > 0.0)
        {
            return Err(ConfigError::invalid(
                "default_sampling_interval_secs",
                "must be a positive number",
            ));
        }
        if !(0.0..=1.0).contains(&self.completion_threshold) {
            return Err(ConfigError::invalid(
                "completion_threshold",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Ticket TTL as a duration
    #[inline]
    #[must_use]
    pub fn ticket_ttl(&self) -> Duration {
        seconds(self.ticket_ttl_secs)
    }

    /// Inactivity timeout as a duration
    #[inline]
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        seconds(self.inactivity_timeout_secs)
    }

    /// Archive retention as a duration
    #[inline]
    #[must_use]
    pub fn archive_retention(&self) -> Duration {
        seconds(self.archive_retention_secs)
    }

    /// Sweep period, `None` when disabled
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Option<std::time::Duration> {
        (self.sweep_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.sweep_interval_secs))
    }

    /// Score bounds
    #[inline]
    #[must_use]
    pub fn score_bounds(&self) -> ScoreBounds {
        ScoreBounds::new(self.score_min, self.score_max)
    }
}

impl Default for EngageConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: 4 * 60 * 60,
            inactivity_timeout_secs: 10 * 60,
            max_live_sessions: 100_000,
            max_pending_batches: 4,
            max_batch_size: 500,
            score_min: 0.0,
            score_max: 1.0,
            default_sampling_interval_secs: 10.0,
            completion_threshold: 0.8,
            result_cache_capacity: 10_000,
            sweep_interval_secs: 60,
            archive_retention_secs: 24 * 60 * 60,
        }
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(i64::MAX / 1000))
}
