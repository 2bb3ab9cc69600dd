//! Engine configuration, with defaults and `LEADFLOW_*` environment overrides.

use std::time::Duration;

use tokio::sync::Semaphore;
use leadflow_core::{ContactWindow, DomainError, StagePolicy};

use crate::followup::{BatchConfig, SchedulerConfig};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything the follow-up engine needs besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub batch: BatchConfig,
    /// Applied to every provider send.
    pub provider_retry: RetryPolicy,
    /// Applied to lead fetches and status chunk writes.
    pub persistence_retry: RetryPolicy,
    /// `None` contacts leads at any hour.
    pub contact_window: Option<ContactWindow>,
    pub stage_policy: StagePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            batch: BatchConfig::default(),
            provider_retry: RetryPolicy::default(),
            persistence_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(500),
                Duration::from_secs(10),
            ),
            contact_window: Some(ContactWindow::default()),
            stage_policy: StagePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LEADFLOW_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    ///
    /// Durations use humantime syntax (`90s`, `5m`, `1h 30m`).
    /// `LEADFLOW_CONTACT_WINDOW` takes `9-17`, or `off` to disable the window.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LEADFLOW_SCHEDULER_NAME") {
            config.scheduler.name = v;
        }
        if let Some(v) = get("LEADFLOW_CADENCE") {
            config.scheduler.cadence = duration("LEADFLOW_CADENCE", &v)?;
        }
        if let Some(v) = get("LEADFLOW_CYCLE_TIMEOUT") {
            config.scheduler.cycle_timeout = duration("LEADFLOW_CYCLE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("LEADFLOW_MAX_PARALLELISM") {
            config.scheduler.max_parallelism = positive("LEADFLOW_MAX_PARALLELISM", &v)?;
        }
        if let Some(v) = get("LEADFLOW_LOCK_KEY") {
            config.scheduler.lock_key = v;
        }
        if let Some(v) = get("LEADFLOW_LOCK_TTL") {
            config.scheduler.lock_ttl = duration("LEADFLOW_LOCK_TTL", &v)?;
        }
        if let Some(v) = get("LEADFLOW_QUEUE_ALERT_THRESHOLD") {
            config.scheduler.queue_alert_threshold = match v.trim() {
                "off" | "none" => None,
                raw => Some(number("LEADFLOW_QUEUE_ALERT_THRESHOLD", raw)?),
            };
        }

        if let Some(v) = get("LEADFLOW_BATCH_SIZE") {
            config.batch.max_batch_size = positive("LEADFLOW_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("LEADFLOW_BATCH_MAX_WAIT") {
            config.batch.max_wait = duration("LEADFLOW_BATCH_MAX_WAIT", &v)?;
        }
        if let Some(v) = get("LEADFLOW_CHUNK_SIZE") {
            config.batch.chunk_size = positive("LEADFLOW_CHUNK_SIZE", &v)?;
        }

        if let Some(v) = get("LEADFLOW_MAX_ATTEMPTS") {
            let attempts: u32 = positive("LEADFLOW_MAX_ATTEMPTS", &v)?;
            config.provider_retry.max_attempts = attempts;
            config.persistence_retry.max_attempts = attempts;
        }
        if let Some(v) = get("LEADFLOW_RETRY_BASE_DELAY") {
            config.provider_retry.base_delay = duration("LEADFLOW_RETRY_BASE_DELAY", &v)?;
        }
        if let Some(v) = get("LEADFLOW_RETRY_MAX_DELAY") {
            config.provider_retry.max_delay = duration("LEADFLOW_RETRY_MAX_DELAY", &v)?;
        }
        if let Some(v) = get("LEADFLOW_ATTEMPT_TIMEOUT") {
            let timeout = duration("LEADFLOW_ATTEMPT_TIMEOUT", &v)?;
            config.provider_retry.attempt_timeout = Some(timeout);
            config.persistence_retry.attempt_timeout = Some(timeout);
        }

        if let Some(v) = get("LEADFLOW_CONTACT_WINDOW") {
            config.contact_window = contact_window(&v)?;
        }
        if let (Some(v), Some(window)) = (get("LEADFLOW_UTC_OFFSET_MINUTES"), config.contact_window.as_mut()) {
            window.utc_offset_minutes = number("LEADFLOW_UTC_OFFSET_MINUTES", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("LEADFLOW_CADENCE", self.scheduler.cadence),
            ("LEADFLOW_CYCLE_TIMEOUT", self.scheduler.cycle_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "0s", "must be greater than zero"));
            }
        }
        if self.scheduler.max_parallelism > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "LEADFLOW_MAX_PARALLELISM",
                &self.scheduler.max_parallelism.to_string(),
                format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.scheduler.lock_ttl <= self.scheduler.cycle_timeout {
            return Err(ConfigError::invalid(
                "LEADFLOW_LOCK_TTL",
                &humantime::format_duration(self.scheduler.lock_ttl).to_string(),
                "must exceed the cycle timeout",
            ));
        }
        if let Some(window) = &self.contact_window {
            window.validate()?;
        }
        self.stage_policy.validate()?;
        Ok(())
    }
}

fn duration(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::invalid(key, raw, e))
}

fn number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::invalid(key, raw, e))
}

fn positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let value: T = number(key, raw)?;
    if value == T::default() {
        return Err(ConfigError::invalid(key, raw, "must be greater than zero"));
    }
    Ok(value)
}

fn contact_window(raw: &str) -> Result<Option<ContactWindow>, ConfigError> {
    const KEY: &str = "LEADFLOW_CONTACT_WINDOW";
    let raw = raw.trim();
    if matches!(raw, "off" | "none") {
        return Ok(None);
    }
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| ConfigError::invalid(KEY, raw, "expected START-END hours, e.g. 9-17"))?;
    let window = ContactWindow::new(number(KEY, start)?, number(KEY, end)?)?;
    Ok(Some(window))
}
