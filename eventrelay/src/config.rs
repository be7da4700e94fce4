//! Dispatcher configuration.
//!
//! Every knob has a default, and [`DispatcherConfig::validate`] rejects
//! combinations that would break lease safety. Configurations can be loaded
//! from JSON, where durations are written as integer milliseconds
//! (`poll_interval_ms`, `lease_duration_ms`, ...).

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Maximum number of rows leased per dispatcher cycle.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        AsRef,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Configuration rejected by [`DispatcherConfig::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The dispatcher would spin without pause.
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    /// Claimed rows would be reclaimable immediately.
    #[error("lease duration must be greater than zero")]
    ZeroLeaseDuration,

    /// Every publish would time out.
    #[error("publish timeout must be greater than zero")]
    ZeroPublishTimeout,

    /// A publish could still be running when its lease lapses.
    #[error(
        "publish timeout ({publish_timeout:?}) must be shorter than lease duration ({lease_duration:?})"
    )]
    PublishTimeoutExceedsLease {
        /// Configured publish timeout.
        publish_timeout: Duration,
        /// Configured lease duration.
        lease_duration: Duration,
    },

    /// The backoff cap is below the first delay.
    #[error("max retry delay ({max_delay:?}) must not be below base delay ({base_delay:?})")]
    MaxDelayBelowBase {
        /// Delay before the first retry.
        base_delay: Duration,
        /// Configured cap.
        max_delay: Duration,
    },

    /// The JSON document could not be parsed.
    #[error("invalid dispatcher configuration: {detail}")]
    Malformed {
        /// Parser message.
        detail: String,
    },

    /// No usable lease owner could be derived for this instance.
    #[error("invalid lease owner: {detail}")]
    InvalidLeaseOwner {
        /// Validation message.
        detail: String,
    },
}

/// Tunables of a `Dispatcher`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Pause between cycles.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Rows leased per cycle.
    pub batch_size: BatchSize,
    /// How long a claim stays exclusive.
    #[serde(rename = "lease_duration_ms", with = "duration_ms")]
    pub lease_duration: Duration,
    /// Deadline of a single publish call.
    #[serde(rename = "publish_timeout_ms", with = "duration_ms")]
    pub publish_timeout: Duration,
    /// Retry and backoff policy.
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: BatchSize::try_new(100).expect("100 is a valid batch size"),
            lease_duration: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|error| ConfigError::Malformed {
            detail: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::ZeroLeaseDuration);
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::ZeroPublishTimeout);
        }
        if self.publish_timeout >= self.lease_duration {
            return Err(ConfigError::PublishTimeoutExceedsLease {
                publish_timeout: self.publish_timeout,
                lease_duration: self.lease_duration,
            });
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::MaxDelayBelowBase {
                base_delay: self.retry.base_delay,
                max_delay: self.retry.max_delay,
            });
        }
        Ok(())
    }

    /// Sets the pause between cycles.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the number of rows leased per cycle.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the claim lease duration.
    #[must_use]
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Sets the per-publish deadline.
    #[must_use]
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
