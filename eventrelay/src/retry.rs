//! Retry and backoff policy for failed publishes.

use std::time::Duration;

use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::publisher::ErrorClass;

/// Attempt ceiling after which a transient failure dead-letters the event.
///
/// Counts publish attempts that reached the broker, including the first.
#[nutype(
    validate(greater_or_equal = 1),
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
pub struct MaxAttempts(u32);

/// Growth factor of the exponential backoff.
#[nutype(
    validate(finite, greater_or_equal = 1.0, less_or_equal = 10.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Display,
        AsRef,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BackoffMultiplier(f64);

/// Tunables of [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a transient failure dead-letters.
    pub max_attempts: MaxAttempts,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: BackoffMultiplier,
    /// Upper bound of any single delay, before jitter.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::try_new(10).expect("10 is a valid attempt ceiling"),
            base_delay: Duration::from_millis(500),
            multiplier: BackoffMultiplier::try_new(2.0).expect("2.0 is a valid multiplier"),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

/// What to do with an event after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the event to `Pending`, claimable again after the delay.
    RetryAfter(Duration),
    /// Move the event to the dead-letter queue.
    DeadLetter,
}

/// Decides between retrying and dead-lettering, and computes the delay.
///
/// The nominal delay before retry `n` is
/// `min(max_delay, base_delay * multiplier^(n - 1))`. With jitter enabled the
/// actual delay is drawn uniformly from `[nominal / 2, nominal]`, so it never
/// exceeds `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from `config`.
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy's tunables.
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Nominal delay after the `attempt`-th failure (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.config.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.into_inner().powi(exponent);
        // Whole nanoseconds keep small delays exact; `min` also absorbs an
        // infinite factor.
        let base = self.config.base_delay.as_nanos() as f64;
        let max = self.config.max_delay.as_nanos() as f64;
        let nominal = (base * factor).round().min(max);
        Duration::from_nanos(nominal as u64)
    }

    /// Decides the fate of an event whose `attempts`-th publish (1-based,
    /// counting this one) failed with `class`.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempts: u32,
        class: ErrorClass,
        rng: &mut R,
    ) -> RetryDecision {
        if class == ErrorClass::Permanent || attempts >= self.config.max_attempts.into_inner() {
            return RetryDecision::DeadLetter;
        }

        let nominal = self.backoff(attempts);
        if self.config.jitter {
            RetryDecision::RetryAfter(equal_jitter(nominal, rng))
        } else {
            RetryDecision::RetryAfter(nominal)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Uniform in `[delay / 2, delay]`.
fn equal_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
    let half = delay / 2;
    let spread = u64::try_from((delay - half).as_nanos()).unwrap_or(u64::MAX);
    half + Duration::from_nanos(rng.random_range(0..=spread))
}
