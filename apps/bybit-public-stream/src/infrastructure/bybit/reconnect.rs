//! Reconnection Policy
//!
//! Exponential backoff with jitter between connection attempts to the
//! public stream. The base delay for attempt `n` (1-based) is
//! `initial * multiplier^(n-1)`, capped at `max_delay`; jitter then moves it
//! by up to `±jitter_factor` of the base.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for the base delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the base delay.
    pub jitter_factor: f64,
    /// Attempts allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}

impl From<&WebSocketSettings> for ReconnectConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            max_attempts: settings.max_reconnect_attempts,
            ..Self::default()
        }
    }
}

impl ReconnectConfig {
    /// Base delay for a 1-based attempt number, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let secs = (self.initial_delay.as_secs_f64() * factor).min(max_secs);

        if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }
}

/// Stateful backoff tracker for one connection.
///
/// # Example
///
/// ```rust
/// use bybit_public_stream::infrastructure::bybit::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// let delay = policy.next_delay();
/// assert!(delay.is_some());
/// assert_eq!(policy.attempt_count(), 1);
///
/// // Connected again
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Record an attempt and return how long to wait before it.
    ///
    /// Returns `None` once `max_attempts` is exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let base = self.config.base_delay(self.attempt_count);
        Some(self.apply_jitter(base))
    }

    /// Forget recorded attempts after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts recorded since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }

        let spread = base.as_secs_f64() * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.001))
    }
}

/// Reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Every allowed attempt failed.
    #[error("gave up after {0} reconnection attempts")]
    MaxAttemptsExceeded(u32),
}
