//! Reconnect backoff

use crate::error::{HearthError, Result};
use crate::manifest::{parse_duration, SupervisorSection};
use std::time::Duration;

/// Failures logged at warn before dropping to info
const WARN_FAILURES: u32 = 3;
/// Failures logged at info before dropping to debug
const INFO_FAILURES: u32 = 10;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Policy from the manifest's `supervisor.tunnel_backoff` block
    pub fn from_section(section: Option<&SupervisorSection>) -> Result<Self> {
        let mut policy = Self::default();
        if let Some(backoff) = section.and_then(|s| s.tunnel_backoff.as_ref()) {
            if let Some(initial) = &backoff.initial {
                policy.initial = parse_duration(initial)?;
            }
            if let Some(multiplier) = backoff.multiplier {
                policy.multiplier = multiplier;
            }
            if let Some(max) = &backoff.max {
                policy.max = parse_duration(max)?;
            }
        }
        policy.validate()?;
        Ok(policy)
    }

    /// Delays must grow and the cap must be reachable
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(HearthError::InvalidConfig(
                "tunnel backoff initial delay must be positive".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(HearthError::InvalidConfig(format!(
                "tunnel backoff multiplier must be greater than 1, got {}",
                self.multiplier
            )));
        }
        if self.max < self.initial {
            return Err(HearthError::InvalidConfig(
                "tunnel backoff max must not be below the initial delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backoff state across consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            next: policy.initial,
            policy,
            failures: 0,
        }
    }

    /// Delay before the next attempt; strictly larger than the previous one
    /// until the cap is reached, never above the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.policy.max);
        self.failures += 1;
        let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * self.policy.multiplier)
            .unwrap_or(self.policy.max);
        self.next = grown
            .max(delay.saturating_add(Duration::from_millis(1)))
            .min(self.policy.max);
        delay
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.next = self.policy.initial;
        self.failures = 0;
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Log a transient failure at a level that drops as failures accumulate
pub fn log_failure(failures: u32, delay: Duration, error: &str) {
    let delay_ms = delay.as_millis() as u64;
    if failures <= WARN_FAILURES {
        tracing::warn!(attempt = failures, delay_ms, error, "Tunnel connection failed, retrying");
    } else if failures <= INFO_FAILURES {
        tracing::info!(attempt = failures, delay_ms, error, "Tunnel connection failed, retrying");
    } else {
        tracing::debug!(attempt = failures, delay_ms, error, "Tunnel connection failed, retrying");
    }
}
