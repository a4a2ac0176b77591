//! Reconnection policy engine
//!
//! Pure functions of a policy and the number of failed attempts in the
//! current streak. The supervisor consults [`ReconnectPolicy::next_attempt`]
//! after every unexpected disconnect or failed connection attempt.

use std::time::Duration;

/// Backoff schedule and retry budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// When false, a lost or failed session leaves the client `Disconnected`
    pub enabled: bool,
    /// Reconnection attempts allowed per failure streak (None = unlimited)
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Double the delay on every attempt instead of using `base_delay` flat
    pub exponential: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(10),
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            exponential: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before the given 1-based attempt
    ///
    /// Fixed: `base_delay`. Exponential: `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base_delay;
        }

        let exponent = attempt.max(1) - 1;
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide what to do after `failed_attempts` consecutive failed attempts
    pub fn next_attempt(&self, failed_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if !self.enabled {
            return ReconnectionDecision::AbortDisabled;
        }

        if let Some(max_attempts) = self.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = failed_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: self.delay_for_attempt(attempt),
        }
    }

    /// Sum of every backoff delay in one streak; None when unlimited
    pub fn total_backoff(&self) -> Option<Duration> {
        if !self.enabled {
            return Some(Duration::ZERO);
        }
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.delay_for_attempt(attempt))
                .fold(Duration::ZERO, |total, delay| total.saturating_add(delay))
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unlimited".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err(format!(
                "max_delay ({:?}) must not be smaller than base_delay ({:?})",
                self.max_delay, self.base_delay
            ));
        }
        Ok(())
    }

    /// Human readable attempt ceiling for logs
    pub fn max_attempts_display(&self) -> String {
        self.max_attempts
            .map_or("∞".to_string(), |max| max.to_string())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - policy disabled
    AbortDisabled,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}
