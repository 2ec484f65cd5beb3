//! Reconnect backoff
//!
//! Delay before retry `n` (0-based) is `min(base * 2^n, max)` plus a uniform
//! jitter in `[0, max_jitter)`.

use crate::shared::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Capped exponential delay, without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay with jitter drawn from `rng`
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        };
        self.base_delay_for(attempt) + jitter
    }
}

/// Retry bookkeeping for the single broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectState {
    attempt_count: u32,
    next_delay: Option<Duration>,
    should_reconnect: bool,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of asking for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
    /// Retry `attempt` (1-based) after `delay`
    After { attempt: u32, delay: Duration },
    /// Reconnection is not permitted right now
    Disabled,
    /// The attempt budget is spent
    Exhausted { attempts: u32 },
}

impl ReconnectState {
    /// Starts disarmed; the owner's first `connect()` arms it
    pub fn new() -> Self {
        Self {
            attempt_count: 0,
            next_delay: None,
            should_reconnect: false,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn arm(&mut self) {
        self.should_reconnect = true;
    }

    /// Explicit disconnect or authentication rejection
    pub fn disarm(&mut self) {
        self.should_reconnect = false;
        self.next_delay = None;
    }

    /// Successful connect
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.next_delay = None;
    }

    /// Count an attempt and compute its delay
    pub fn next_attempt(&mut self, policy: &ReconnectPolicy, rng: &mut impl Rng) -> NextAttempt {
        if !self.should_reconnect {
            return NextAttempt::Disabled;
        }
        if self.attempt_count >= policy.max_attempts {
            self.next_delay = None;
            return NextAttempt::Exhausted {
                attempts: self.attempt_count,
            };
        }
        let delay = policy.delay_for(self.attempt_count, rng);
        self.attempt_count += 1;
        self.next_delay = Some(delay);
        NextAttempt::After {
            attempt: self.attempt_count,
            delay,
        }
    }
}
