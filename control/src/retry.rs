//! Reconnect backoff for watch streams and store retries.
//!
//! Retries never give up: a watch loop or a dirty store keeps trying for the
//! life of the process. With `initial == max` the delay is a fixed interval.

use rand::Rng;
use std::time::Duration;

/// Backoff policy (exponential, capped, optional jitter)
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: f64,
    /// Spread each delay over 0.5x..1.5x
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

impl BackoffConfig {
    /// Same delay after every failure
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Doubling delay from `initial` up to `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn build(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            current: self.initial,
            failures: 0,
        }
    }
}

/// Stateful backoff sequence, one per retrying loop
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Delay to wait before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let base = self.current;

        let grown = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier)
                .min(self.config.max.as_secs_f64()),
        );
        self.current = grown.max(self.config.initial);

        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.config.max)
        } else {
            base
        }
    }

    /// Back to the initial delay after a successful attempt
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
