//! # Exponential Backoff
//!
//! Capped exponential backoff used by the reflector (watch restarts) and the
//! work queue (per-key reconcile retries).
//!
//! The ceiling for attempt `n` is `base * 2^n`, capped at `cap`. With full
//! jitter the actual delay is drawn uniformly from `[0, ceiling]`, which
//! spreads reconnect storms from many replicas.

use std::time::Duration;

use rand::Rng;

/// Whether to randomize delays below the exponential ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Uniform in `[0, ceiling]`.
    Full,
    /// Exactly the ceiling.
    None,
}

/// Stateful exponential backoff calculator.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and never exceeding `cap`.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, jitter: Jitter) -> Self {
        Self { base, cap, jitter, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// The un-jittered ceiling the next call to [`next_delay`](Self::next_delay) draws from.
    pub fn ceiling(&self) -> Duration {
        exponential_delay(self.attempt, self.base, self.cap)
    }

    /// Get the next delay and advance the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let ms = ceiling.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
            }
        }
    }

    /// Reset to the initial state, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Stateless `base * 2^attempt`, capped at `cap`.
#[must_use]
pub fn exponential_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}
