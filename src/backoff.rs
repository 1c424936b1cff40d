//! Backoff policy shared by the worker's submission retry and the
//! aggregator's completion poll.
//!
//! A policy is a starting delay, a growth rule and a ceiling. Each step is
//! `next_delay(previous) = min(max_delay, grow(previous))`, so delays are
//! non-decreasing and never exceed the ceiling.

use std::time::Duration;

/// How a delay grows from one step to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Growth {
    /// Add the base delay each step: `base * attempt`.
    Linear,
    /// Multiply by a factor (>= 1.0) each step.
    Exponential(f64),
}

/// Delay schedule for repeated operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    growth: Growth,
}

impl BackoffPolicy {
    /// Linear growth: attempt `n` waits `unit * n`, capped at `max_delay`.
    pub fn linear(unit: Duration, max_delay: Duration) -> Self {
        Self {
            base: unit,
            max_delay: max_delay.max(unit),
            growth: Growth::Linear,
        }
    }

    /// Exponential growth starting at `base`, multiplied by `factor` per step.
    ///
    /// Factors below 1.0 are clamped to 1.0 so the schedule never shrinks.
    pub fn exponential(base: Duration, factor: f64, max_delay: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        Self {
            base,
            max_delay: max_delay.max(base),
            growth: Growth::Exponential(factor),
        }
    }

    /// The first delay of the schedule.
    pub fn initial_delay(&self) -> Duration {
        self.base.min(self.max_delay)
    }

    /// The ceiling of the schedule.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay that follows `previous`.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let grown = match self.growth {
            Growth::Linear => previous.saturating_add(self.base),
            Growth::Exponential(factor) => {
                let secs = previous.as_secs_f64() * factor;
                if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.max_delay
                }
            }
        };
        grown.min(self.max_delay)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay();
        for _ in 1..attempt.max(1) {
            let next = self.next_delay(delay);
            if next == delay {
                break;
            }
            delay = next;
        }
        delay
    }

    /// Iterator over the successive delays of this schedule.
    pub fn delays(&self) -> Delays<'_> {
        Delays {
            policy: self,
            next: self.initial_delay(),
        }
    }
}

/// Infinite iterator produced by [`BackoffPolicy::delays`].
pub struct Delays<'a> {
    policy: &'a BackoffPolicy,
    next: Duration,
}

impl Iterator for Delays<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = self.policy.next_delay(current);
        Some(current)
    }
}
