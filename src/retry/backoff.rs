use rand::Rng;
use std::time::Duration;

/// Exponential backoff with additive jitter, capped at `max`.
///
/// Each call to [`Backoff::next`] bumps the attempt counter first. Once the
/// counter passes `max_attempts` the backoff reports `None` (stop). The
/// counter starts at 1, so a fresh backoff allows `max_attempts` tries of
/// the surrounding operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    min: Duration,
    max: Duration,
    max_attempts: u32,
}

const INITIAL_ATTEMPT: u32 = 1;

impl Backoff {
    pub fn new(min: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: INITIAL_ATTEMPT,
            min,
            max: max.max(min),
            max_attempts,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Lower bound of the delay for `attempt`, before clamping.
    pub fn floor(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = INITIAL_ATTEMPT;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.max_attempts {
            return None;
        }

        let base = self.floor(self.attempt);
        let jitter_cap = self.min.saturating_mul(self.attempt);
        let jitter = if jitter_cap.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..jitter_cap)
        };

        Some(base.saturating_add(jitter).min(self.max))
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Backoff::next(self)
    }
}
