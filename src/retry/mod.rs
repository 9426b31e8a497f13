//! Retry support for fallible network operations
//!
//! A [`Backoff`] computes delays, a [`RetryPolicy`] decides whether an error
//! is worth another attempt, and a [`Repeater`] ties the two together
//! around an async operation with cancellation.

pub mod backoff;
pub mod repeater;

pub use backoff::Backoff;
pub use repeater::{Repeater, RetryError};

use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Succeed,
    Retry,
    Fail,
}

/// Maps an attempt's error (`None` on success) to a [`Verdict`].
pub trait RetryPolicy<E> {
    fn classify(&self, error: Option<&E>) -> Verdict;
}

impl<E, F> RetryPolicy<E> for F
where
    F: Fn(Option<&E>) -> Verdict,
{
    fn classify(&self, error: Option<&E>) -> Verdict {
        self(error)
    }
}

/// Retry every error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> RetryPolicy<E> for AlwaysRetry {
    fn classify(&self, error: Option<&E>) -> Verdict {
        match error {
            Some(_) => Verdict::Retry,
            None => Verdict::Succeed,
        }
    }
}

/// Retry only errors that [`Error::is_transient`] marks as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnly;

impl RetryPolicy<Error> for TransientOnly {
    fn classify(&self, error: Option<&Error>) -> Verdict {
        match error {
            None => Verdict::Succeed,
            Some(err) if err.is_transient() => Verdict::Retry,
            Some(_) => Verdict::Fail,
        }
    }
}

/// Bounds for the backoff built around each retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetrySettings {
    /// A fresh backoff; never shared between retry loops.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_delay, self.max_delay, self.max_attempts)
    }
}

impl From<RetryError<Error>> for Error {
    fn from(err: RetryError<Error>) -> Self {
        err.into_last().unwrap_or(Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_retry_policy() {
        assert_eq!(
            RetryPolicy::<String>::classify(&AlwaysRetry, None),
            Verdict::Succeed
        );
        assert_eq!(
            AlwaysRetry.classify(Some(&"boom".to_string())),
            Verdict::Retry
        );
    }

    #[test]
    fn test_transient_only_policy() {
        assert_eq!(TransientOnly.classify(None), Verdict::Succeed);
        assert_eq!(
            TransientOnly.classify(Some(&Error::Transport("reset".to_string()))),
            Verdict::Retry
        );
        assert_eq!(
            TransientOnly.classify(Some(&Error::UnsupportedFormat("gif".to_string()))),
            Verdict::Fail
        );
    }

    #[test]
    fn test_retry_error_into_crate_error() {
        let cancelled: RetryError<Error> = RetryError::Cancelled {
            attempts: 0,
            last: None,
        };
        assert!(matches!(Error::from(cancelled), Error::Cancelled));

        let exhausted = RetryError::Exhausted {
            attempts: 3,
            last: Error::Transport("timeout".to_string()),
        };
        assert!(matches!(Error::from(exhausted), Error::Transport(_)));
    }
}
