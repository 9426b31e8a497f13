use super::{Backoff, RetryPolicy, Verdict};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a [`Repeater`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The token fired before the operation succeeded.
    Cancelled { attempts: u32, last: Option<E> },
    /// The backoff ran out of attempts.
    Exhausted { attempts: u32, last: E },
    /// The policy classified the error as terminal.
    Failed { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Failed { attempts, .. } => *attempts,
        }
    }

    /// The last error the operation produced, if it ran at all.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Cancelled { last, .. } => last,
            RetryError::Exhausted { last, .. } | RetryError::Failed { last, .. } => Some(last),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled { attempts, .. } => {
                write!(f, "cancelled after {} attempt(s)", attempts)
            }
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, last)
            }
            RetryError::Failed { attempts, last } => {
                write!(f, "permanent failure on attempt {}: {}", attempts, last)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Drives a fallible async operation under a policy and a backoff.
pub struct Repeater<P> {
    backoff: Backoff,
    policy: P,
}

impl<P> Repeater<P> {
    pub fn new(backoff: Backoff, policy: P) -> Self {
        Self { backoff, policy }
    }

    /// Invoke `op` until it succeeds, the policy fails it, attempts run out,
    /// or `cancel` fires. Backoff sleeps race the token.
    pub async fn run<T, E, F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.backoff.reset();
        let mut attempts = 0;
        let mut last = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts, last });
            }

            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.policy.classify(Some(&err)) {
                Verdict::Retry => {}
                Verdict::Succeed | Verdict::Fail => {
                    return Err(RetryError::Failed {
                        attempts,
                        last: err,
                    });
                }
            }

            let Some(delay) = self.backoff.next() else {
                warn!(attempts, error = %err, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last: err,
                });
            };

            debug!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after backoff");
            last = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts, last });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
