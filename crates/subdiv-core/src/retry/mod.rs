//! Bounded exponential-backoff retry around a fallible async operation.
//!
//! The loop is explicit: an attempt counter, a classifier that maps each
//! error to a [`Disposition`], and a typed result carrying the full attempt
//! history either way.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How the classifier wants a failed attempt handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry after the policy's backoff.
    Retry,
    /// Retry, waiting at least the given hint (e.g. a rate-limit window).
    RetryAfter(Duration),
    /// Retry, but the failed attempt may already have had a side effect
    /// (e.g. a billed call); the final result is flagged as possibly
    /// duplicated.
    RetryBilled,
    /// Stop immediately.
    Fatal,
}

/// Retry policy. `max_attempts` counts the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub max_jitter_ms: u64,
    /// Cap applied to the computed backoff before jitter.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_jitter_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// `base * multiplier^attempt`, capped, without jitter.
    ///
    /// `attempt` is the zero-based index of the attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.max_jitter_ms))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// One failed attempt, kept for the caller's error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// One-based attempt number.
    pub attempt: u32,
    pub message: String,
}

/// Successful outcome plus what it took to get there.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    /// An earlier attempt classified [`Disposition::RetryBilled`] was retried.
    pub possibly_duplicated: bool,
    pub history: Vec<AttemptFailure>,
}

/// Terminal failure of [`with_retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: E,
        history: Vec<AttemptFailure>,
        possibly_duplicated: bool,
    },

    #[error("attempt {attempts} failed and is not retryable: {error}")]
    Fatal {
        attempts: u32,
        error: E,
        history: Vec<AttemptFailure>,
        possibly_duplicated: bool,
    },

    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        history: Vec<AttemptFailure>,
        possibly_duplicated: bool,
    },
}

impl<E: fmt::Debug + fmt::Display> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn history(&self) -> &[AttemptFailure] {
        match self {
            Self::Exhausted { history, .. }
            | Self::Fatal { history, .. }
            | Self::Cancelled { history, .. } => history,
        }
    }

    pub fn possibly_duplicated(&self) -> bool {
        match self {
            Self::Exhausted {
                possibly_duplicated,
                ..
            }
            | Self::Fatal {
                possibly_duplicated,
                ..
            }
            | Self::Cancelled {
                possibly_duplicated,
                ..
            } => *possibly_duplicated,
        }
    }

    /// The last underlying error, if the loop ended on one.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Fatal { error, .. } => Some(error),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, runs out of attempts, or
/// `cancel` fires.
///
/// `op` receives the one-based attempt number. Cancellation is observed
/// before each attempt and during backoff sleeps; an attempt already in
/// flight is the operation's own responsibility.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    E: fmt::Debug + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Disposition,
{
    let max_attempts = policy.attempts();
    let mut history = Vec::new();
    let mut possibly_duplicated = false;
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                history,
                possibly_duplicated,
            });
        }

        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    possibly_duplicated,
                    history,
                });
            }
            Err(e) => e,
        };

        history.push(AttemptFailure {
            attempt,
            message: error.to_string(),
        });

        let disposition = classify(&error);
        let hint = match disposition {
            Disposition::Fatal => {
                tracing::debug!(attempt, error = %error, "attempt failed fatally");
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                    history,
                    possibly_duplicated,
                });
            }
            Disposition::Retry => None,
            Disposition::RetryAfter(hint) => Some(hint),
            Disposition::RetryBilled => None,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
                history,
                possibly_duplicated,
            });
        }

        if disposition == Disposition::RetryBilled {
            possibly_duplicated = true;
        }

        let backoff = policy.backoff(attempt - 1);
        let delay = hint.map_or(backoff, |h| h.max(backoff)) + policy.jitter();
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    history,
                    possibly_duplicated,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
