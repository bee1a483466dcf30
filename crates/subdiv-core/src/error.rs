//! Failure taxonomy for a single generation attempt.
//!
//! Validation problems are deliberately absent: they are data on the
//! validation report, never errors.

use std::time::Duration;

use subdiv_db::models::FailureKind;

use crate::rate_limit::RateLimitExceeded;
use crate::retry::Disposition;

/// Why one attempt at calling the generation service failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("rate limited by {service}; retry in {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Duration,
    },

    #[error("daily quota exhausted for {service}")]
    QuotaExhausted { service: String },

    #[error("transient call failure: {0}")]
    TransientCall(String),

    #[error("fatal call failure: {0}")]
    FatalCall(String),

    /// The call failed after `received` bytes of output had arrived. The
    /// backend has already produced (and billed) part of a response.
    #[error("stream interrupted after {received} bytes: {cause}")]
    Interrupted { received: usize, cause: String },

    #[error("response truncated after {len} bytes (ends {suffix:?})")]
    Truncated { len: usize, suffix: String },

    #[error("malformed response ({len} bytes): {reason}; starts {prefix:?}, ends {suffix:?}")]
    Malformed {
        len: usize,
        reason: String,
        prefix: String,
        suffix: String,
    },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Stored failure kind for a candidate that ends with this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::QuotaExhausted { .. } => FailureKind::QuotaExhausted,
            Self::TransientCall(_) => FailureKind::TransientCall,
            Self::FatalCall(_) => FailureKind::FatalCall,
            Self::Interrupted { .. } => FailureKind::Interrupted,
            Self::Truncated { .. } => FailureKind::Truncated,
            Self::Malformed { .. } => FailureKind::Malformed,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Wrap a call failure that happened after `received` bytes of output.
    /// Failures before any output, and fatal or cancelled ones, are kept.
    pub fn after_output(self, received: usize) -> Self {
        if received == 0 {
            return self;
        }
        match self {
            Self::TransientCall(cause) => Self::Interrupted { received, cause },
            e @ Self::RateLimited { .. } => Self::Interrupted {
                received,
                cause: e.to_string(),
            },
            other => other,
        }
    }

    /// Retry classification used by the pipeline.
    ///
    /// Interrupted, truncated, malformed and timed-out attempts reached the
    /// backend and may have been billed, so retrying them marks the result
    /// as possibly duplicated.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::RateLimited { retry_after, .. } => Disposition::RetryAfter(*retry_after),
            Self::TransientCall(_) => Disposition::Retry,
            Self::Interrupted { .. }
            | Self::Truncated { .. }
            | Self::Malformed { .. }
            | Self::Timeout(_) => Disposition::RetryBilled,
            Self::QuotaExhausted { .. } | Self::FatalCall(_) | Self::Cancelled => {
                Disposition::Fatal
            }
        }
    }
}

impl From<RateLimitExceeded> for GenerationError {
    fn from(e: RateLimitExceeded) -> Self {
        match e {
            RateLimitExceeded::RetryAfter {
                service,
                retry_after,
            } => Self::RateLimited {
                service,
                retry_after,
            },
            RateLimitExceeded::DailyQuotaExhausted { service, .. } => {
                Self::QuotaExhausted { service }
            }
            e @ RateLimitExceeded::NoBudget { .. } => Self::FatalCall(e.to_string()),
        }
    }
}
