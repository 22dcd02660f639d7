//! Error and retry-policy types for the issue-tally domain.
//!
//! Errors are split by blast radius:
//!
//! - [`RemoteError`]: a single call to the hosting platform failed. When it
//!   happens during listing it fails the run; when it happens for one repository
//!   it is isolated to that repository's outcome.
//! - [`SinkError`]: a batch write to the record store failed.
//! - [`ConfigurationError`]: the orchestrator was configured with values it
//!   cannot run with; raised before any remote call is made.
//! - [`RunFailure`]: why a run ended in the `Failed` state.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RunState;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the orchestrator decide
/// whether to re-invoke an operation without escalating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from `Retry-After` or `x-ratelimit-reset` response headers).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Remote repository client errors
// ---------------------------------------------------------------------------

/// Failure of a single call against the hosting platform's API.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// The organization or repository does not exist (or is not visible to
    /// the configured credentials).
    #[error("Not found: {resource}")]
    NotFound {
        /// What was being looked up, e.g. `"organization acme"`.
        resource: String,
    },

    /// The credentials were rejected or lack the required scope.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Message returned by the platform.
        message: String,
    },

    /// The platform's rate limit was hit.
    #[error("Rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// How long the platform asked us to wait, when it said.
        retry_after: Option<Duration>,
    },

    /// The call did not complete within the configured call timeout.
    #[error("Timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The call was never started because the run was cancelled.
    #[error("Cancelled before the call was started")]
    Cancelled,

    /// Network, TLS, or decoding failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the underlying failure.
        message: String,
    },

    /// The platform answered with a status code this client does not expect.
    #[error("Unexpected response status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body (possibly truncated) for debugging.
        body: String,
    },

    /// The worker performing the call died before producing a result.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of what went wrong.
        message: String,
    },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl RemoteError {
    /// Returns the retry semantics of this error.
    ///
    /// The dispatcher never retries; callers re-running the failed subset of a
    /// run use this to decide which repositories are worth re-submitting.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Timeout { .. } | Self::Transport { .. } | Self::Cancelled => {
                RetryPolicy::Retryable { after: None }
            }
            Self::UnexpectedStatus { status, .. } if *status >= 500 => {
                RetryPolicy::Retryable { after: None }
            }
            Self::NotFound { .. }
            | Self::Auth { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Internal { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence sink errors
// ---------------------------------------------------------------------------

/// Failure of a batch write against the record store.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SinkError {
    /// The batch was larger than the sink accepts.
    ///
    /// Chunking in the driver must prevent this; seeing it is a programming
    /// error and it is never retried.
    #[error("Batch of {len} records exceeds sink capacity of {max}")]
    CapacityExceeded {
        /// Size of the rejected batch.
        len: usize,
        /// The sink's declared maximum batch size.
        max: usize,
    },

    /// A failure that may succeed if the same batch is submitted again.
    #[error("Transient sink error: {message}")]
    Transient {
        /// Description of the underlying failure.
        message: String,
        /// Minimum delay the store asked for before the next attempt.
        retry_after: Option<Duration>,
    },
}

impl SinkError {
    /// Convenience constructor for a [`SinkError::Transient`] without a delay hint.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Returns the retry semantics of this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::CapacityExceeded { .. } => RetryPolicy::NonRetryable,
            Self::Transient { retry_after, .. } => RetryPolicy::Retryable {
                after: *retry_after,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// The orchestrator configuration is invalid.
///
/// Produced when a driver is constructed; a run never starts with an invalid
/// configuration, so no remote call is ever made under one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// `concurrency_limit` must be at least 1.
    #[error("Concurrency limit must be at least 1, got {0}")]
    ConcurrencyLimit(usize),

    /// `persist_chunk_size` must be at least 1.
    #[error("Persist chunk size must be at least 1, got {0}")]
    ChunkSize(usize),

    /// `persist_chunk_size` is larger than the sink accepts in one batch.
    #[error("Persist chunk size {chunk_size} exceeds the sink's maximum batch size of {sink_max}")]
    ChunkSizeExceedsSink {
        /// Configured chunk size.
        chunk_size: usize,
        /// Sink-declared maximum.
        sink_max: usize,
    },

    /// The sink declared a maximum batch size of zero.
    #[error("Sink declares a maximum batch size of 0")]
    SinkCapacity,

    /// `call_timeout` must be non-zero.
    #[error("Call timeout must be greater than zero")]
    CallTimeout,
}

// ---------------------------------------------------------------------------
// Run-level failures
// ---------------------------------------------------------------------------

/// Why a run ended in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RunFailure {
    /// The organization could not be listed; nothing was dispatched.
    #[error("Organization could not be listed: {source}")]
    Precondition {
        /// The listing error.
        source: RemoteError,
    },

    /// Cancellation was requested while the run was in `stage`.
    #[error("Run cancelled during {stage}")]
    Cancelled {
        /// The state the run was in when cancellation was observed.
        stage: RunState,
    },

    /// Every chunk submitted to the sink failed, so nothing was persisted.
    #[error("Nothing could be persisted: {message}")]
    Persistence {
        /// Summary of the last chunk failure.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_carries_its_delay_into_the_retry_policy() {
        let err = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(err.to_string(), "Rate limited (retry after 30s)");
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = RemoteError::NotFound {
            resource: "organization ghost".into(),
        };
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    }

    #[test]
    fn server_errors_are_retryable_but_client_errors_are_not() {
        let server = RemoteError::UnexpectedStatus {
            status: 502,
            body: String::new(),
        };
        let client = RemoteError::UnexpectedStatus {
            status: 422,
            body: String::new(),
        };
        assert!(server.retry_policy().is_retryable());
        assert!(!client.retry_policy().is_retryable());
    }

    #[test]
    fn capacity_exceeded_is_never_retried() {
        let err = SinkError::CapacityExceeded { len: 101, max: 100 };
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
        assert!(SinkError::transient("disk busy").retry_policy().is_retryable());
    }

    #[test]
    fn timeout_message_reports_milliseconds() {
        let err = RemoteError::Timeout {
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Timed out after 1500ms");
    }
}
