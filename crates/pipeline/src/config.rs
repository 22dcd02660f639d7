//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] is the raw, user-supplied form. It is resolved
//! against the sink's declared capacity into a [`ResolvedConfig`] exactly once,
//! when a driver is built. Nothing downstream re-validates.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigurationError;

/// Default number of issue-count fetches allowed in flight at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 8;

/// Default per-call timeout for every remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries for a failing persistence chunk.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay of the exponential back-off between persistence retries.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// User-facing orchestrator options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of issue-count fetches in flight at once. Must be ≥ 1.
    pub concurrency_limit: usize,

    /// Number of records per sink batch. `None` uses the sink's maximum.
    pub persist_chunk_size: Option<usize>,

    /// Upper bound on every individual remote call.
    pub call_timeout: Duration,

    /// How many times a failing persistence chunk is retried after the first
    /// attempt. Remote calls are never retried by the orchestrator.
    pub retry_attempts: u32,

    /// Base delay for persistence retries; attempt `n` waits `retry_backoff * 2^n`.
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            persist_chunk_size: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl OrchestratorConfig {
    /// Validates this configuration against the sink's maximum batch size.
    pub fn resolve(&self, sink_max: usize) -> Result<ResolvedConfig, ConfigurationError> {
        let concurrency_limit = NonZeroUsize::new(self.concurrency_limit)
            .ok_or(ConfigurationError::ConcurrencyLimit(self.concurrency_limit))?;

        let sink_max = NonZeroUsize::new(sink_max).ok_or(ConfigurationError::SinkCapacity)?;

        let chunk_size = match self.persist_chunk_size {
            None => sink_max,
            Some(requested) => {
                let chunk = NonZeroUsize::new(requested)
                    .ok_or(ConfigurationError::ChunkSize(requested))?;
                if chunk > sink_max {
                    return Err(ConfigurationError::ChunkSizeExceedsSink {
                        chunk_size: requested,
                        sink_max: sink_max.get(),
                    });
                }
                chunk
            }
        };

        if self.call_timeout.is_zero() {
            return Err(ConfigurationError::CallTimeout);
        }

        Ok(ResolvedConfig {
            concurrency_limit,
            chunk_size,
            call_timeout: self.call_timeout,
            retry_attempts: self.retry_attempts,
            retry_backoff: self.retry_backoff,
        })
    }
}

/// A validated configuration. Only obtainable through [`OrchestratorConfig::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConfig {
    concurrency_limit: NonZeroUsize,
    chunk_size: NonZeroUsize,
    call_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl ResolvedConfig {
    /// Maximum number of issue-count fetches in flight at once.
    pub fn concurrency_limit(&self) -> NonZeroUsize {
        self.concurrency_limit
    }

    /// Records per sink batch.
    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Upper bound on every individual remote call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Retries per persistence chunk after the first attempt.
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Back-off before retry number `attempt` (zero-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}
