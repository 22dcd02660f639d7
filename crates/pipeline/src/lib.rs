//! Core domain for issue-tally.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, error type, and port trait used by the orchestrator. Infrastructure
//! crates implement the traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepositoryId`, `RunId`, `OrganizationName`) |
//! | [`types`] | Repository refs, durable records, per-repository outcomes |
//! | [`aggregate`] | The pure fan-in step producing a [`BatchResult`] |
//! | [`report`] | Run states and the terminal [`RunReport`] |
//! | [`config`] | Orchestrator options and their validation |
//! | [`ports`] | `RepositorySource` and `RecordSink` traits |
//! | [`errors`] | Error and retry-policy types |

pub mod aggregate;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod report;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use aggregate::{aggregate, BatchResult};
pub use config::{
    OrchestratorConfig, ResolvedConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_CONCURRENCY_LIMIT,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF,
};
pub use errors::{ConfigurationError, RemoteError, RetryPolicy, RunFailure, SinkError};
pub use identifiers::{OrganizationName, RepositoryId, RunId};
pub use ports::{RecordSink, RepositorySource};
pub use report::{ChunkFailure, FailedRepository, PersistFailure, RunOutcome, RunReport, RunState};
pub use types::{IssueCountOutcome, RepositoryRecord, RepositoryRef, Timestamp};
