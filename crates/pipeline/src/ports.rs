//! Port traits implemented by infrastructure crates.
//!
//! The orchestrator only ever talks to the hosting platform and the record
//! store through these two traits. Test doubles implement them directly.

use async_trait::async_trait;

use crate::{OrganizationName, RemoteError, RepositoryId, RepositoryRecord, RepositoryRef, SinkError};

/// Read access to the hosting platform.
///
/// Implementations own authentication, pagination, and rate-limit header
/// handling. They must be safe to call concurrently from many workers; the
/// orchestrator shares one instance across every worker of every run.
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Lists every repository owned by `organization`, following pagination
    /// to the end.
    ///
    /// # Errors
    ///
    /// [`RemoteError::NotFound`] if the organization does not exist,
    /// [`RemoteError::Auth`] or [`RemoteError::RateLimited`] as reported by
    /// the platform.
    async fn list_repositories(
        &self,
        organization: &OrganizationName,
    ) -> Result<Vec<RepositoryRef>, RemoteError>;

    /// Returns the number of currently open issues in `repository`.
    async fn open_issue_count(&self, repository: RepositoryId) -> Result<u64, RemoteError>;
}

/// Durable, keyed storage for [`RepositoryRecord`]s.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// The largest batch [`RecordSink::upsert_batch`] accepts.
    fn max_batch_size(&self) -> usize;

    /// Inserts or merges every record in `records`, keyed by repository id.
    ///
    /// Implementations apply the batch as atomically as the store allows.
    /// Submitting the same batch twice leaves the store in the same state as
    /// submitting it once.
    ///
    /// # Errors
    ///
    /// [`SinkError::CapacityExceeded`] if `records.len()` is larger than
    /// [`RecordSink::max_batch_size`]; [`SinkError::Transient`] for failures
    /// that may succeed on resubmission.
    async fn upsert_batch(&self, records: &[RepositoryRecord]) -> Result<(), SinkError>;
}
