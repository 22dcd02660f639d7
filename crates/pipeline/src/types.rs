//! Shared value types for the issue-tally domain.
//!
//! These are the values that flow between the stages of one orchestration run:
//! the repository list produced by the listing capability, the per-repository
//! outcome produced by the dispatcher, and the durable row handed to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RemoteError, RepositoryId};

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// A repository discovered by listing an organization.
///
/// Identity is [`RepositoryRef::id`]; two refs with the same id denote the same
/// repository even if the names differ (e.g. after a rename between pages).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Platform-assigned repository id.
    pub id: RepositoryId,
    /// Repository name without the owner prefix.
    pub name: String,
}

impl RepositoryRef {
    /// Creates a new [`RepositoryRef`].
    pub fn new(id: RepositoryId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------

/// The durable row written for each successfully tallied repository.
///
/// Keyed by [`RepositoryRecord::id`]. Writing a record whose id already exists
/// replaces the stored fields (insert-or-merge); it never creates a second row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Platform-assigned repository id.
    pub id: RepositoryId,
    /// Repository name at the time of the run.
    pub name: String,
    /// Number of open issues (pull requests excluded).
    pub open_issues: u64,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of fetching the open-issue count for a single repository.
///
/// Produced exactly once per [`RepositoryRef`] by the dispatcher and consumed
/// exactly once by [`crate::aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub enum IssueCountOutcome {
    /// The count was fetched.
    Success {
        /// The repository the count belongs to.
        repository: RepositoryRef,
        /// Number of open issues.
        open_issues: u64,
    },
    /// The fetch failed; sibling fetches are unaffected.
    Failure {
        /// The repository whose fetch failed.
        repository: RepositoryRef,
        /// Why it failed.
        error: RemoteError,
    },
}

impl IssueCountOutcome {
    /// Returns the repository this outcome belongs to.
    pub fn repository(&self) -> &RepositoryRef {
        match self {
            Self::Success { repository, .. } | Self::Failure { repository, .. } => repository,
        }
    }

    /// Returns `true` for [`IssueCountOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
