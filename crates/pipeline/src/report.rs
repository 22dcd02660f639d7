//! Run states and the terminal run report.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{OrganizationName, RepositoryId, RunFailure, RunId, SinkError, Timestamp};

/// Stage of the orchestration state machine.
///
/// `Listing → Dispatching → Aggregating → Persisting → Done`, with `Failed`
/// reachable from `Listing` and `Persisting` (and from any stage on
/// cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Listing the organization's repositories.
    Listing,
    /// Fetching open-issue counts under the concurrency cap.
    Dispatching,
    /// Folding outcomes into a batch.
    Aggregating,
    /// Writing records to the sink, chunk by chunk.
    Persisting,
    /// Finished; the report is final.
    Done,
    /// Finished without completing the pipeline.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Listing => "listing",
            Self::Dispatching => "dispatching",
            Self::Aggregating => "aggregating",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every repository was tallied and every record persisted.
    Success,
    /// Some repositories failed to fetch, or some chunks failed to persist.
    PartialSuccess,
    /// The run could not do its job at all.
    Failed,
}

/// A repository whose count did not reach the store.
///
/// Either the fetch failed, or the count was fetched but its record was never
/// committed (failed chunk, cancellation). Both kinds are retried the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRepository {
    /// Repository id; re-submit this to retry.
    pub id: RepositoryId,
    /// Repository name, for humans.
    pub name: String,
    /// Why the repository was not tallied.
    pub reason: String,
    /// Whether retrying could plausibly succeed.
    pub retryable: bool,
    /// Stage the repository dropped out at: `Dispatching` when its fetch failed
    /// or the run stopped before persisting, `Persisting` when its record was
    /// not committed.
    pub stage: RunState,
}

/// One sink batch that could not be committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    /// Zero-based position of the chunk in submission order.
    pub index: usize,
    /// Repository ids the chunk contained; none of them were written.
    pub repositories: Vec<RepositoryId>,
    /// Submissions made, including the first.
    pub attempts: u32,
    /// The error of the last attempt.
    pub error: SinkError,
}

/// Everything that went wrong while persisting.
///
/// Chunks not listed here were committed. There is no cross-chunk atomicity:
/// a failed chunk does not roll back earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistFailure {
    /// Chunks that failed after exhausting their retries.
    pub failed_chunks: Vec<ChunkFailure>,
    /// Records never submitted because the run was cancelled mid-persist.
    pub skipped: Vec<RepositoryId>,
}

impl PersistFailure {
    /// Returns `true` if nothing went wrong.
    pub fn is_empty(&self) -> bool {
        self.failed_chunks.is_empty() && self.skipped.is_empty()
    }
}

// ---------------------------------------------------------------------------

/// The terminal report of one orchestration run.
///
/// Always enumerates every failed repository with its reason, even on
/// [`RunOutcome::PartialSuccess`], so a caller can retry exactly that subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run this report belongs to.
    pub run_id: RunId,
    /// The organization that was tallied.
    pub organization: OrganizationName,
    /// Overall verdict.
    pub outcome: RunOutcome,
    /// Number of repositories the run dispatched.
    pub repositories_total: usize,
    /// Number of records the sink committed.
    pub records_persisted: usize,
    /// Repositories that were not tallied, ascending by id.
    ///
    /// Includes fetched repositories whose records were never committed, so
    /// this is always the complete set to retry.
    pub failed_repositories: Vec<FailedRepository>,
    /// Persistence problems, if any.
    pub persist_failure: Option<PersistFailure>,
    /// Why the run failed, when [`RunOutcome::Failed`].
    pub failure: Option<RunFailure>,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run reached a terminal state.
    pub finished_at: Timestamp,
}

impl RunReport {
    /// Ids of the repositories that were not tallied.
    pub fn failed_repository_ids(&self) -> BTreeSet<RepositoryId> {
        self.failed_repositories.iter().map(|f| f.id).collect()
    }
}
