//! Fan-in: folding per-repository outcomes into one batch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{IssueCountOutcome, RepositoryId, RepositoryRecord};

/// The joined result of one dispatch.
///
/// `succeeded` is sorted by repository id so two aggregations of the same
/// outcomes compare equal whatever order the outcomes arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Records ready to persist, ascending by id.
    pub succeeded: Vec<RepositoryRecord>,
    /// Ids of repositories whose fetch failed.
    pub failed: BTreeSet<RepositoryId>,
}

impl BatchResult {
    /// Total number of outcomes represented.
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Returns `true` if no outcome was aggregated.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

/// Partitions `outcomes` into records to persist and ids that failed.
///
/// Error details are dropped here; callers that need them (for logging or for
/// the run report) read them before aggregating.
pub fn aggregate(outcomes: Vec<IssueCountOutcome>) -> BatchResult {
    let mut result = BatchResult::default();

    for outcome in outcomes {
        match outcome {
            IssueCountOutcome::Success {
                repository,
                open_issues,
            } => result.succeeded.push(RepositoryRecord {
                id: repository.id,
                name: repository.name,
                open_issues,
            }),
            IssueCountOutcome::Failure { repository, .. } => {
                result.failed.insert(repository.id);
            }
        }
    }

    result.succeeded.sort_by_key(|record| record.id);
    result
}
