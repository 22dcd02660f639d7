//! Fan-out: one issue-count fetch per repository, under a concurrency cap.
//!
//! Every ref handed to [`dispatch`] produces exactly one [`IssueCountOutcome`].
//! A failing, slow, or panicking fetch only ever affects its own outcome.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use pipeline::{IssueCountOutcome, RemoteError, RepositoryRef, RepositorySource, ResolvedConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Knobs for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum number of fetches in flight at once.
    pub concurrency_limit: NonZeroUsize,
    /// Upper bound on each fetch.
    pub call_timeout: Duration,
}

impl From<&ResolvedConfig> for DispatchSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit(),
            call_timeout: config.call_timeout(),
        }
    }
}

/// Fetches the open-issue count of every repository in `refs`.
///
/// Returns once every ref has an outcome. Outcomes are in completion order,
/// not input order.
///
/// Once `cancel` fires no new fetch is started; refs that had not started yet
/// get a [`RemoteError::Cancelled`] failure. Fetches already in flight run to
/// completion (bounded by the call timeout).
pub async fn dispatch(
    source: Arc<dyn RepositorySource>,
    refs: Vec<RepositoryRef>,
    settings: DispatchSettings,
    cancel: &CancellationToken,
) -> Vec<IssueCountOutcome> {
    if refs.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(settings.concurrency_limit.get()));
    let mut join_set = JoinSet::new();
    let mut pending = HashMap::with_capacity(refs.len());

    for repository in refs {
        let task = fetch_one(
            Arc::clone(&source),
            repository.clone(),
            Arc::clone(&semaphore),
            cancel.clone(),
            settings.call_timeout,
        );
        let handle = join_set.spawn(task);
        pending.insert(handle.id(), repository);
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((task_id, outcome)) => {
                pending.remove(&task_id);
                outcomes.push(outcome);
            }
            Err(join_error) => {
                // A worker panicked; its repository still gets an outcome.
                if let Some(repository) = pending.remove(&join_error.id()) {
                    tracing::error!(
                        repository_id = %repository.id,
                        repository = %repository.name,
                        error = %join_error,
                        "Issue-count worker died"
                    );
                    outcomes.push(IssueCountOutcome::Failure {
                        repository,
                        error: RemoteError::Internal {
                            message: format!("worker task failed: {join_error}"),
                        },
                    });
                }
            }
        }
    }

    outcomes
}

async fn fetch_one(
    source: Arc<dyn RepositorySource>,
    repository: RepositoryRef,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    call_timeout: Duration,
) -> IssueCountOutcome {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return IssueCountOutcome::Failure {
            repository,
            error: RemoteError::Cancelled,
        };
    };

    let result = match tokio::time::timeout(call_timeout, source.open_issue_count(repository.id))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            after: call_timeout,
        }),
    };

    match result {
        Ok(open_issues) => {
            tracing::debug!(
                repository_id = %repository.id,
                repository = %repository.name,
                open_issues,
                "Fetched open-issue count"
            );
            IssueCountOutcome::Success {
                repository,
                open_issues,
            }
        }
        Err(error) => IssueCountOutcome::Failure { repository, error },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Instant;

    use pipeline::RepositoryId;

    use super::*;
    use crate::test_support::{refs, FakeSource, Script};

    fn settings(limit: usize, timeout_ms: u64) -> DispatchSettings {
        DispatchSettings {
            concurrency_limit: NonZeroUsize::new(limit).unwrap(),
            call_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn ids(outcomes: &[IssueCountOutcome]) -> BTreeSet<u64> {
        outcomes
            .iter()
            .map(|o| o.repository().id.as_u64())
            .collect()
    }

    #[tokio::test]
    async fn empty_input_yields_no_outcomes_and_no_calls() {
        let source = Arc::new(FakeSource::new());
        let outcomes = dispatch(
            source.clone(),
            Vec::new(),
            settings(4, 1_000),
            &CancellationToken::new(),
        )
        .await;

        assert!(outcomes.is_empty());
        assert_eq!(source.issue_calls(), 0);
    }

    #[tokio::test]
    async fn every_ref_yields_exactly_one_outcome_despite_failures() {
        for n in [1usize, 2, 7, 25] {
            let source = FakeSource::new();
            for id in 1..=n as u64 {
                let script = match id % 3 {
                    0 => Script::Fail(RemoteError::Transport {
                        message: "connection reset".into(),
                    }),
                    1 => Script::Count(id).after(Duration::from_millis(id % 5)),
                    _ => Script::Count(0),
                };
                source.script(id, script);
            }
            let source = Arc::new(source);
            let input = refs(1..=n as u64);

            let outcomes = dispatch(
                source.clone(),
                input,
                settings(3, 1_000),
                &CancellationToken::new(),
            )
            .await;

            assert_eq!(outcomes.len(), n, "n = {n}");
            assert_eq!(ids(&outcomes), (1..=n as u64).collect::<BTreeSet<_>>());
            assert_eq!(source.issue_calls(), n);
        }
    }

    #[tokio::test]
    async fn in_flight_calls_never_exceed_the_limit() {
        let source = FakeSource::new();
        for id in 1..=20 {
            source.script(id, Script::Count(1).after(Duration::from_millis(15)));
        }
        let source = Arc::new(source);

        let outcomes = dispatch(
            source.clone(),
            refs(1..=20),
            settings(4, 1_000),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes.len(), 20);
        assert!(source.max_in_flight() <= 4);
        assert!(source.max_in_flight() >= 2, "calls should overlap");
    }

    #[tokio::test]
    async fn timed_out_call_becomes_a_failure_for_that_repository_only() {
        let source = FakeSource::new();
        source.script(1, Script::Count(5));
        source.script(2, Script::Count(9).after(Duration::from_secs(5)));
        source.script(3, Script::Count(2));
        let source = Arc::new(source);

        let outcomes = dispatch(
            source,
            refs(1..=3),
            settings(3, 50),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            match outcome {
                IssueCountOutcome::Failure { repository, error } => {
                    assert_eq!(repository.id, RepositoryId::new(2));
                    assert_eq!(
                        error,
                        &RemoteError::Timeout {
                            after: Duration::from_millis(50)
                        }
                    );
                }
                IssueCountOutcome::Success {
                    repository,
                    open_issues,
                } => match repository.id.as_u64() {
                    1 => assert_eq!(*open_issues, 5),
                    3 => assert_eq!(*open_issues, 2),
                    other => panic!("unexpected success for {other}"),
                },
            }
        }
    }

    #[tokio::test]
    async fn failure_of_one_repository_does_not_delay_another() {
        // Repository 1 hangs until its timeout; repository 2 answers quickly.
        let source = FakeSource::new();
        source.script(1, Script::Count(1).after(Duration::from_millis(400)));
        source.script(2, Script::Count(7).after(Duration::from_millis(10)));
        let source = Arc::new(source);

        let started = Instant::now();
        let outcomes = dispatch(
            source.clone(),
            refs(1..=2),
            settings(2, 200),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        // Outcomes arrive in completion order: the fast sibling comes first.
        assert_eq!(
            outcomes[0],
            IssueCountOutcome::Success {
                repository: RepositoryRef::new(RepositoryId::new(2), "repo-2"),
                open_issues: 7
            }
        );
        let latency = source.completed_after(2).unwrap();
        assert!(
            latency < Duration::from_millis(150),
            "sibling latency {latency:?} was affected"
        );
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn panicking_worker_still_produces_an_outcome() {
        let source = FakeSource::new();
        source.script(1, Script::Count(3));
        source.script(2, Script::Panic);
        let source = Arc::new(source);

        let outcomes = dispatch(
            source,
            refs(1..=2),
            settings(2, 1_000),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            IssueCountOutcome::Failure {
                error: RemoteError::Internal { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_starts_no_calls() {
        let source = Arc::new(FakeSource::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = dispatch(source.clone(), refs(1..=5), settings(2, 1_000), &cancel).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            IssueCountOutcome::Failure {
                error: RemoteError::Cancelled,
                ..
            }
        )));
        assert_eq!(source.issue_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_dispatch_stops_new_calls_but_keeps_in_flight_results() {
        let source = FakeSource::new();
        for id in 1..=6 {
            source.script(id, Script::Count(id).after(Duration::from_millis(100)));
        }
        let source = Arc::new(source);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcomes = dispatch(source.clone(), refs(1..=6), settings(2, 1_000), &cancel).await;

        assert_eq!(outcomes.len(), 6);
        assert_eq!(source.issue_calls(), 2);
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let cancelled = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    IssueCountOutcome::Failure {
                        error: RemoteError::Cancelled,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(succeeded, 2);
        assert_eq!(cancelled, 4);
    }
}
