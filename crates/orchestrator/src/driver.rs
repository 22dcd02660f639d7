//! The orchestration driver: one run, start to terminal report.
//!
//! A run walks `Listing → Dispatching → Aggregating → Persisting → Done`.
//! Only listing failures, persistence that committed nothing, and
//! cancellation move it to `Failed`; per-repository fetch failures are
//! isolated and surface in the report.

use std::collections::HashSet;
use std::sync::Arc;

use pipeline::{
    aggregate, ChunkFailure, ConfigurationError, FailedRepository, IssueCountOutcome,
    OrchestratorConfig, OrganizationName, PersistFailure, RecordSink, RemoteError, RepositoryId,
    RepositoryRecord, RepositoryRef, RepositorySource, ResolvedConfig, RetryPolicy, RunFailure,
    RunId, RunOutcome, RunReport, RunState, SinkError, Timestamp,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::dispatch::{dispatch, DispatchSettings};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Which repositories a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// List the organization and tally every repository in it.
    Organization,
    /// Skip listing and tally exactly these repositories, e.g. the failed
    /// subset of an earlier run.
    Repositories(Vec<RepositoryRef>),
}

/// Everything needed to start one run.
#[derive(Debug)]
pub struct RunRequest {
    run_id: RunId,
    organization: OrganizationName,
    scope: RunScope,
    cancel: CancellationToken,
    progress: Option<watch::Sender<RunState>>,
}

impl RunRequest {
    /// A run over every repository of `organization`.
    pub fn new(organization: OrganizationName) -> Self {
        Self {
            run_id: RunId::new_random(),
            organization,
            scope: RunScope::Organization,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// A run over `repositories` only; listing is skipped.
    pub fn for_repositories(organization: OrganizationName, repositories: Vec<RepositoryRef>) -> Self {
        Self {
            scope: RunScope::Repositories(repositories),
            ..Self::new(organization)
        }
    }

    /// Uses `run_id` instead of a freshly generated one.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Attaches a cancellation token the caller keeps a clone of.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publishes every state transition on `progress`.
    pub fn with_progress(mut self, progress: watch::Sender<RunState>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The id the run will report under.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The organization the run belongs to.
    pub fn organization(&self) -> &OrganizationName {
        &self.organization
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Sequences listing, dispatch, aggregation, and persistence for a run.
///
/// One driver serves any number of runs, sequentially or concurrently; the
/// remote client and sink it holds are shared by all of them.
pub struct Driver {
    source: Arc<dyn RepositorySource>,
    sink: Arc<dyn RecordSink>,
    config: ResolvedConfig,
}

impl Driver {
    /// Builds a driver, validating `config` against the sink's capacity.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for any invalid option; no remote call
    /// is made in that case.
    pub fn new(
        source: Arc<dyn RepositorySource>,
        sink: Arc<dyn RecordSink>,
        config: &OrchestratorConfig,
    ) -> Result<Self, ConfigurationError> {
        let config = config.resolve(sink.max_batch_size())?;
        Ok(Self {
            source,
            sink,
            config,
        })
    }

    /// The validated configuration this driver runs with.
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Executes one run to completion and returns its terminal report.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let span = tracing::info_span!(
            "orchestration_run",
            run_id = %request.run_id,
            organization = %request.organization,
        );
        self.execute(request).instrument(span).await
    }

    async fn execute(&self, request: RunRequest) -> RunReport {
        let RunRequest {
            run_id,
            organization,
            scope,
            cancel,
            progress,
        } = request;
        let mut run = RunProgress::new(run_id, organization, progress);

        // --- Listing ---
        let repositories = match scope {
            RunScope::Organization => {
                run.transition(RunState::Listing);
                let listed = self.list(&run.organization, &cancel).await;
                match listed {
                    Ok(repositories) => repositories,
                    Err(failure) => return run.fail(failure),
                }
            }
            RunScope::Repositories(repositories) => repositories,
        };
        let repositories = dedup_by_id(repositories);
        run.repositories_total = repositories.len();

        if cancel.is_cancelled() {
            let stage = run.state;
            return run.fail(RunFailure::Cancelled { stage });
        }

        // --- Dispatching ---
        run.transition(RunState::Dispatching);
        tracing::info!(
            repositories = repositories.len(),
            concurrency_limit = self.config.concurrency_limit().get(),
            "Dispatching issue-count fetches"
        );
        let outcomes = dispatch(
            Arc::clone(&self.source),
            repositories,
            DispatchSettings::from(&self.config),
            &cancel,
        )
        .await;
        run.record_failures(&outcomes);

        if cancel.is_cancelled() {
            // Counts fetched before the cancellation are never written; report
            // them so a retry covers them too.
            let fetched = outcomes.iter().filter_map(|outcome| match outcome {
                IssueCountOutcome::Success { repository, .. } => {
                    Some((repository.id, repository.name.clone()))
                }
                IssueCountOutcome::Failure { .. } => None,
            });
            run.record_unpersisted(fetched, NOT_PERSISTED_CANCELLED, true, RunState::Dispatching);
            return run.fail(RunFailure::Cancelled {
                stage: RunState::Dispatching,
            });
        }

        // --- Aggregating ---
        run.transition(RunState::Aggregating);
        let batch = aggregate(outcomes);
        tracing::info!(
            succeeded = batch.succeeded.len(),
            failed = batch.failed.len(),
            "Aggregated outcomes"
        );

        // --- Persisting ---
        run.transition(RunState::Persisting);
        let to_persist = batch.succeeded.len();
        let persisted = self.persist(batch.succeeded, &cancel).await;
        run.records_persisted = persisted.committed;
        run.failed_repositories.extend(persisted.unpersisted);
        run.failed_repositories.sort_by_key(|failed| failed.id);

        let cancelled_mid_persist = !persisted.failure.skipped.is_empty();
        let nothing_committed = persisted.committed == 0 && to_persist > 0;
        let last_chunk_error = persisted
            .failure
            .failed_chunks
            .last()
            .map(|chunk| chunk.error.to_string());
        if !persisted.failure.is_empty() {
            run.persist_failure = Some(persisted.failure);
        }

        if cancelled_mid_persist {
            return run.fail(RunFailure::Cancelled {
                stage: RunState::Persisting,
            });
        }
        let outcome = match last_chunk_error {
            Some(message) if nothing_committed => {
                return run.fail(RunFailure::Persistence { message });
            }
            Some(_) => RunOutcome::PartialSuccess,
            None if !run.failed_repositories.is_empty() => RunOutcome::PartialSuccess,
            None => RunOutcome::Success,
        };
        run.finish(outcome)
    }

    async fn list(
        &self,
        organization: &OrganizationName,
        cancel: &CancellationToken,
    ) -> Result<Vec<RepositoryRef>, RunFailure> {
        let call_timeout = self.config.call_timeout();
        let listing = tokio::time::timeout(
            call_timeout,
            self.source.list_repositories(organization),
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RunFailure::Cancelled { stage: RunState::Listing });
            }
            result = listing => result,
        };

        match result {
            Ok(Ok(repositories)) => {
                tracing::info!(repositories = repositories.len(), "Listed organization");
                Ok(repositories)
            }
            Ok(Err(source)) => Err(RunFailure::Precondition { source }),
            Err(_) => Err(RunFailure::Precondition {
                source: RemoteError::Timeout {
                    after: call_timeout,
                },
            }),
        }
    }

    async fn persist(&self, records: Vec<RepositoryRecord>, cancel: &CancellationToken) -> Persisted {
        let mut persisted = Persisted::default();
        let chunk_size = self.config.chunk_size().get();

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                persisted.skip(chunk);
                continue;
            }

            match self.submit_chunk(index, chunk, cancel).await {
                ChunkOutcome::Committed { attempts } => {
                    tracing::debug!(chunk = index, records = chunk.len(), attempts, "Chunk committed");
                    persisted.committed += chunk.len();
                }
                ChunkOutcome::Cancelled { attempts } => {
                    tracing::warn!(chunk = index, attempts, "Chunk abandoned by cancellation");
                    persisted.skip(chunk);
                }
                ChunkOutcome::Failed { attempts, error } => {
                    tracing::error!(
                        chunk = index,
                        records = chunk.len(),
                        attempts,
                        error = %error,
                        "Chunk could not be persisted"
                    );
                    let reason = format!("Not persisted: {error}");
                    let retryable = error.retry_policy().is_retryable();
                    persisted.unpersisted.extend(
                        chunk
                            .iter()
                            .map(|record| unpersisted(record, &reason, retryable)),
                    );
                    persisted.failure.failed_chunks.push(ChunkFailure {
                        index,
                        repositories: chunk.iter().map(|record| record.id).collect(),
                        attempts,
                        error,
                    });
                }
            }
        }

        if !persisted.failure.skipped.is_empty() {
            tracing::warn!(
                skipped = persisted.failure.skipped.len(),
                committed = persisted.committed,
                "Persistence stopped by cancellation"
            );
        }
        persisted
    }

    /// Submits one chunk, retrying retryable errors with exponential back-off.
    ///
    /// Cancellation is only observed between attempts; a write in flight is
    /// allowed to finish.
    async fn submit_chunk(
        &self,
        index: usize,
        chunk: &[RepositoryRecord],
        cancel: &CancellationToken,
    ) -> ChunkOutcome {
        let call_timeout = self.config.call_timeout();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = match tokio::time::timeout(call_timeout, self.sink.upsert_batch(chunk)).await
            {
                Ok(result) => result,
                Err(_) => Err(SinkError::transient(format!(
                    "batch write timed out after {}ms",
                    call_timeout.as_millis()
                ))),
            };

            let error = match result {
                Ok(()) => return ChunkOutcome::Committed { attempts },
                Err(error) => error,
            };

            let retries_used = attempts - 1;
            let delay = match error.retry_policy() {
                RetryPolicy::Retryable { after } if retries_used < self.config.retry_attempts() => {
                    let backoff = self.config.backoff_for(retries_used);
                    after.map_or(backoff, |after| after.max(backoff))
                }
                _ => return ChunkOutcome::Failed { attempts, error },
            };

            tracing::warn!(
                chunk = index,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Chunk write failed; retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ChunkOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

const NOT_PERSISTED_CANCELLED: &str = "Not persisted: run cancelled";

enum ChunkOutcome {
    Committed { attempts: u32 },
    Failed { attempts: u32, error: SinkError },
    /// Cancelled while waiting to retry; nothing from the chunk was written.
    Cancelled { attempts: u32 },
}

#[derive(Debug, Default)]
struct Persisted {
    committed: usize,
    failure: PersistFailure,
    unpersisted: Vec<FailedRepository>,
}

impl Persisted {
    fn skip(&mut self, chunk: &[RepositoryRecord]) {
        self.failure.skipped.extend(chunk.iter().map(|record| record.id));
        self.unpersisted.extend(
            chunk
                .iter()
                .map(|record| unpersisted(record, NOT_PERSISTED_CANCELLED, true)),
        );
    }
}

fn unpersisted(record: &RepositoryRecord, reason: &str, retryable: bool) -> FailedRepository {
    FailedRepository {
        id: record.id,
        name: record.name.clone(),
        reason: reason.to_string(),
        retryable,
        stage: RunState::Persisting,
    }
}

/// Drops repeated ids, keeping the first occurrence.
fn dedup_by_id(repositories: Vec<RepositoryRef>) -> Vec<RepositoryRef> {
    let mut seen = HashSet::with_capacity(repositories.len());
    let before = repositories.len();
    let unique: Vec<_> = repositories
        .into_iter()
        .filter(|repository| seen.insert(repository.id))
        .collect();
    if unique.len() != before {
        tracing::warn!(
            duplicates = before - unique.len(),
            "Listing returned duplicate repository ids"
        );
    }
    unique
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

struct RunProgress {
    run_id: RunId,
    organization: OrganizationName,
    state: RunState,
    progress: Option<watch::Sender<RunState>>,
    started_at: Timestamp,
    repositories_total: usize,
    records_persisted: usize,
    failed_repositories: Vec<FailedRepository>,
    persist_failure: Option<PersistFailure>,
}

impl RunProgress {
    fn new(
        run_id: RunId,
        organization: OrganizationName,
        progress: Option<watch::Sender<RunState>>,
    ) -> Self {
        Self {
            run_id,
            organization,
            state: RunState::Listing,
            progress,
            started_at: Timestamp::now(),
            repositories_total: 0,
            records_persisted: 0,
            failed_repositories: Vec::new(),
            persist_failure: None,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(from = %self.state, to = %next, "Run state transition");
        self.state = next;
        if let Some(progress) = &self.progress {
            progress.send_replace(next);
        }
    }

    fn record_failures(&mut self, outcomes: &[IssueCountOutcome]) {
        for outcome in outcomes {
            if let IssueCountOutcome::Failure { repository, error } = outcome {
                tracing::warn!(
                    repository_id = %repository.id,
                    repository = %repository.name,
                    error = %error,
                    "Issue-count fetch failed"
                );
                self.failed_repositories.push(FailedRepository {
                    id: repository.id,
                    name: repository.name.clone(),
                    reason: error.to_string(),
                    retryable: error.retry_policy().is_retryable(),
                    stage: RunState::Dispatching,
                });
            }
        }
        self.failed_repositories.sort_by_key(|failed| failed.id);
    }

    fn record_unpersisted(
        &mut self,
        repositories: impl IntoIterator<Item = (RepositoryId, String)>,
        reason: &str,
        retryable: bool,
        stage: RunState,
    ) {
        self.failed_repositories
            .extend(repositories.into_iter().map(|(id, name)| FailedRepository {
                id,
                name,
                reason: reason.to_string(),
                retryable,
                stage,
            }));
        self.failed_repositories.sort_by_key(|failed| failed.id);
    }

    fn fail(mut self, failure: RunFailure) -> RunReport {
        tracing::error!(stage = %self.state, failure = %failure, "Run failed");
        self.transition(RunState::Failed);
        self.report(RunOutcome::Failed, Some(failure))
    }

    fn finish(mut self, outcome: RunOutcome) -> RunReport {
        self.transition(RunState::Done);
        tracing::info!(
            outcome = ?outcome,
            records_persisted = self.records_persisted,
            failed_repositories = self.failed_repositories.len(),
            "Run finished"
        );
        self.report(outcome, None)
    }

    fn report(self, outcome: RunOutcome, failure: Option<RunFailure>) -> RunReport {
        RunReport {
            run_id: self.run_id,
            organization: self.organization,
            outcome,
            repositories_total: self.repositories_total,
            records_persisted: self.records_persisted,
            failed_repositories: self.failed_repositories,
            persist_failure: self.persist_failure,
            failure,
            started_at: self.started_at,
            finished_at: Timestamp::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
