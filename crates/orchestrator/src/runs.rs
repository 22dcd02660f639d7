//! Registry of background runs, backing the start/poll/cancel trigger surface.
//!
//! Each run executes on its own tokio task. The registry keeps, per run, the
//! latest state published by the driver, the terminal report once it exists,
//! and a cancellation token that is a child of the registry-wide shutdown token.
//! Finished runs are kept up to a retention cap; the oldest are evicted first.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pipeline::{OrganizationName, RepositoryRef, RunId, RunOutcome, RunReport, RunState, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::driver::{Driver, RunRequest};

/// Coarse status exposed to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run has not produced a report yet.
    Running,
    /// The run finished with `Success` or `PartialSuccess`.
    Completed,
    /// The run finished with `Failed`, or its task died.
    Failed,
}

/// Point-in-time view of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// The run.
    pub run_id: RunId,
    /// The organization being tallied.
    pub organization: OrganizationName,
    /// Coarse status.
    pub status: RunStatus,
    /// Latest state-machine stage.
    pub stage: RunState,
    /// When the run was started.
    pub started_at: Timestamp,
    /// The terminal report, once the run has finished.
    pub report: Option<RunReport>,
}

/// Errors returned by [`RunRegistry`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No run with this id was ever started.
    #[error("Run {0} not found")]
    NotFound(RunId),

    /// The run already has a terminal report.
    #[error("Run {0} has already finished")]
    AlreadyFinished(RunId),

    /// The run has not finished yet.
    #[error("Run {0} is still running")]
    StillRunning(RunId),

    /// The run finished without any failed repositories.
    #[error("Run {0} has no failed repositories to retry")]
    NothingToRetry(RunId),

    /// The run's task ended without producing a report.
    #[error("Run {0} ended without a report")]
    Abandoned(RunId),
}

struct RunEntry {
    organization: OrganizationName,
    started_at: Timestamp,
    stage: watch::Receiver<RunState>,
    report: watch::Receiver<Option<RunReport>>,
    cancel: CancellationToken,
}

impl RunEntry {
    fn is_finished(&self) -> bool {
        self.report.borrow().is_some() || self.report.has_changed().is_err()
    }

    fn snapshot(&self, run_id: RunId) -> RunSnapshot {
        let report = self.report.borrow().clone();
        let status = match &report {
            Some(report) if report.outcome == RunOutcome::Failed => RunStatus::Failed,
            Some(_) => RunStatus::Completed,
            // Sender dropped without a report: the task died.
            None if self.report.has_changed().is_err() => RunStatus::Failed,
            None => RunStatus::Running,
        };
        RunSnapshot {
            run_id,
            organization: self.organization.clone(),
            status,
            stage: *self.stage.borrow(),
            started_at: self.started_at,
            report,
        }
    }
}

/// Finished runs kept by default before the oldest are evicted.
pub const DEFAULT_RETAINED_RUNS: usize = 1_000;

/// Starts runs in the background and answers questions about them.
///
/// Cheap to clone; all clones share the same runs.
#[derive(Clone)]
pub struct RunRegistry {
    driver: Arc<Driver>,
    runs: Arc<RwLock<HashMap<RunId, RunEntry>>>,
    shutdown: CancellationToken,
    retained: usize,
}

impl RunRegistry {
    /// Creates an empty registry whose runs are executed by `driver`.
    pub fn new(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            retained: DEFAULT_RETAINED_RUNS,
        }
    }

    /// Keeps at most `max_finished` finished runs; running runs are never evicted.
    pub fn with_retention(mut self, max_finished: usize) -> Self {
        self.retained = max_finished;
        self
    }

    /// Starts a run over every repository of `organization`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, organization: OrganizationName) -> RunId {
        self.launch(RunRequest::new(organization))
    }

    /// Starts a new run over the repositories that failed in `run_id`.
    ///
    /// Listing is skipped; exactly the failed subset is fetched again. That
    /// subset includes repositories whose counts were fetched but never
    /// committed.
    pub fn retry_failed(&self, run_id: RunId) -> Result<RunId, RegistryError> {
        let snapshot = self.status(run_id)?;
        let report = snapshot
            .report
            .ok_or(RegistryError::StillRunning(run_id))?;
        if report.failed_repositories.is_empty() {
            return Err(RegistryError::NothingToRetry(run_id));
        }

        let repositories = report
            .failed_repositories
            .iter()
            .map(|failed| RepositoryRef::new(failed.id, failed.name.clone()))
            .collect();
        tracing::info!(
            previous_run = %run_id,
            repositories = report.failed_repositories.len(),
            "Retrying failed repositories"
        );
        Ok(self.launch(RunRequest::for_repositories(
            report.organization,
            repositories,
        )))
    }

    fn launch(&self, request: RunRequest) -> RunId {
        let run_id = request.run_id();
        let organization = request.organization().clone();
        let cancel = self.shutdown.child_token();
        let (stage_tx, stage_rx) = watch::channel(RunState::Listing);
        let (report_tx, report_rx) = watch::channel(None);

        {
            let mut runs = self.write();
            self.evict_finished(&mut runs);
            runs.insert(
                run_id,
                RunEntry {
                    organization,
                    started_at: Timestamp::now(),
                    stage: stage_rx,
                    report: report_rx,
                    cancel: cancel.clone(),
                },
            );
        }

        let driver = Arc::clone(&self.driver);
        let request = request.with_cancellation(cancel).with_progress(stage_tx);
        tokio::spawn(async move {
            let report = driver.run(request).await;
            report_tx.send_replace(Some(report));
        });

        tracing::info!(run_id = %run_id, "Run started");
        run_id
    }

    /// Returns the current view of `run_id`.
    pub fn status(&self, run_id: RunId) -> Result<RunSnapshot, RegistryError> {
        self.read()
            .get(&run_id)
            .map(|entry| entry.snapshot(run_id))
            .ok_or(RegistryError::NotFound(run_id))
    }

    /// Returns every known run, newest first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let mut snapshots: Vec<_> = self
            .read()
            .iter()
            .map(|(run_id, entry)| entry.snapshot(*run_id))
            .collect();
        snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        snapshots
    }

    /// Requests cooperative cancellation of a running run.
    pub fn cancel(&self, run_id: RunId) -> Result<(), RegistryError> {
        let runs = self.read();
        let entry = runs.get(&run_id).ok_or(RegistryError::NotFound(run_id))?;
        if entry.report.borrow().is_some() {
            return Err(RegistryError::AlreadyFinished(run_id));
        }
        entry.cancel.cancel();
        tracing::info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// Waits for `run_id` to finish and returns its report.
    pub async fn wait(&self, run_id: RunId) -> Result<RunReport, RegistryError> {
        let mut report = self
            .read()
            .get(&run_id)
            .map(|entry| entry.report.clone())
            .ok_or(RegistryError::NotFound(run_id))?;

        let finished = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RegistryError::Abandoned(run_id))?;
        finished.clone().ok_or(RegistryError::Abandoned(run_id))
    }

    /// Cancels every run still in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drops the oldest finished runs so that, with the run about to be
    /// inserted, no more than `retained` finished runs remain.
    fn evict_finished(&self, runs: &mut HashMap<RunId, RunEntry>) {
        let mut finished: Vec<(Timestamp, RunId)> = runs
            .iter()
            .filter(|(_, entry)| entry.is_finished())
            .map(|(run_id, entry)| (entry.started_at, *run_id))
            .collect();
        if finished.len() <= self.retained {
            return;
        }

        finished.sort_by(|a, b| a.0.cmp(&b.0));
        let excess = finished.len() - self.retained;
        for (_, run_id) in finished.into_iter().take(excess) {
            runs.remove(&run_id);
            tracing::debug!(run_id = %run_id, "Evicted finished run");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunEntry>> {
        self.runs.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
