//! Scriptable doubles for the two ports, shared by this crate's tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline::{
    OrganizationName, RecordSink, RemoteError, RepositoryId, RepositoryRecord, RepositoryRef,
    RepositorySource, SinkError,
};

pub(crate) fn refs(ids: impl IntoIterator<Item = u64>) -> Vec<RepositoryRef> {
    ids.into_iter()
        .map(|id| RepositoryRef::new(RepositoryId::new(id), format!("repo-{id}")))
        .collect()
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// What a scripted `open_issue_count` call does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Count(u64),
    Fail(RemoteError),
    Panic,
    Delayed(Duration, Box<Script>),
}

impl Script {
    pub(crate) fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeSource {
    listing: Mutex<Result<Vec<RepositoryRef>, RemoteError>>,
    listing_delay: Mutex<Duration>,
    scripts: Mutex<HashMap<u64, Script>>,
    list_calls: AtomicUsize,
    issue_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: Mutex<HashMap<u64, Duration>>,
}

impl FakeSource {
    /// A source whose organization has no repositories.
    pub(crate) fn new() -> Self {
        Self {
            listing: Mutex::new(Ok(Vec::new())),
            listing_delay: Mutex::new(Duration::ZERO),
            scripts: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            issue_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_repositories(repositories: Vec<RepositoryRef>) -> Self {
        let source = Self::new();
        *source.listing.lock().unwrap() = Ok(repositories);
        source
    }

    pub(crate) fn with_listing_error(error: RemoteError) -> Self {
        let source = Self::new();
        *source.listing.lock().unwrap() = Err(error);
        source
    }

    pub(crate) fn delay_listing(&self, delay: Duration) {
        *self.listing_delay.lock().unwrap() = delay;
    }

    pub(crate) fn script(&self, id: u64, script: Script) {
        self.scripts.lock().unwrap().insert(id, script);
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn issue_calls(&self) -> usize {
        self.issue_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// How long the call for `id` took from start to completion.
    pub(crate) fn completed_after(&self, id: u64) -> Option<Duration> {
        self.completed.lock().unwrap().get(&id).copied()
    }
}

#[async_trait]
impl RepositorySource for FakeSource {
    async fn list_repositories(
        &self,
        _organization: &OrganizationName,
    ) -> Result<Vec<RepositoryRef>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.listing_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.listing.lock().unwrap().clone()
    }

    async fn open_issue_count(&self, repository: RepositoryId) -> Result<u64, RemoteError> {
        let started = Instant::now();
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let mut script = self
            .scripts
            .lock()
            .unwrap()
            .get(&repository.as_u64())
            .cloned()
            .unwrap_or(Script::Count(0));

        let result = loop {
            match script {
                Script::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    script = *inner;
                }
                Script::Count(count) => break Ok(count),
                Script::Fail(error) => break Err(error),
                Script::Panic => panic!("scripted panic for repository {repository}"),
            }
        };

        self.completed
            .lock()
            .unwrap()
            .insert(repository.as_u64(), started.elapsed());
        result
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

struct InjectedFailure {
    repository: RepositoryId,
    remaining: Option<u32>,
    error: SinkError,
}

pub(crate) struct FakeSink {
    max_batch: usize,
    stored: Mutex<BTreeMap<RepositoryId, RepositoryRecord>>,
    batches: Mutex<Vec<Vec<RepositoryId>>>,
    failures: Mutex<Vec<InjectedFailure>>,
    delay: Mutex<Duration>,
}

impl FakeSink {
    pub(crate) fn new(max_batch: usize) -> Self {
        Self {
            max_batch,
            stored: Mutex::new(BTreeMap::new()),
            batches: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Every batch write takes at least `delay` before it is applied.
    pub(crate) fn delay_batches(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Every batch containing `repository` fails with `error`, `times` times
    /// (or forever when `None`).
    pub(crate) fn fail_batches_containing(
        &self,
        repository: u64,
        times: Option<u32>,
        error: SinkError,
    ) {
        self.failures.lock().unwrap().push(InjectedFailure {
            repository: RepositoryId::new(repository),
            remaining: times,
            error,
        });
    }

    pub(crate) fn batch_calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub(crate) fn batches(&self) -> Vec<Vec<RepositoryId>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn stored(&self) -> BTreeMap<u64, u64> {
        self.stored
            .lock()
            .unwrap()
            .values()
            .map(|r| (r.id.as_u64(), r.open_issues))
            .collect()
    }
}

#[async_trait]
impl RecordSink for FakeSink {
    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn upsert_batch(&self, records: &[RepositoryRecord]) -> Result<(), SinkError> {
        self.batches
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.id).collect());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if records.len() > self.max_batch {
            return Err(SinkError::CapacityExceeded {
                len: records.len(),
                max: self.max_batch,
            });
        }

        {
            let mut failures = self.failures.lock().unwrap();
            for failure in failures.iter_mut() {
                if !records.iter().any(|r| r.id == failure.repository) {
                    continue;
                }
                match failure.remaining {
                    Some(0) => continue,
                    Some(ref mut n) => *n -= 1,
                    None => {}
                }
                return Err(failure.error.clone());
            }
        }

        let mut stored = self.stored.lock().unwrap();
        for record in records {
            stored.insert(record.id, record.clone());
        }
        Ok(())
    }
}
