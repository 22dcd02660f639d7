//! issue-tally record store.
//!
//! Implements [`pipeline::RecordSink`] on top of an embedded [`redb`] database.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Owns the on-disk layout and nothing else; batching,
//! retry, and outcome rules live in the orchestrator.
//!
//! ## Table design
//!
//! A single `REPOSITORIES` table:
//!
//! ```text
//! key:   repository id (u64)
//! value: JSON-encoded RepositoryRecord
//! ```
//!
//! Keying by repository id makes every write an upsert: writing a record whose
//! id is already present replaces it, so re-running an organization never
//! creates duplicate rows.
//!
//! Each [`RecordSink::upsert_batch`] call is one write transaction. A batch is
//! either fully committed or not at all.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::{RecordSink, RepositoryId, RepositoryRecord, SinkError};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

/// Batch size accepted by [`RedbRecordStore`] unless overridden.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

const REPOSITORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("repositories");

/// Errors raised by the store's own API (opening, reading).
///
/// Writes through [`RecordSink`] report [`SinkError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Any failure reported by redb.
    #[error("Record store error: {0}")]
    Database(#[from] redb::Error),

    /// A stored value could not be decoded.
    #[error("Stored record is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),

    /// The blocking task running the transaction panicked or was cancelled.
    #[error("Record store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable [`RecordSink`] backed by redb.
///
/// Cheap to clone; clones share the same database handle.
#[derive(Clone)]
pub struct RedbRecordStore {
    db: Arc<Database>,
    max_batch_size: usize,
}

impl std::fmt::Debug for RedbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecordStore")
            .field("max_batch_size", &self.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl RedbRecordStore {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        Self::from_database(db)
    }

    /// Creates a store that lives only as long as the process.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        Self::from_database(db)
    }

    fn from_database(db: Database) -> Result<Self, StoreError> {
        // Create the table up front so reads never see a missing table.
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(REPOSITORIES).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;

        Ok(Self {
            db: Arc::new(db),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        })
    }

    /// Overrides the advertised maximum batch size. Zero is clamped to one.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Reads the stored record for `id`, if any.
    pub async fn get(&self, id: RepositoryId) -> Result<Option<RepositoryRecord>, StoreError> {
        let db = Arc::clone(&self.db);
        let raw = tokio::task::spawn_blocking(move || read_one(&db, id.as_u64())).await??;
        Ok(match raw {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        })
    }

    /// Reads every stored record in ascending id order.
    pub async fn list_all(&self) -> Result<Vec<RepositoryRecord>, StoreError> {
        let db = Arc::clone(&self.db);
        let rows = tokio::task::spawn_blocking(move || read_all(&db)).await??;
        rows.iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl RecordSink for RedbRecordStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn upsert_batch(&self, records: &[RepositoryRecord]) -> Result<(), SinkError> {
        if records.len() > self.max_batch_size {
            return Err(SinkError::CapacityExceeded {
                len: records.len(),
                max: self.max_batch_size,
            });
        }
        if records.is_empty() {
            return Ok(());
        }

        let rows = records
            .iter()
            .map(|record| {
                serde_json::to_vec(record)
                    .map(|bytes| (record.id.as_u64(), bytes))
                    .map_err(|e| SinkError::transient(format!("Failed to encode record: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let db = Arc::clone(&self.db);
        let written = rows.len();
        tokio::task::spawn_blocking(move || write_all(&db, &rows))
            .await
            .map_err(|e| SinkError::transient(format!("Record store task failed: {e}")))?
            .map_err(|e| SinkError::transient(e.to_string()))?;

        debug!(records = written, "Committed record batch");
        Ok(())
    }
}

fn write_all(db: &Database, rows: &[(u64, Vec<u8>)]) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(REPOSITORIES)?;
        for (id, bytes) in rows {
            table.insert(*id, bytes.as_slice())?;
        }
    }
    txn.commit()?;
    Ok(())
}

fn read_one(db: &Database, id: u64) -> Result<Option<Vec<u8>>, redb::Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(REPOSITORIES)?;
    Ok(table.get(id)?.map(|guard| guard.value().to_vec()))
}

fn read_all(db: &Database) -> Result<Vec<Vec<u8>>, redb::Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(REPOSITORIES)?;
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        rows.push(value.value().to_vec());
    }
    Ok(rows)
}
