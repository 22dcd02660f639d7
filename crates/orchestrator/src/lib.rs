//! Fan-out/fan-in orchestration for issue-tally.
//!
//! This crate owns the bounded [`dispatch`](dispatch::dispatch) of per-repository
//! fetches, the [`Driver`] that sequences a run from listing to persistence,
//! and the [`RunRegistry`] that executes runs in the background for the
//! trigger surface.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Sequences calls between the pure domain logic in
//! the [`pipeline`] crate and the `RepositorySource` / `RecordSink` ports.
//! Contains no I/O of its own and no domain rules beyond sequencing.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`dispatch`] | Semaphore-bounded fan-out with per-call timeouts and cancellation |
//! | [`driver`] | The run state machine, chunked persistence, and retry |
//! | [`runs`] | Background run registry: start, poll, cancel, retry failed subset |

pub mod dispatch;
pub mod driver;
pub mod runs;

#[cfg(test)]
mod test_support;

pub use dispatch::{dispatch, DispatchSettings};
pub use driver::{Driver, RunRequest, RunScope};
pub use runs::{RegistryError, RunRegistry, RunSnapshot, RunStatus, DEFAULT_RETAINED_RUNS};
