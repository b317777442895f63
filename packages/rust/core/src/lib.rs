//! Bounded-concurrency batch orchestration for multi-phase research jobs.
//!
//! A [`BatchProcessor`] admits jobs onto a fixed number of slots, each job is
//! driven through Discovery → Selection → Extraction → Aggregation by a
//! [`JobExecutor`] using a unit borrowed from the [`ResourcePool`], and every
//! transition is published to the [`ProgressTracker`].

pub mod batch;
pub mod executor;
pub mod job;
pub mod pool;
pub mod ports;
pub mod progress;

#[cfg(test)]
pub(crate) mod testkit;

pub use batch::{BatchProcessor, BatchResult};
pub use executor::{JobExecutor, JobSummary};
pub use job::{Job, PhaseRecord};
pub use pool::{PoolStats, PooledUnit, ResourcePool};
pub use ports::{Aggregate, PhaseContext, PhaseExecutor, PhaseOutput, PhaseResult, UnitFactory};
pub use progress::{ProgressCounters, ProgressTracker};

pub use tokio_util::sync::CancellationToken;
