//! Concurrency-safe store of the latest snapshot of every job.
//!
//! Snapshots are immutable `Arc<Job>`s: writers swap the `Arc` under a short
//! write lock and readers clone it, so a reader never sees a half-applied
//! transition. Snapshots older than the stored one (lower revision) are
//! dropped, which keeps each job's progress monotonic regardless of how
//! writers interleave.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use batchscout_shared::{BatchScoutError, DetailValue, JobId, JobStatus, PhaseName, Result};

use crate::job::Job;

/// Buffered snapshots per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Number of tracked jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounters {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ProgressCounters {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    fn slot(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }
}

struct Entry {
    snapshot: Arc<Job>,
    /// Tracker-wide sequence number of the last transition of this job.
    last_transition: u64,
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<JobId, Entry>,
    sequence: u64,
    counters: ProgressCounters,
}

/// Latest snapshot per job plus aggregate counters.
pub struct ProgressTracker {
    state: RwLock<TrackerState>,
    events: broadcast::Sender<Arc<Job>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(TrackerState::default()),
            events,
        }
    }

    /// Upsert a job snapshot. Returns `false` if the stored snapshot is
    /// already at the same or a newer revision.
    pub fn update(&self, job: &Job) -> bool {
        let snapshot = Arc::new(job.clone());
        {
            let mut state = self.write();
            state.sequence += 1;
            let sequence = state.sequence;

            let previous = match state.jobs.get(job.id()) {
                Some(entry) if entry.snapshot.revision() >= job.revision() => {
                    trace!(job_id = %job.id(), revision = job.revision(), "stale snapshot ignored");
                    return false;
                }
                Some(entry) => Some(entry.snapshot.status()),
                None => None,
            };

            if let Some(status) = previous {
                let slot = state.counters.slot(status);
                *slot = slot.saturating_sub(1);
            }
            *state.counters.slot(job.status()) += 1;

            state.jobs.insert(
                job.id().clone(),
                Entry {
                    snapshot: snapshot.clone(),
                    last_transition: sequence,
                },
            );
        }

        // No subscribers is fine; the store stays authoritative.
        let _ = self.events.send(snapshot);
        true
    }

    /// Merge an incremental collaborator detail into the stored snapshot's
    /// running phase. Returns `false` if the job is unknown or that phase is
    /// not running.
    pub fn record_detail(
        &self,
        job_id: &JobId,
        phase: PhaseName,
        key: impl Into<String>,
        value: impl Into<DetailValue>,
    ) -> bool {
        let snapshot = {
            let mut state = self.write();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return false;
            };
            // Readers holding the old Arc keep their copy untouched.
            if !Arc::make_mut(&mut entry.snapshot).apply_detail(phase, key.into(), value.into()) {
                return false;
            }
            entry.snapshot.clone()
        };
        let _ = self.events.send(snapshot);
        true
    }

    /// Latest snapshot of one job.
    pub fn get(&self, job_id: &JobId) -> Result<Arc<Job>> {
        self.read()
            .jobs
            .get(job_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| BatchScoutError::NotFound(job_id.clone()))
    }

    /// The running job that transitioned most recently.
    ///
    /// Best-effort convenience for single-focus displays: with several jobs
    /// running, which one is returned changes with every transition. Anything
    /// that needs a specific job must use [`ProgressTracker::get`].
    pub fn currently_running(&self) -> Option<Arc<Job>> {
        self.read()
            .jobs
            .values()
            .filter(|entry| entry.snapshot.status() == JobStatus::Running)
            .max_by_key(|entry| entry.last_transition)
            .map(|entry| entry.snapshot.clone())
    }

    /// Every running job, oldest job first.
    pub fn running(&self) -> Vec<Arc<Job>> {
        let mut running: Vec<_> = self
            .read()
            .jobs
            .values()
            .filter(|entry| entry.snapshot.status() == JobStatus::Running)
            .map(|entry| entry.snapshot.clone())
            .collect();
        running.sort_by(|a, b| a.id().cmp(b.id()));
        running
    }

    /// Every tracked job, oldest job first.
    pub fn snapshot_all(&self) -> Vec<Arc<Job>> {
        let mut all: Vec<_> = self
            .read()
            .jobs
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Forget finished jobs. Returns how many records were removed; jobs that
    /// are still pending or running are kept.
    pub fn retire(&self, job_ids: &[JobId]) -> usize {
        let mut state = self.write();
        let mut removed = 0;
        for job_id in job_ids {
            let finished = state
                .jobs
                .get(job_id)
                .is_some_and(|entry| entry.snapshot.status().is_terminal());
            if !finished {
                continue;
            }
            if let Some(entry) = state.jobs.remove(job_id) {
                let slot = state.counters.slot(entry.snapshot.status());
                *slot = slot.saturating_sub(1);
                removed += 1;
            }
        }
        debug!(removed, remaining = state.jobs.len(), "retired finished jobs");
        removed
    }

    pub fn counters(&self) -> ProgressCounters {
        self.read().counters
    }

    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream of every published snapshot. A receiver that falls more than
    /// the channel capacity behind skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Job>> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
