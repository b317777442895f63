//! Batch orchestration: admission control, fan-out and result collection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use batchscout_shared::{BatchScoutError, JobId, JobInput, JobStatus, Result, Usage};

use crate::executor::{JobExecutor, JobSummary};
use crate::job::Job;
use crate::pool::ResourcePool;
use crate::ports::UnitFactory;
use crate::progress::ProgressTracker;

/// Complete accounting of a batch. Every input lands in exactly one bucket,
/// each bucket in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: Vec<JobSummary>,
    pub failed: Vec<JobSummary>,
    /// Jobs stopped by cancellation, before admission or at a phase boundary.
    pub cancelled: Vec<JobSummary>,
    /// Collaborator usage counters summed over every job.
    pub usage: Usage,
    /// Set when a pool-level failure aborted the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub elapsed_ms: u64,
}

impl BatchResult {
    /// Number of jobs accounted for across all buckets.
    pub fn accounted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }
}

/// Admits jobs onto at most `max_concurrent` slots and collects their outcomes.
///
/// Job records of a finished batch stay in the tracker until the next batch on
/// the same processor starts.
pub struct BatchProcessor<F: UnitFactory> {
    executor: JobExecutor<F>,
    /// Jobs of batches that have returned, retired when the next one starts.
    finished: Mutex<Vec<JobId>>,
}

impl<F: UnitFactory> BatchProcessor<F> {
    pub fn new(pool: Arc<ResourcePool<F>>, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            executor: JobExecutor::new(pool, tracker),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Bound each collaborator call of every job.
    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.executor = self.executor.with_phase_timeout(timeout);
        self
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        self.executor.tracker()
    }

    pub fn pool(&self) -> &Arc<ResourcePool<F>> {
        self.executor.pool()
    }

    /// Run every input to a terminal state with at most `max_concurrent`
    /// jobs in flight.
    pub async fn process_batch(
        &self,
        inputs: Vec<JobInput>,
        max_concurrent: usize,
    ) -> Result<BatchResult> {
        self.process_batch_cancellable(inputs, max_concurrent, CancellationToken::new())
            .await
    }

    /// Like [`process_batch`](Self::process_batch), stopping early when
    /// `cancel` fires: no further admissions, and in-flight jobs stop at their
    /// next phase boundary.
    #[instrument(skip_all, fields(jobs = inputs.len(), max_concurrent))]
    pub async fn process_batch_cancellable(
        &self,
        inputs: Vec<JobInput>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Result<BatchResult> {
        if max_concurrent == 0 {
            return Err(BatchScoutError::admission("max_concurrent must be at least 1"));
        }

        self.retire_finished();

        let start = Instant::now();
        let total = inputs.len();
        let jobs: Vec<Job> = inputs.into_iter().map(Job::new).collect();
        let identities: Vec<(JobId, JobInput)> = jobs
            .iter()
            .map(|job| (job.id().clone(), job.input().clone()))
            .collect();

        // Every job is queryable before the first one is admitted.
        for job in &jobs {
            self.tracker().update(job);
        }

        info!(total, max_concurrent, pool_size = self.pool().max_size(), "starting batch");

        // Child token: a pool failure aborts this batch without touching the
        // caller's token.
        let batch_cancel = cancel.child_token();
        let abort_reason: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        let admission = Arc::new(Semaphore::new(max_concurrent));

        let mut outcomes: Vec<Option<JobSummary>> = vec![None; total];
        let mut tasks = JoinSet::new();
        let mut task_jobs = HashMap::new();

        for (index, mut job) in jobs.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = batch_cancel.cancelled() => None,
                permit = admission.clone().acquire_owned() => Some(
                    permit.map_err(|_| BatchScoutError::admission("admission semaphore closed"))?,
                ),
            };

            let Some(permit) = permit else {
                // Never admitted.
                if job.cancel().is_ok() {
                    self.tracker().update(&job);
                }
                outcomes[index] = Some(JobSummary::from(&job));
                continue;
            };

            let executor = self.executor.clone();
            let token = batch_cancel.clone();
            let abort = abort_reason.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let outcome = executor.run(job, &token).await;
                if let Err(err) = &outcome {
                    if err.is_batch_level() {
                        let _ = abort.set(err.to_string());
                        token.cancel();
                    }
                }
                outcome
            });
            task_jobs.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    let Some(&index) = task_jobs.get(&task_id) else {
                        continue;
                    };
                    outcomes[index] = Some(match outcome {
                        Ok(summary) => summary,
                        Err(err) => self.record_fault(&identities[index], &err.to_string()),
                    });
                }
                Err(join_err) => {
                    let Some(&index) = task_jobs.get(&join_err.id()) else {
                        continue;
                    };
                    let message = if join_err.is_panic() {
                        "collaborator panicked"
                    } else {
                        "job task was aborted"
                    };
                    warn!(job_id = %identities[index].0, message, "job task ended abnormally");
                    outcomes[index] = Some(self.record_fault(&identities[index], message));
                }
            }
        }

        let mut result = BatchResult {
            total,
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
            usage: Usage::new(),
            aborted: abort_reason.get().cloned(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        for (index, outcome) in outcomes.into_iter().enumerate() {
            let summary = match outcome {
                Some(summary) => summary,
                None => self.record_fault(&identities[index], "job produced no outcome"),
            };
            result.usage.merge(&summary.usage);
            match summary.status {
                JobStatus::Completed => result.succeeded.push(summary),
                JobStatus::Cancelled => result.cancelled.push(summary),
                JobStatus::Failed => result.failed.push(summary),
                JobStatus::Pending | JobStatus::Running => {
                    let summary = self.record_fault(&identities[index], "job ended without a terminal state");
                    result.failed.push(summary);
                }
            }
        }

        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(identities.into_iter().map(|(job_id, _)| job_id));

        if let Some(reason) = &result.aborted {
            error!(reason = %reason, "batch aborted");
        }
        info!(
            total = result.total,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            cancelled = result.cancelled.len(),
            elapsed_ms = result.elapsed_ms,
            "batch complete"
        );

        Ok(result)
    }

    /// Drop the records of previous batches from the tracker.
    fn retire_finished(&self) {
        let previous = std::mem::take(&mut *self.finished.lock().unwrap_or_else(|e| e.into_inner()));
        if !previous.is_empty() {
            self.tracker().retire(&previous);
        }
    }

    /// Mark a job failed for a reason outside its phases and summarise it.
    fn record_fault(&self, (job_id, input): &(JobId, JobInput), message: &str) -> JobSummary {
        let mut job = match self.tracker().get(job_id) {
            Ok(snapshot) => (*snapshot).clone(),
            Err(_) => Job::with_id(job_id.clone(), input.clone()),
        };
        if !job.status().is_terminal() {
            job.fail_outside_phase(message);
            self.tracker().update(&job);
        }
        JobSummary::from(&job)
    }
}
