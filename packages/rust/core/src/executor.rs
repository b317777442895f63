//! Runs one job's four phases on a pooled unit.
//!
//! Every phase failure is contained here and turned into a `Failed` job
//! summary. Only pool-level errors leave [`JobExecutor::run`] as `Err`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use batchscout_shared::{
    BatchScoutError, JobError, JobId, JobInput, JobStatus, PhaseError, PhaseName, Result, Usage,
};

use crate::job::{Job, PhaseRecord};
use crate::pool::ResourcePool;
use crate::ports::{PhaseContext, PhaseExecutor, PhaseResult, UnitFactory};
use crate::progress::ProgressTracker;

// ---------------------------------------------------------------------------
// JobSummary
// ---------------------------------------------------------------------------

/// Final accounting of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub input: JobInput,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Usage::is_empty")]
    pub usage: Usage,
    pub phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id().clone(),
            input: job.input().clone(),
            status: job.status(),
            progress: job.progress_percent(),
            result: job.result().cloned(),
            error: job.error().cloned(),
            usage: job.usage().clone(),
            phases: job.phases().to_vec(),
            started_at: job.started_at(),
            ended_at: job.ended_at(),
        }
    }
}

/// Why the phase loop stopped early.
enum Halt {
    /// Cancellation observed at a phase boundary.
    Cancelled,
    /// A phase failed; already recorded on the job.
    Failed,
    /// The state machine refused a transition.
    Transition(BatchScoutError),
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

/// Drives jobs through the pipeline using units from a shared pool.
pub struct JobExecutor<F: UnitFactory> {
    pool: Arc<ResourcePool<F>>,
    tracker: Arc<ProgressTracker>,
    phase_timeout: Option<Duration>,
}

impl<F: UnitFactory> Clone for JobExecutor<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            tracker: self.tracker.clone(),
            phase_timeout: self.phase_timeout,
        }
    }
}

impl<F: UnitFactory> JobExecutor<F> {
    pub fn new(pool: Arc<ResourcePool<F>>, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            pool,
            tracker,
            phase_timeout: None,
        }
    }

    /// Bound every collaborator call; a call that exceeds it fails its phase.
    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<ResourcePool<F>> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Run `job` to a terminal state.
    ///
    /// Phase failures, timeouts and cancellation all produce `Ok`. `Err` is
    /// reserved for the pool failing to hand out a unit; the job is still
    /// recorded as failed in the tracker.
    #[instrument(skip_all, fields(job_id = %job.id(), name = %job.input().name))]
    pub async fn run(&self, mut job: Job, cancel: &CancellationToken) -> Result<JobSummary> {
        self.tracker.update(&job);

        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = self.pool.acquire() => Some(acquired),
        };

        let mut unit = match unit {
            None => {
                self.cancel(&mut job);
                return Ok(JobSummary::from(&job));
            }
            Some(Err(err)) => {
                error!(error = %err, "could not acquire a processing unit");
                job.fail_outside_phase(err.to_string());
                self.tracker.update(&job);
                return Err(err);
            }
            Some(Ok(unit)) => unit,
        };

        debug!(unit_id = unit.id(), "acquired processing unit");
        let outcome = self.drive(&mut job, &mut *unit, cancel).await;
        unit.release();

        match outcome {
            Ok(()) => info!(
                elapsed_ms = job.elapsed().map(|d| d.as_millis()).unwrap_or_default(),
                "job completed"
            ),
            Err(Halt::Cancelled) => self.cancel(&mut job),
            Err(Halt::Failed) => {}
            Err(Halt::Transition(err)) => {
                error!(error = %err, "phase transition refused");
                job.fail_outside_phase(err.to_string());
                self.tracker.update(&job);
            }
        }

        Ok(JobSummary::from(&job))
    }

    /// The four phases in order, each consuming the previous one's output.
    async fn drive(
        &self,
        job: &mut Job,
        unit: &mut F::Unit,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        let input = job.input().clone();

        let ctx = self.context(job, PhaseName::Discovery);
        let discovered = self
            .step(job, &ctx, cancel, unit.discover(&input, &ctx))
            .await?;

        let ctx = self.context(job, PhaseName::Selection);
        let selected = self
            .step(job, &ctx, cancel, unit.select(discovered, &ctx))
            .await?;

        let ctx = self.context(job, PhaseName::Extraction);
        let extracted = self
            .step(job, &ctx, cancel, unit.extract(selected, &ctx))
            .await?;

        let ctx = self.context(job, PhaseName::Aggregation);
        let aggregate = self
            .step(job, &ctx, cancel, unit.aggregate(extracted, &ctx))
            .await?;

        job.record_result(aggregate.payload, aggregate.usage);
        self.tracker.update(job);
        Ok(())
    }

    /// One phase: boundary cancellation check, `Running` published before the
    /// call starts, bounded wait, terminal state published after.
    async fn step<T>(
        &self,
        job: &mut Job,
        ctx: &PhaseContext,
        cancel: &CancellationToken,
        call: impl Future<Output = PhaseResult<T>>,
    ) -> std::result::Result<T, Halt> {
        let phase = ctx.phase();
        if cancel.is_cancelled() {
            debug!(%phase, "cancelled at phase boundary");
            return Err(Halt::Cancelled);
        }

        job.start(phase).map_err(Halt::Transition)?;
        self.tracker.update(job);
        debug!(%phase, "phase started");

        let outcome = match self.phase_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PhaseError::timeout(phase, limit)),
            },
            None => call.await,
        };

        let mut details = ctx.take_reported();
        match outcome {
            Ok(output) => {
                details.extend(output.details);
                job.complete(phase, details).map_err(Halt::Transition)?;
                self.tracker.update(job);
                debug!(%phase, progress = job.progress_percent(), "phase completed");
                Ok(output.value)
            }
            Err(err) => {
                warn!(%phase, error = %err, "phase failed");
                details.extend(err.details);
                job.fail(phase, err.message, details)
                    .map_err(Halt::Transition)?;
                self.tracker.update(job);
                Err(Halt::Failed)
            }
        }
    }

    fn context(&self, job: &Job, phase: PhaseName) -> PhaseContext {
        PhaseContext::new(job.id().clone(), phase, self.tracker.clone())
    }

    fn cancel(&self, job: &mut Job) {
        match job.cancel() {
            Ok(()) => {
                info!(completed_phases = job.completed_phases(), "job cancelled");
                self.tracker.update(job);
            }
            Err(err) => warn!(error = %err, "could not mark job cancelled"),
        }
    }
}
