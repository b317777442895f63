//! Ports to the external research collaborator.
//!
//! The engine never looks inside a phase. It hands each phase's output to the
//! next phase and records what the collaborator reports through the
//! [`PhaseContext`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use batchscout_shared::{DetailValue, Details, JobId, JobInput, PhaseError, PhaseName, Result, Usage};

use crate::progress::ProgressTracker;

/// Value produced by a successful phase plus its observability payload.
#[derive(Debug, Clone)]
pub struct PhaseOutput<T> {
    pub value: T,
    pub details: Details,
}

impl<T> PhaseOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            details: Details::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a phase call.
pub type PhaseResult<T> = std::result::Result<PhaseOutput<T>, PhaseError>;

/// Final payload of a job, returned by the aggregation phase.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    /// Opaque result stored on the job.
    pub payload: serde_json::Value,
    /// Resource/cost counters summed into the batch result.
    pub usage: Usage,
}

/// The four pipeline operations, implemented by a pooled processing unit.
///
/// Each phase consumes the previous phase's output by value.
#[async_trait]
pub trait PhaseExecutor: Send + 'static {
    type Discovery: Send;
    type Selection: Send;
    type Extraction: Send;

    async fn discover(
        &mut self,
        input: &JobInput,
        ctx: &PhaseContext,
    ) -> PhaseResult<Self::Discovery>;

    async fn select(
        &mut self,
        discovered: Self::Discovery,
        ctx: &PhaseContext,
    ) -> PhaseResult<Self::Selection>;

    async fn extract(
        &mut self,
        selected: Self::Selection,
        ctx: &PhaseContext,
    ) -> PhaseResult<Self::Extraction>;

    async fn aggregate(
        &mut self,
        extracted: Self::Extraction,
        ctx: &PhaseContext,
    ) -> PhaseResult<Aggregate>;
}

/// Creates and destroys the expensive units held by the [`ResourcePool`].
///
/// [`ResourcePool`]: crate::pool::ResourcePool
#[async_trait]
pub trait UnitFactory: Send + Sync + 'static {
    type Unit: PhaseExecutor;

    /// Build a new unit. Any error surfaces from `acquire` as `ResourceCreation`.
    async fn create(&self) -> Result<Self::Unit>;

    /// Tear a unit down when the pool closes.
    async fn destroy(&self, unit: Self::Unit) {
        drop(unit);
    }
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

/// Handle given to a collaborator for the duration of one phase call.
pub struct PhaseContext {
    job_id: JobId,
    phase: PhaseName,
    tracker: Arc<ProgressTracker>,
    reported: Mutex<Details>,
}

impl PhaseContext {
    pub(crate) fn new(job_id: JobId, phase: PhaseName, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            job_id,
            phase,
            tracker,
            reported: Mutex::new(Details::new()),
        }
    }

    /// A context bound to a private tracker, for driving a collaborator
    /// outside a batch.
    pub fn standalone(phase: PhaseName) -> Self {
        Self::new(JobId::new(), phase, Arc::new(ProgressTracker::new()))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn phase(&self) -> PhaseName {
        self.phase
    }

    /// Publish an incremental detail. Observers see it immediately; it is also
    /// kept on the phase's terminal record.
    pub fn report(&self, key: impl Into<String>, value: impl Into<DetailValue>) {
        let key = key.into();
        let value = value.into();
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), value.clone());
        self.tracker
            .record_detail(&self.job_id, self.phase, key, value);
    }

    /// Details reported so far.
    pub fn reported(&self) -> Details {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn take_reported(&self) -> Details {
        std::mem::take(&mut *self.reported.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn report_reaches_tracker_while_running() {
        let tracker = Arc::new(ProgressTracker::new());
        let mut job = Job::new(JobInput::new("acme", "https://acme.test"));
        job.start(PhaseName::Discovery).unwrap();
        tracker.update(&job);

        let ctx = PhaseContext::new(job.id().clone(), PhaseName::Discovery, tracker.clone());
        ctx.report("current_url", "https://acme.test/about");
        ctx.report("links_found", 3usize);

        let snapshot = tracker.get(job.id()).unwrap();
        let phase = snapshot.phase(PhaseName::Discovery).unwrap();
        assert_eq!(
            phase.details.get("current_url"),
            Some(&DetailValue::Text("https://acme.test/about".into()))
        );
        assert_eq!(ctx.reported().len(), 2);

        let taken = ctx.take_reported();
        assert_eq!(taken.len(), 2);
        assert!(ctx.reported().is_empty());
    }

    #[test]
    fn standalone_context_accepts_reports() {
        let ctx = PhaseContext::standalone(PhaseName::Selection);
        ctx.report("selected", 4usize);
        assert_eq!(ctx.phase(), PhaseName::Selection);
        assert_eq!(ctx.reported().get("selected"), Some(&DetailValue::Integer(4)));
    }

    #[test]
    fn phase_output_builder() {
        let out = PhaseOutput::new(vec![1, 2]).with_detail("count", 2usize);
        assert_eq!(out.value.len(), 2);
        assert_eq!(out.details.get("count"), Some(&DetailValue::Integer(2)));
    }
}
