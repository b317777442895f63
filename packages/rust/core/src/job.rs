//! Per-job phase state machine.
//!
//! A [`Job`] walks Discovery → Selection → Extraction → Aggregation. Each
//! phase moves `Running → Completed | Failed` exactly once and is immutable
//! afterwards. The job's status is derived from its phases after every
//! transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchscout_shared::{
    BatchScoutError, DetailValue, Details, JobError, JobId, JobInput, JobStatus, PhaseName,
    PhaseStatus, Result, Usage,
};

// ---------------------------------------------------------------------------
// PhaseRecord
// ---------------------------------------------------------------------------

/// One attempted phase of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: PhaseName,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Collaborator-supplied observability payload. Never read for control flow.
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRecord {
    fn running(name: PhaseName) -> Self {
        Self {
            name,
            status: PhaseStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            details: Details::new(),
            error: None,
        }
    }

    fn finish(&mut self, status: PhaseStatus, details: Details) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.details.extend(details);
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single research job and its phase history.
///
/// Owned and mutated by exactly one executor; everyone else sees clones
/// published through the progress tracker.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    job_id: JobId,
    input: JobInput,
    status: JobStatus,
    phases: Vec<PhaseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Usage::is_empty")]
    usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    #[serde(skip)]
    cancelled: bool,
    revision: u64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A new pending job with a fresh id.
    pub fn new(input: JobInput) -> Self {
        Self::with_id(JobId::new(), input)
    }

    pub fn with_id(job_id: JobId, input: JobInput) -> Self {
        Self {
            job_id,
            input,
            status: JobStatus::Pending,
            phases: Vec::with_capacity(PhaseName::ALL.len()),
            result: None,
            usage: Usage::new(),
            error: None,
            cancelled: false,
            revision: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    pub fn input(&self) -> &JobInput {
        &self.input
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Phases attempted so far, in pipeline order.
    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    pub fn phase(&self, name: PhaseName) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// The phase currently running, if any.
    pub fn current_phase(&self) -> Option<PhaseName> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Running)
            .map(|p| p.name)
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    /// Bumped on every transition; lets observers discard stale snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Wall time between the first phase starting and the job ending (or now).
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        (ended - started).to_std().ok()
    }

    pub fn completed_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }

    /// 0, 25, 50, 75 or 100, from the number of completed phases.
    pub fn progress_percent(&self) -> u8 {
        (self.completed_phases() * 100 / PhaseName::ALL.len()) as u8
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Mark `phase` running. It must be the next phase in pipeline order and
    /// no other phase may be running.
    pub fn start(&mut self, phase: PhaseName) -> Result<()> {
        self.ensure_open()?;

        if let Some(running) = self.current_phase() {
            return Err(BatchScoutError::invalid_transition(
                &self.job_id,
                format!("cannot start {phase} while {running} is running"),
            ));
        }

        let expected = PhaseName::ALL.get(self.phases.len()).copied().ok_or_else(|| {
            BatchScoutError::invalid_transition(&self.job_id, "every phase has already run")
        })?;
        if phase != expected {
            return Err(BatchScoutError::invalid_transition(
                &self.job_id,
                format!("expected {expected} next, got {phase}"),
            ));
        }

        let record = PhaseRecord::running(phase);
        self.started_at.get_or_insert(record.started_at.unwrap_or_else(Utc::now));
        self.phases.push(record);
        self.touch();
        Ok(())
    }

    /// Move the running `phase` to `Completed`.
    pub fn complete(&mut self, phase: PhaseName, details: Details) -> Result<()> {
        let record = self.running_record(phase)?;
        record.finish(PhaseStatus::Completed, details);
        self.touch();
        Ok(())
    }

    /// Move the running `phase` to `Failed`. The job fails with it.
    pub fn fail(&mut self, phase: PhaseName, message: impl Into<String>, details: Details) -> Result<()> {
        let message = message.into();
        let record = self.running_record(phase)?;
        record.finish(PhaseStatus::Failed, details);
        record.error = Some(message.clone());
        self.error = Some(JobError {
            phase: Some(phase),
            message,
        });
        self.touch();
        Ok(())
    }

    /// Fail the job for a reason outside the collaborator's phase logic
    /// (unit creation failure, panic, broken transition). A running phase is
    /// failed with it. No-op on a terminal job.
    pub fn fail_outside_phase(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let message = message.into();
        if let Some(running) = self.current_phase() {
            // Just checked that `running` is the running phase.
            let _ = self.fail(running, message, Details::new());
            return;
        }
        self.error = Some(JobError {
            phase: None,
            message,
        });
        self.touch();
    }

    /// Stop the job at a phase boundary.
    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(running) = self.current_phase() {
            return Err(BatchScoutError::invalid_transition(
                &self.job_id,
                format!("cannot cancel while {running} is running"),
            ));
        }
        self.cancelled = true;
        self.touch();
        Ok(())
    }

    /// Attach the aggregated payload and usage counters.
    pub fn record_result(&mut self, payload: serde_json::Value, usage: Usage) {
        self.result = Some(payload);
        self.usage = usage;
        self.touch();
    }

    /// Merge one incremental detail into the running `phase`. Returns `false`
    /// if that phase is not running. Does not count as a transition.
    pub(crate) fn apply_detail(&mut self, phase: PhaseName, key: String, value: DetailValue) -> bool {
        match self
            .phases
            .iter_mut()
            .find(|p| p.name == phase && p.status == PhaseStatus::Running)
        {
            Some(record) => {
                record.details.insert(key, value);
                true
            }
            None => false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BatchScoutError::invalid_transition(
                &self.job_id,
                format!("job is already {}", self.status),
            ));
        }
        Ok(())
    }

    fn running_record(&mut self, phase: PhaseName) -> Result<&mut PhaseRecord> {
        let job_id = &self.job_id;
        self.phases
            .iter_mut()
            .find(|p| p.name == phase && p.status == PhaseStatus::Running)
            .ok_or_else(|| {
                BatchScoutError::invalid_transition(job_id, format!("{phase} is not running"))
            })
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.status = self.derive_status();
        if self.status.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    fn derive_status(&self) -> JobStatus {
        if self.error.is_some() || self.phases.iter().any(|p| p.status == PhaseStatus::Failed) {
            JobStatus::Failed
        } else if self.cancelled {
            JobStatus::Cancelled
        } else if self.completed_phases() == PhaseName::ALL.len() {
            JobStatus::Completed
        } else if self.phases.is_empty() {
            JobStatus::Pending
        } else {
            JobStatus::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobInput::new("acme", "https://acme.test"))
    }

    fn details(key: &str, value: i64) -> Details {
        let mut d = Details::new();
        d.insert(key.into(), value.into());
        d
    }

    #[test]
    fn new_job_is_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress_percent(), 0);
        assert!(job.phases().is_empty());
        assert!(job.started_at().is_none());
    }

    #[test]
    fn full_pipeline_completes() {
        let mut job = job();
        let mut percents = vec![job.progress_percent()];

        for phase in PhaseName::ALL {
            job.start(phase).unwrap();
            assert_eq!(job.status(), JobStatus::Running);
            assert_eq!(job.current_phase(), Some(phase));
            job.complete(phase, details("step", phase.index() as i64)).unwrap();
            percents.push(job.progress_percent());
        }

        assert_eq!(percents, vec![0, 25, 50, 75, 100]);
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.ended_at().is_some());
        assert!(job.elapsed().is_some());
        assert_eq!(
            job.phase(PhaseName::Extraction).unwrap().details.get("step"),
            Some(&DetailValue::Integer(2))
        );
    }

    #[test]
    fn phases_must_run_in_order() {
        let mut job = job();
        let err = job.start(PhaseName::Selection).unwrap_err();
        assert!(err.to_string().contains("expected Discovery next"));
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[test]
    fn cannot_start_while_another_phase_runs() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        let err = job.start(PhaseName::Selection).unwrap_err();
        assert!(matches!(err, BatchScoutError::InvalidTransition { .. }));
        assert!(err.to_string().contains("Discovery is running"));
    }

    #[test]
    fn terminal_phase_is_immutable() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        job.complete(PhaseName::Discovery, Details::new()).unwrap();

        assert!(job.complete(PhaseName::Discovery, Details::new()).is_err());
        assert!(job.fail(PhaseName::Discovery, "late", Details::new()).is_err());
        assert_eq!(
            job.phase(PhaseName::Discovery).unwrap().status,
            PhaseStatus::Completed
        );
    }

    #[test]
    fn failed_phase_fails_the_job() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        job.complete(PhaseName::Discovery, Details::new()).unwrap();
        job.start(PhaseName::Selection).unwrap();
        job.fail(PhaseName::Selection, "no links", details("candidates", 0))
            .unwrap();

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.progress_percent(), 25);
        let err = job.error().unwrap();
        assert_eq!(err.phase, Some(PhaseName::Selection));
        assert_eq!(err.message, "no links");
        assert_eq!(
            job.phase(PhaseName::Selection).unwrap().error.as_deref(),
            Some("no links")
        );

        // A failed job accepts no further phases.
        assert!(job.start(PhaseName::Extraction).is_err());
    }

    #[test]
    fn revision_increases_on_every_transition() {
        let mut job = job();
        let r0 = job.revision();
        job.start(PhaseName::Discovery).unwrap();
        let r1 = job.revision();
        job.complete(PhaseName::Discovery, Details::new()).unwrap();
        assert!(r0 < r1 && r1 < job.revision());
    }

    #[test]
    fn recording_result_is_a_revision() {
        let mut job = job();
        for phase in PhaseName::ALL {
            job.start(phase).unwrap();
            job.complete(phase, Details::new()).unwrap();
        }
        let before = job.revision();
        let ended = job.ended_at();

        let mut usage = Usage::new();
        usage.add("pages_fetched", 3);
        job.record_result(serde_json::json!({ "name": "acme" }), usage);

        assert!(job.revision() > before);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.ended_at(), ended);
        assert_eq!(job.usage().0.get("pages_fetched"), Some(&3));
        assert!(job.result().is_some());
    }

    #[test]
    fn cancel_at_boundary_keeps_completed_phases() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        assert!(job.cancel().is_err());

        job.complete(PhaseName::Discovery, Details::new()).unwrap();
        job.cancel().unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.progress_percent(), 25);
        assert!(job.start(PhaseName::Selection).is_err());
        assert!(job.cancel().is_err());
    }

    #[test]
    fn failure_outside_phase() {
        let mut idle = job();
        idle.fail_outside_phase("pool exhausted");
        assert_eq!(idle.status(), JobStatus::Failed);
        assert_eq!(idle.error().unwrap().phase, None);

        let mut running = job();
        running.start(PhaseName::Discovery).unwrap();
        running.fail_outside_phase("collaborator panicked");
        assert_eq!(running.status(), JobStatus::Failed);
        assert_eq!(running.error().unwrap().phase, Some(PhaseName::Discovery));
        assert_eq!(running.current_phase(), None);

        let before = running.revision();
        running.fail_outside_phase("again");
        assert_eq!(running.revision(), before);
    }

    #[test]
    fn apply_detail_only_touches_running_phase() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        let revision = job.revision();
        assert!(job.apply_detail(PhaseName::Discovery, "url".into(), "https://acme.test".into()));
        assert!(!job.apply_detail(PhaseName::Selection, "x".into(), 1i64.into()));
        assert_eq!(job.revision(), revision);
    }

    #[test]
    fn snapshot_serializes_status_and_phases() {
        let mut job = job();
        job.start(PhaseName::Discovery).unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["phases"][0]["name"], "discovery");
        assert_eq!(json["input"]["name"], "acme");
    }
}
