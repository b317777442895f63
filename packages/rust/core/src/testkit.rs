//! Instrumented in-memory collaborator used by the engine's tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use batchscout_shared::{BatchScoutError, JobInput, PhaseError, PhaseName, Result, Usage};

use crate::ports::{Aggregate, PhaseContext, PhaseExecutor, PhaseOutput, PhaseResult, UnitFactory};

/// Counts units and records the peak number of concurrent holders.
#[derive(Default)]
pub(crate) struct Probe {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Probe {
    pub fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Leaves the probe even if the phase future is dropped mid-call.
struct Active<'a>(&'a Probe);

impl<'a> Active<'a> {
    fn enter(probe: &'a Probe) -> Self {
        probe.enter();
        Self(probe)
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Parks a phase until the test lets it go.
#[derive(Clone)]
pub(crate) struct Hold {
    pub phase: PhaseName,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Clone, Default)]
struct Script {
    latency: Duration,
    failures: Vec<(String, PhaseName)>,
    panics: Vec<(String, PhaseName)>,
    stall: Option<(PhaseName, Duration)>,
    hold: Option<Hold>,
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub probe: Arc<Probe>,
    script: Arc<Script>,
    failing_creations: AtomicUsize,
}

impl FakeFactory {
    /// Every phase sleeps this long.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.script).latency = latency;
        self
    }

    /// Input `name` fails in `phase`.
    pub fn failing_at(mut self, name: &str, phase: PhaseName) -> Self {
        Arc::make_mut(&mut self.script)
            .failures
            .push((name.to_string(), phase));
        self
    }

    /// Input `name` panics in `phase`.
    pub fn panicking_at(mut self, name: &str, phase: PhaseName) -> Self {
        Arc::make_mut(&mut self.script)
            .panics
            .push((name.to_string(), phase));
        self
    }

    /// `phase` sleeps for `duration` instead of the normal latency.
    pub fn stalling_at(mut self, phase: PhaseName, duration: Duration) -> Self {
        Arc::make_mut(&mut self.script).stall = Some((phase, duration));
        self
    }

    /// Every job reaching `phase` signals `entered` and waits for `release`.
    pub fn holding_at(mut self, phase: PhaseName) -> (Self, Hold) {
        let hold = Hold {
            phase,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        Arc::make_mut(&mut self.script).hold = Some(hold.clone());
        (self, hold)
    }

    /// The next `n` calls to `create` fail.
    pub fn failing_creations(self, n: usize) -> Self {
        self.failing_creations.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl UnitFactory for FakeFactory {
    type Unit = FakeUnit;

    async fn create(&self) -> Result<FakeUnit> {
        let should_fail = self
            .failing_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BatchScoutError::Network("browser failed to launch".into()));
        }
        let id = self.probe.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeUnit {
            id,
            probe: self.probe.clone(),
            script: self.script.clone(),
        })
    }

    async fn destroy(&self, unit: FakeUnit) {
        self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
        drop(unit);
    }
}

pub(crate) struct FakeUnit {
    id: usize,
    probe: Arc<Probe>,
    script: Arc<Script>,
}

impl FakeUnit {
    async fn act(&self, name: &str, phase: PhaseName, ctx: &PhaseContext) -> std::result::Result<(), PhaseError> {
        let _active = Active::enter(&self.probe);
        ctx.report("unit", self.id);

        if let Some(hold) = self.script.hold.as_ref().filter(|h| h.phase == phase) {
            hold.entered.notify_one();
            hold.release.notified().await;
        }

        let wait = match self.script.stall {
            Some((stalled, duration)) if stalled == phase => duration,
            _ => self.script.latency,
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let scripted = |list: &[(String, PhaseName)]| list.iter().any(|(n, p)| n == name && *p == phase);
        if scripted(&self.script.panics) {
            panic!("scripted panic for {name} in {phase}");
        }
        if scripted(&self.script.failures) {
            return Err(PhaseError::new(format!("forced failure in {phase}")).with_detail("input", name));
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseExecutor for FakeUnit {
    type Discovery = String;
    type Selection = (String, Vec<String>);
    type Extraction = (String, usize);

    async fn discover(&mut self, input: &JobInput, ctx: &PhaseContext) -> PhaseResult<String> {
        self.act(&input.name, PhaseName::Discovery, ctx).await?;
        Ok(PhaseOutput::new(input.name.clone()).with_detail("target", input.target.clone()))
    }

    async fn select(&mut self, name: String, ctx: &PhaseContext) -> PhaseResult<(String, Vec<String>)> {
        self.act(&name, PhaseName::Selection, ctx).await?;
        let pages = vec![format!("{name}/about"), format!("{name}/team")];
        let count = pages.len();
        Ok(PhaseOutput::new((name, pages)).with_detail("selected", count))
    }

    async fn extract(
        &mut self,
        selected: (String, Vec<String>),
        ctx: &PhaseContext,
    ) -> PhaseResult<(String, usize)> {
        let (name, pages) = selected;
        self.act(&name, PhaseName::Extraction, ctx).await?;
        Ok(PhaseOutput::new((name, pages.len())))
    }

    async fn aggregate(&mut self, extracted: (String, usize), ctx: &PhaseContext) -> PhaseResult<Aggregate> {
        let (name, pages) = extracted;
        self.act(&name, PhaseName::Aggregation, ctx).await?;
        let mut usage = Usage::new();
        usage.add("pages_fetched", pages as u64);
        Ok(PhaseOutput::new(Aggregate {
            payload: serde_json::json!({ "name": name, "pages": pages }),
            usage,
        }))
    }
}

/// Inputs named `job-0`, `job-1`, ...
pub(crate) fn inputs(n: usize) -> Vec<JobInput> {
    (0..n)
        .map(|i| JobInput::new(format!("job-{i}"), format!("https://job-{i}.test")))
        .collect()
}
