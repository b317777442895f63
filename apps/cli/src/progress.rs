//! Live per-job progress bars fed by the tracker's broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use batchscout_core::{CancellationToken, Job, ProgressTracker};
use batchscout_shared::{JobId, JobStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// One bar per job, created on the job's first snapshot.
pub(crate) struct BatchProgress {
    multi: MultiProgress,
    bars: HashMap<JobId, ProgressBar>,
    style: ProgressStyle,
    name_width: usize,
}

impl BatchProgress {
    pub fn new(name_width: usize) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            style,
            name_width,
        }
    }

    /// Render the latest snapshot of a job.
    pub fn apply(&mut self, job: &Job) {
        let bar = self.bars.entry(job.id().clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(self.style.clone());
            bar.set_prefix(format!("{:<width$}", job.input().name, width = self.name_width));
            bar
        });
        if bar.is_finished() {
            return;
        }

        bar.set_position(u64::from(job.progress_percent()));
        bar.set_message(status_line(job));
        match job.status() {
            JobStatus::Completed => bar.finish(),
            JobStatus::Failed | JobStatus::Cancelled => bar.abandon(),
            JobStatus::Pending | JobStatus::Running => {}
        }
    }

    /// Follow `tracker` until `stop` fires, then hand the bars back.
    pub fn follow(
        mut self,
        tracker: &Arc<ProgressTracker>,
        stop: CancellationToken,
    ) -> JoinHandle<Self> {
        let mut events = tracker.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(job) => self.apply(&job),
                        // The tracker stays authoritative; the final sweep catches up.
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            self
        })
    }
}

fn status_line(job: &Job) -> String {
    match job.status() {
        JobStatus::Pending => "queued".to_string(),
        JobStatus::Running => match job.current_phase() {
            Some(phase) => {
                let url = job
                    .phase(phase)
                    .and_then(|record| record.details.get("current_url"));
                match url {
                    Some(url) => format!("{phase} {url}"),
                    None => phase.to_string(),
                }
            }
            None => "running".to_string(),
        },
        JobStatus::Completed => "done".to_string(),
        JobStatus::Cancelled => "cancelled".to_string(),
        JobStatus::Failed => match job.error() {
            Some(err) => format!("failed: {err}"),
            None => "failed".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchscout_shared::{Details, JobInput, PhaseName};

    #[test]
    fn status_line_follows_job_state() {
        let mut job = Job::new(JobInput::new("acme", "https://acme.example.com"));
        assert_eq!(status_line(&job), "queued");

        job.start(PhaseName::Discovery).unwrap();
        assert_eq!(status_line(&job), "Discovery");

        job.fail(PhaseName::Discovery, "HTTP 404", Details::new()).unwrap();
        assert!(status_line(&job).starts_with("failed: "));
        assert!(status_line(&job).contains("HTTP 404"));
    }

    #[test]
    fn finished_bars_ignore_late_snapshots() {
        let mut progress = BatchProgress::new(8);
        let mut job = Job::new(JobInput::new("acme", "https://acme.example.com"));
        job.cancel().unwrap();
        progress.apply(&job);

        let bar = &progress.bars[job.id()];
        assert!(bar.is_finished());
        assert_eq!(bar.position(), 0);
    }
}
