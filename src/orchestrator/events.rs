//! Job progress events
//!
//! Each job publishes on a bounded broadcast channel. A slow subscriber
//! loses the oldest unread events instead of stalling the pipeline, and a
//! job with no subscribers still runs to completion. The latest state is
//! also kept in a `watch` slot so late callers can read a snapshot.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::job::{JobId, JobOutcome};
use crate::utils::percent_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Resolving,
    Downloading,
    Decompressing,
    Verifying,
    Writing,
    Configuring,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Resolving => "resolving",
            Stage::Downloading => "downloading",
            Stage::Decompressing => "decompressing",
            Stage::Verifying => "verifying",
            Stage::Writing => "writing",
            Stage::Configuring => "configuring",
        }
    }

    /// Share of the overall progress bar
    fn weight(self) -> u64 {
        match self {
            Stage::Queued => 0,
            Stage::Resolving => 2,
            Stage::Downloading => 35,
            Stage::Decompressing => 15,
            Stage::Verifying => 8,
            Stage::Writing => 35,
            Stage::Configuring => 5,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,
    /// Overall job progress, 0-100
    pub percent: u8,
    pub message: String,
    pub terminal: bool,
    /// Present only on the terminal event
    pub outcome: Option<JobOutcome>,
}

/// Latest known state of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug)]
struct Progress {
    plan: Vec<Stage>,
    stage: Stage,
    stage_percent: u8,
    percent: u8,
}

/// Producer side of a job's event stream
#[derive(Clone)]
pub(crate) struct EventSink {
    job_id: JobId,
    events: broadcast::Sender<ProgressEvent>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    progress: Arc<Mutex<Progress>>,
}

impl EventSink {
    pub(crate) fn new(
        job_id: JobId,
        capacity: usize,
    ) -> (Self, broadcast::Sender<ProgressEvent>, watch::Receiver<JobSnapshot>) {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (snapshot, snapshot_rx) = watch::channel(JobSnapshot {
            job_id,
            stage: Stage::Queued,
            percent: 0,
            message: "Queued".to_string(),
            outcome: None,
        });
        let sink = Self {
            job_id,
            events: events.clone(),
            snapshot: Arc::new(snapshot),
            progress: Arc::new(Mutex::new(Progress {
                plan: vec![Stage::Resolving],
                stage: Stage::Queued,
                stage_percent: 0,
                percent: 0,
            })),
        };
        (sink, events, snapshot_rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stages this job will pass through, used to weight the overall percent
    pub(crate) fn set_plan(&self, plan: Vec<Stage>) {
        self.lock().plan = plan;
    }

    pub(crate) fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Enter `stage`
    pub(crate) fn begin(&self, stage: Stage, message: impl Into<String>) {
        let percent = {
            let mut progress = self.lock();
            progress.stage = stage;
            progress.stage_percent = 0;
            progress.percent = progress.percent.max(overall(&progress.plan, stage, 0, 1));
            progress.percent
        };
        self.publish(stage, percent, message.into(), None);
    }

    /// Report `done` of `total` within the current stage
    ///
    /// Only whole-percent changes are published.
    pub(crate) fn advance(&self, done: u64, total: u64, message: impl FnOnce() -> String) {
        let update = {
            let mut progress = self.lock();
            let stage_percent = percent_of(done, total);
            if stage_percent == progress.stage_percent && done != 0 {
                None
            } else {
                progress.stage_percent = stage_percent;
                let stage = progress.stage;
                let percent = progress
                    .percent
                    .max(overall(&progress.plan, stage, done, total));
                progress.percent = percent;
                Some((stage, percent))
            }
        };
        if let Some((stage, percent)) = update {
            self.publish(stage, percent, message(), None);
        }
    }

    /// Publish the terminal event
    pub(crate) fn finish(&self, outcome: JobOutcome, message: impl Into<String>) {
        let (stage, percent) = {
            let mut progress = self.lock();
            if matches!(outcome, JobOutcome::Succeeded | JobOutcome::SucceededWithWarnings { .. }) {
                progress.percent = 100;
            }
            (progress.stage, progress.percent)
        };
        self.publish(stage, percent, message.into(), Some(outcome));
    }

    fn publish(&self, stage: Stage, percent: u8, message: String, outcome: Option<JobOutcome>) {
        let terminal = outcome.is_some();
        self.snapshot.send_replace(JobSnapshot {
            job_id: self.job_id,
            stage,
            percent,
            message: message.clone(),
            outcome: outcome.clone(),
        });
        // No subscribers is fine
        let _ = self.events.send(ProgressEvent {
            job_id: self.job_id,
            stage,
            percent,
            message,
            terminal,
            outcome,
        });
    }
}

/// Overall percent for `done/total` of `stage` within `plan`
fn overall(plan: &[Stage], stage: Stage, done: u64, total: u64) -> u8 {
    let total_weight: u64 = plan.iter().map(|s| s.weight()).sum();
    if total_weight == 0 {
        return 0;
    }
    let Some(pos) = plan.iter().position(|s| *s == stage) else {
        return 0;
    };
    let before: u64 = plan[..pos].iter().map(|s| s.weight()).sum();
    let within = if total == 0 {
        0
    } else {
        stage.weight() * done.min(total) / total
    };
    percent_of(before + within, total_weight)
}
