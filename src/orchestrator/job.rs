//! Job requests, outcomes and handles

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::events::{JobSnapshot, ProgressEvent, Stage};
use crate::error::{FailureKind, JobError, Remediation};
use crate::inject::DomainFailure;
use crate::settings::InstallSettings;
use crate::utils::CancelToken;

pub type JobId = u64;

/// Which image to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Catalog image id
    Catalog(String),
    /// Local file, raw or compressed
    Custom(PathBuf),
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Catalog(id) => write!(f, "{}", id),
            ImageSource::Custom(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Permit writing to fixed or system disks
    pub allow_non_removable: bool,
    /// Read the device back and compare after writing
    pub verify_after_write: bool,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub device_id: String,
    pub image: ImageSource,
    pub settings: InstallSettings,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(device_id: impl Into<String>, image: ImageSource) -> Self {
        Self {
            device_id: device_id.into(),
            image,
            settings: InstallSettings::default(),
            options: JobOptions::default(),
        }
    }

    pub fn with_settings(mut self, settings: InstallSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    /// Image written but some configuration domains failed
    SucceededWithWarnings { failed: Vec<DomainFailure> },
    Failed {
        stage: Stage,
        error: JobError,
        remediation: Remediation,
    },
    Cancelled { stage: Stage },
}

impl JobOutcome {
    pub(crate) fn failed(stage: Stage, error: JobError) -> Self {
        if error.is_cancelled() {
            return JobOutcome::Cancelled { stage };
        }
        let remediation = error.remediation();
        JobOutcome::Failed {
            stage,
            error,
            remediation,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            JobOutcome::Succeeded | JobOutcome::SucceededWithWarnings { .. }
        )
    }

    /// Failure kind, if the job failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            JobOutcome::Failed { error, .. } => Some(error.kind),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            JobOutcome::Succeeded => "Installation complete".to_string(),
            JobOutcome::SucceededWithWarnings { failed } => format!(
                "Installation complete; configuration failed for {}",
                failed
                    .iter()
                    .map(|f| f.domain.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            JobOutcome::Failed {
                stage,
                error,
                remediation,
            } => {
                let hint = remediation.hint();
                if hint.is_empty() {
                    format!("Failed while {}: {}", stage, error)
                } else {
                    format!("Failed while {}: {} ({})", stage, error, hint)
                }
            }
            JobOutcome::Cancelled { stage } => format!("Cancelled while {}", stage),
        }
    }
}

/// Archived record of a finished job
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub device_id: String,
    pub image: String,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Caller's view of a running job
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub(crate) id: JobId,
    pub(crate) events: broadcast::Sender<ProgressEvent>,
    pub(crate) snapshot: watch::Receiver<JobSnapshot>,
    pub(crate) cancel: CancelToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Request cancellation
    ///
    /// Returns false if the job already ended or is in its final device
    /// flush, where cancellation is refused.
    pub fn cancel(&self) -> bool {
        if self.snapshot.borrow().outcome.is_some() {
            return false;
        }
        self.cancel.cancel()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.snapshot.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().outcome.clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let snapshot = rx.borrow().clone();
                // Job task ended without publishing; only happens if it panicked
                return snapshot.outcome.unwrap_or_else(|| {
                    JobOutcome::failed(
                        snapshot.stage,
                        JobError::new(FailureKind::Cache, "job task ended unexpectedly"),
                    )
                });
            }
        }
    }
}
