//! Install orchestrator
//!
//! Accepts provisioning jobs and drives each one through
//! `Queued -> Resolving -> Downloading -> Decompressing -> Verifying ->
//! Writing -> Configuring` on its own task. Jobs against different devices
//! run concurrently; a device already held by a job is refused.

mod events;
mod job;
mod locks;
mod pipeline;

pub use events::{JobSnapshot, ProgressEvent, Stage};
pub use job::{ImageSource, JobHandle, JobId, JobOptions, JobOutcome, JobRequest, JobResult};
pub use locks::{DeviceLockGuard, DeviceLocks};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::cache::ImageCache;
use crate::config::{AppConfig, FlashConfig};
use crate::devices::{DeviceDescriptor, DeviceEnumerator, DeviceError};
use crate::download::{DownloadError, DownloadOptions, Downloader};
use crate::error::{FailureKind, JobError};
use crate::images::Catalog;
use crate::utils::CancelToken;
use crate::{log_info, log_warn};

use events::EventSink;
use pipeline::JobContext;

const MODULE: &str = "orchestrator";

pub struct InstallOrchestrator {
    cache: Arc<ImageCache>,
    downloader: Arc<Downloader>,
    enumerator: Arc<dyn DeviceEnumerator>,
    catalog: Arc<Catalog>,
    download: DownloadOptions,
    flash: FlashConfig,
    event_capacity: usize,
    locks: DeviceLocks,
    results: Arc<Mutex<Vec<JobResult>>>,
    next_id: AtomicU64,
}

impl InstallOrchestrator {
    pub fn new(
        cache: Arc<ImageCache>,
        enumerator: Arc<dyn DeviceEnumerator>,
        catalog: Catalog,
        config: &AppConfig,
    ) -> Result<Self, DownloadError> {
        let downloader = Downloader::new(Arc::clone(&cache), &config.download)?;

        Ok(Self {
            downloader: Arc::new(downloader),
            cache,
            enumerator,
            catalog: Arc::new(catalog),
            download: DownloadOptions::from(&config.download),
            flash: config.flash.clone(),
            event_capacity: config.event_capacity(),
            locks: DeviceLocks::default(),
            results: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Fresh device listing from the OS
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.enumerator.list_devices()
    }

    /// Accept a job and start it on its own task
    ///
    /// Rejects invalid settings, unknown images, missing devices and devices
    /// held by another job before any I/O starts. Must be called within a
    /// Tokio runtime.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, JobError> {
        request.settings.validate()?;

        let image = match &request.image {
            ImageSource::Catalog(id) => Some(self.catalog.find(id).cloned().ok_or_else(|| {
                JobError::new(FailureKind::InvalidSettings, format!("Unknown image: {}", id))
            })?),
            ImageSource::Custom(_) => None,
        };

        let device = self.enumerator.refresh_device(&request.device_id)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let guard = self
            .locks
            .try_acquire(&device.id, id)
            .map_err(|holder| {
                log_warn!(
                    MODULE,
                    "Refusing job for {}: held by job {}",
                    device.id,
                    holder
                );
                JobError::new(
                    FailureKind::DeviceBusy,
                    format!("Device {} is in use by job {}", device.id, holder),
                )
            })?;

        log_info!(
            MODULE,
            "Job {} accepted: {} -> {}",
            id,
            request.image,
            device
        );

        let (sink, events, snapshot) = EventSink::new(id, self.event_capacity);
        let cancel = CancelToken::new();
        let context = JobContext {
            id,
            request,
            image,
            cache: Arc::clone(&self.cache),
            downloader: Arc::clone(&self.downloader),
            enumerator: Arc::clone(&self.enumerator),
            client: self.downloader.client().clone(),
            download: self.download.clone(),
            flash: self.flash.clone(),
            sink: sink.clone(),
            cancel: cancel.clone(),
        };

        let results = Arc::clone(&self.results);
        let started_at = Utc::now();
        tokio::spawn(async move {
            let outcome = context.run().await;
            // Free the device before anyone can observe the terminal state
            drop(guard);

            let record = JobResult {
                job_id: context.id,
                device_id: context.request.device_id.clone(),
                image: context.request.image.to_string(),
                outcome: outcome.clone(),
                started_at,
                finished_at: Utc::now(),
            };
            results
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(record);

            let summary = outcome.summary();
            log_info!(MODULE, "Job {} finished: {}", context.id, summary);
            sink.finish(outcome, summary);
        });

        Ok(JobHandle {
            id,
            events,
            snapshot,
            cancel,
        })
    }

    /// Archived records of finished jobs, oldest first
    pub fn results(&self) -> Vec<JobResult> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Devices currently held by running jobs
    pub fn active_jobs(&self) -> usize {
        self.locks.active()
    }
}
