//! Stage-by-stage execution of one job
//!
//! Blocking work (decompression, hashing, device writes, file injection)
//! runs on the blocking pool; the download runs on the async runtime.
//!
//! A catalog job holds the cache claim on its image from download until the
//! entry is verified, so jobs sharing an image download it once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinError;

use super::events::{EventSink, Stage};
use super::job::{ImageSource, JobId, JobOutcome, JobRequest};
use crate::cache::{CacheEntry, ImageCache, StagedImage};
use crate::config::FlashConfig;
use crate::decompress::{self, ScratchImage};
use crate::devices::{DeviceDescriptor, DeviceEnumerator};
use crate::download::{DownloadOptions, Downloader, FetchRequest};
use crate::error::{FailureKind, JobError};
use crate::flash::{BlockWriter, WriteOptions};
use crate::images::{self, Checksum, ChecksumAlgorithm, CompressionKind, ImageDescriptor};
use crate::inject::{ConfigInjector, DomainFailure};
use crate::utils::{format_size, CancelToken};
use crate::verify::{self, VerifyOutcome};
use crate::{log_error, log_info, log_warn};

const MODULE: &str = "orchestrator::pipeline";

fn worker_failed(e: JoinError) -> JobError {
    JobError::new(FailureKind::Cache, format!("worker task failed: {}", e))
}

/// Raw image ready for writing
struct PreparedImage {
    path: PathBuf,
    /// Decompressed custom image, removed once writing is over
    _scratch: Option<ScratchImage>,
}

impl PreparedImage {
    fn at(path: PathBuf) -> Self {
        Self {
            path,
            _scratch: None,
        }
    }
}

pub(super) struct JobContext {
    pub id: JobId,
    pub request: JobRequest,
    /// Catalog descriptor, resolved at submission
    pub image: Option<ImageDescriptor>,
    pub cache: Arc<ImageCache>,
    pub downloader: Arc<Downloader>,
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub client: reqwest::Client,
    pub download: DownloadOptions,
    pub flash: FlashConfig,
    pub sink: EventSink,
    pub cancel: CancelToken,
}

impl JobContext {
    pub(super) async fn run(&self) -> JobOutcome {
        match self.run_stages().await {
            Ok(outcome) => outcome,
            Err(err) => {
                let stage = self.sink.stage();
                if err.is_cancelled() {
                    log_info!(MODULE, "Job {} cancelled while {}", self.id, stage);
                } else {
                    log_error!(MODULE, "Job {} failed while {}: {}", self.id, stage, err);
                }
                JobOutcome::failed(stage, err)
            }
        }
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }
        Ok(())
    }

    async fn run_stages(&self) -> Result<JobOutcome, JobError> {
        self.checkpoint()?;
        self.sink.begin(Stage::Resolving, "Resolving image");

        let prepared = match (&self.request.image, &self.image) {
            (ImageSource::Catalog(_), Some(image)) => self.prepare_catalog(image).await?,
            (ImageSource::Custom(path), _) => self.prepare_custom(path).await?,
            (ImageSource::Catalog(id), None) => {
                return Err(JobError::new(
                    FailureKind::InvalidSettings,
                    format!("Unknown image: {}", id),
                ))
            }
        };

        let device = self.write(&prepared.path).await;
        drop(prepared);
        self.configure(&device?).await
    }

    fn plan(&self, mut stages: Vec<Stage>) {
        stages.insert(0, Stage::Resolving);
        stages.push(Stage::Writing);
        if !self.request.settings.is_empty() {
            stages.push(Stage::Configuring);
        }
        self.sink.set_plan(stages);
    }

    async fn resolve_checksum(&self, image: &ImageDescriptor) -> Result<Option<Checksum>, JobError> {
        if let Some(checksum) = &image.checksum {
            return Ok(Some(checksum.clone()));
        }
        let Some(sha_url) = &image.checksum_url else {
            log_warn!(MODULE, "{} declares no checksum; skipping verification", image.id);
            return Ok(None);
        };
        images::fetch_sidecar_checksum(&self.client, sha_url)
            .await
            .map(Some)
            .map_err(|e| JobError::new(FailureKind::Network, e))
    }

    /// Download, decompress and verify a catalog image; returns the raw image
    async fn prepare_catalog(&self, image: &ImageDescriptor) -> Result<PreparedImage, JobError> {
        let checksum = self.resolve_checksum(image).await?;

        let mut stages = vec![Stage::Downloading];
        if image.compression.is_compressed() {
            stages.push(Stage::Decompressing);
        }
        if checksum.is_some() {
            stages.push(Stage::Verifying);
        }
        self.plan(stages);

        let request = FetchRequest {
            url: &image.url,
            checksum: checksum.as_ref(),
            compression: image.compression,
        };
        let key = request.partial_key();
        self.checkpoint()?;
        let _claim = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(JobError::cancelled()),
            claim = self.cache.claim(&key) => claim,
        };

        if let Some(checksum) = &checksum {
            if let Some(entry) = self.cache.lookup(checksum) {
                if let Some(path) = self.prepare_cached(image, entry).await? {
                    return Ok(PreparedImage::at(path));
                }
                // A stale cache hit gets one fresh download
                log_warn!(
                    MODULE,
                    "Cached copy of {} is corrupt; downloading again",
                    image.id
                );
            }
        }

        let path = self.prepare_fresh(image, &request).await?;
        Ok(PreparedImage::at(path))
    }

    /// Check a cache hit; `None` means the blob was bad and has been evicted
    async fn prepare_cached(
        &self,
        image: &ImageDescriptor,
        entry: CacheEntry,
    ) -> Result<Option<PathBuf>, JobError> {
        self.checkpoint()?;
        self.sink
            .begin(Stage::Downloading, format!("Using cached {}", image.name));
        let checksum = entry.checksum.clone();

        let entry = if entry.compression.is_compressed() {
            self.decompress_cached(entry).await?
        } else {
            entry
        };

        self.checkpoint()?;
        self.sink.begin(Stage::Verifying, "Verifying checksum");
        match self.verify(&entry.path, entry.size, &checksum).await? {
            VerifyOutcome::Ok => {
                if let Err(e) = self.cache.touch_verified(&checksum) {
                    log_warn!(MODULE, "Could not record verification time: {}", e);
                }
                raw_path(&entry).map(Some)
            }
            VerifyOutcome::Mismatch { computed_digest } => {
                log_warn!(
                    MODULE,
                    "Cached {} hashes to {}",
                    checksum,
                    computed_digest
                );
                if let Err(e) = self.cache.evict(&checksum) {
                    log_warn!(MODULE, "Failed to evict {}: {}", checksum, e);
                }
                Ok(None)
            }
        }
    }

    /// Reuse the cached decompressed image if it still matches its digest
    async fn decompress_cached(&self, entry: CacheEntry) -> Result<CacheEntry, JobError> {
        let (Some(image), Some(size), Some(digest)) = (
            entry.raw_image().map(Path::to_path_buf),
            entry.decompressed_size,
            entry.decompressed_digest.clone(),
        ) else {
            return self.decompress(entry).await;
        };

        self.checkpoint()?;
        self.sink
            .begin(Stage::Decompressing, "Checking decompressed image");
        let expected = Checksum::new(ChecksumAlgorithm::Sha256, &digest)
            .map_err(|e| JobError::new(FailureKind::Cache, e))?;
        match self.verify(&image, size, &expected).await? {
            VerifyOutcome::Ok => Ok(entry),
            VerifyOutcome::Mismatch { .. } => {
                log_warn!(
                    MODULE,
                    "Decompressed copy of {} is corrupt; decompressing again",
                    entry.checksum
                );
                let entry = self.cache.discard_decompressed(&entry.checksum)?;
                self.decompress(entry).await
            }
        }
    }

    /// Download, decompress, then hash before anything enters the cache
    async fn prepare_fresh(
        &self,
        image: &ImageDescriptor,
        request: &FetchRequest<'_>,
    ) -> Result<PathBuf, JobError> {
        self.checkpoint()?;
        self.sink
            .begin(Stage::Downloading, format!("Downloading {}", image.name));
        let partial = self.download(image, request).await?;

        let staged = if request.compression.is_compressed() {
            Some(self.decompress_staged(request, &partial).await?)
        } else {
            None
        };
        let staged_path = staged.as_ref().map(|s| s.path.clone());

        let result = match request.checksum {
            Some(_) => {
                let total = std::fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);
                self.sink.begin(Stage::Verifying, "Verifying checksum");
                let sink = self.sink.clone();
                self.downloader
                    .commit(request, staged, &self.cancel, move |done| {
                        sink.advance(done, total, || format!("Verified {}", format_size(done)))
                    })
                    .await
            }
            None => self.downloader.commit(request, staged, &self.cancel, |_| {}).await,
        };
        if let Some(path) = staged_path {
            // Moved into the entry on success; leftover otherwise
            let _ = std::fs::remove_file(path);
        }

        let entry = result?;
        if request.checksum.is_some() {
            log_info!(MODULE, "Checksum verified for {}", entry.checksum);
        }
        raw_path(&entry)
    }

    async fn download(
        &self,
        image: &ImageDescriptor,
        request: &FetchRequest<'_>,
    ) -> Result<PathBuf, JobError> {
        let mut options = self.download.clone();
        options.expected_size = image.download_size;
        if let Some(timeout) = self.request.options.connect_timeout {
            options.connect_timeout = timeout;
        }
        if let Some(timeout) = self.request.options.read_timeout {
            options.read_timeout = timeout;
        }

        let sink = &self.sink;
        let partial = self
            .downloader
            .download(request, &options, &self.cancel, |p| {
                sink.advance(p.bytes_written, p.total_bytes, || {
                    format!(
                        "Downloaded {} of {}",
                        format_size(p.bytes_written),
                        format_size(p.total_bytes)
                    )
                })
            })
            .await?;
        Ok(partial)
    }

    /// Decompress a fresh download next to its partial file
    async fn decompress_staged(
        &self,
        request: &FetchRequest<'_>,
        partial: &Path,
    ) -> Result<StagedImage, JobError> {
        self.checkpoint()?;
        self.sink.begin(Stage::Decompressing, "Decompressing image");

        let key = request.partial_key();
        let input = partial.to_path_buf();
        let output = self.cache.partial_path(&format!("{}.image", key));
        let kind = request.compression;
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let result = tokio::task::spawn_blocking(move || {
            decompress::decompress_staged(&input, &output, kind, &cancel, |p| {
                sink.advance(p.bytes_processed, p.total_bytes, || {
                    format!("Decompressed {}", format_size(p.bytes_written))
                })
            })
        })
        .await
        .map_err(worker_failed)?;

        result.map_err(|e| {
            let err = JobError::from(e);
            if !err.is_cancelled() {
                // A download that will not decode is useless to resume
                self.cache.discard_partial(&key);
            }
            err
        })
    }

    async fn decompress(&self, entry: CacheEntry) -> Result<CacheEntry, JobError> {
        self.checkpoint()?;
        self.sink.begin(Stage::Decompressing, "Decompressing image");

        let checksum = entry.checksum.clone();
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let result = tokio::task::spawn_blocking(move || {
            decompress::decompress(&cache, &entry, &cancel, |p| {
                sink.advance(p.bytes_processed, p.total_bytes, || {
                    format!("Decompressed {}", format_size(p.bytes_written))
                })
            })
        })
        .await
        .map_err(worker_failed)?;

        match result {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let err = JobError::from(e);
                if !err.is_cancelled() {
                    // A blob that will not decode is useless to keep
                    if let Err(evict_err) = self.cache.evict(&checksum) {
                        log_warn!(MODULE, "Failed to evict {}: {}", checksum, evict_err);
                    }
                }
                Err(err)
            }
        }
    }

    async fn verify(
        &self,
        path: &Path,
        total: u64,
        checksum: &Checksum,
    ) -> Result<VerifyOutcome, JobError> {
        let path = path.to_path_buf();
        let checksum = checksum.clone();
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            verify::verify_checksum(&path, &checksum, &cancel, |done| {
                sink.advance(done, total, || format!("Verified {}", format_size(done)))
            })
        })
        .await
        .map_err(worker_failed)??;
        Ok(outcome)
    }

    /// Local image; compressed files are decompressed into the scratch area
    async fn prepare_custom(&self, path: &Path) -> Result<PreparedImage, JobError> {
        if !path.is_file() {
            return Err(JobError::new(
                FailureKind::InvalidSettings,
                format!("Image file not found: {}", path.display()),
            ));
        }
        let kind = CompressionKind::detect(path).map_err(|e| {
            JobError::new(
                FailureKind::InvalidSettings,
                format!("Cannot read {}: {}", path.display(), e),
            )
        })?;

        if !kind.is_compressed() {
            self.plan(Vec::new());
            return Ok(PreparedImage::at(path.to_path_buf()));
        }

        self.plan(vec![Stage::Decompressing]);
        self.checkpoint()?;
        self.sink
            .begin(Stage::Decompressing, format!("Decompressing {}", path.display()));

        let input = path.to_path_buf();
        let scratch = self.cache.scratch_dir();
        let tag = format!("job-{}", self.id);
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let output = tokio::task::spawn_blocking(move || {
            decompress::decompress_custom(&input, kind, &scratch, &tag, &cancel, |p| {
                sink.advance(p.bytes_processed, p.total_bytes, || {
                    format!("Decompressed {}", format_size(p.bytes_written))
                })
            })
        })
        .await
        .map_err(worker_failed)??;
        Ok(PreparedImage {
            path: output.path().to_path_buf(),
            _scratch: Some(output),
        })
    }

    async fn write(&self, image: &Path) -> Result<DeviceDescriptor, JobError> {
        self.checkpoint()?;
        self.sink.begin(Stage::Writing, "Preparing device");

        let enumerator = Arc::clone(&self.enumerator);
        let device_id = self.request.device_id.clone();
        let device = tokio::task::spawn_blocking(move || enumerator.prepare_for_write(&device_id))
            .await
            .map_err(worker_failed)??;

        self.checkpoint()?;
        log_info!(
            MODULE,
            "Job {}: writing {} to {}",
            self.id,
            image.display(),
            device
        );

        let options = WriteOptions {
            allow_non_removable: self.request.options.allow_non_removable,
            ..WriteOptions::from(&self.flash)
        };
        let source = image.to_path_buf();
        let target = device.clone();
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut writer = BlockWriter::new(options);
            writer.write(&source, &target, &cancel, |p| {
                sink.advance(p.bytes_written, p.total_bytes, || {
                    format!(
                        "Written {} of {}",
                        format_size(p.bytes_written),
                        format_size(p.total_bytes)
                    )
                })
            })
        })
        .await
        .map_err(|e| {
            JobError::new(
                FailureKind::WriteFailed { bytes_written: 0 },
                format!("writer task failed: {}", e),
            )
        })??;

        if let Err(e) = self.enumerator.sync(&device) {
            log_warn!(MODULE, "Device sync failed: {}", e);
        }

        if self.request.options.verify_after_write {
            self.verify_written(image, &device, written).await?;
        }
        Ok(device)
    }

    async fn verify_written(
        &self,
        image: &Path,
        device: &DeviceDescriptor,
        written: u64,
    ) -> Result<(), JobError> {
        self.checkpoint()?;
        self.sink.advance(0, written, || "Verifying written data".to_string());

        let source = image.to_path_buf();
        let device_path = device.path.clone();
        let cancel = self.cancel.clone();
        let sink = self.sink.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            verify::verify_device(&source, &device_path, written, &cancel, |done| {
                sink.advance(done, written, || format!("Read back {}", format_size(done)))
            })
        })
        .await
        .map_err(worker_failed)??;

        match outcome {
            VerifyOutcome::Ok => Ok(()),
            VerifyOutcome::Mismatch { computed_digest } => Err(JobError::new(
                FailureKind::WriteFailed {
                    bytes_written: written,
                },
                format!("Read-back mismatch on {} (device digest {})", device.id, computed_digest),
            )),
        }
    }

    async fn configure(&self, device: &DeviceDescriptor) -> Result<JobOutcome, JobError> {
        let settings = self.request.settings.clone();
        if settings.is_empty() {
            return Ok(JobOutcome::Succeeded);
        }

        self.checkpoint()?;
        self.sink.begin(Stage::Configuring, "Applying configuration");

        let requested = settings.requested_domains();
        let enumerator = Arc::clone(&self.enumerator);
        let device = device.clone();
        let result = tokio::task::spawn_blocking(move || {
            ConfigInjector::new(enumerator.as_ref()).apply(&device, &settings)
        })
        .await;

        // The image is on the card either way; configuration problems are warnings
        let reason = match result {
            Ok(Ok(report)) if report.is_complete() => return Ok(JobOutcome::Succeeded),
            Ok(Ok(report)) => {
                return Ok(JobOutcome::SucceededWithWarnings {
                    failed: report.failed,
                })
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("configuration task failed: {}", e),
        };
        log_warn!(MODULE, "Job {}: configuration skipped: {}", self.id, reason);
        Ok(JobOutcome::SucceededWithWarnings {
            failed: requested
                .into_iter()
                .map(|domain| DomainFailure {
                    domain,
                    reason: reason.clone(),
                })
                .collect(),
        })
    }
}

fn raw_path(entry: &CacheEntry) -> Result<PathBuf, JobError> {
    entry.raw_image().map(Path::to_path_buf).ok_or_else(|| {
        JobError::new(
            FailureKind::Cache,
            format!("No raw image for {}", entry.checksum),
        )
    })
}
