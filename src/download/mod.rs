//! Download module
//!
//! Resumable HTTP fetch of images into the cache. Partial downloads live in
//! the cache's `partial/` directory and are resumed with range requests.
//! Only one download per partial file runs at a time; see [`ImageCache::claim`].

mod retry;

pub use retry::{RetryHandle, RetryPolicy, RetryStrategy};

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheEntry, CacheError, ImageCache, StagedImage};
use crate::config::{self, DownloadConfig};
use crate::images::{Checksum, ChecksumAlgorithm, CompressionKind};
use crate::utils::{bytes_to_mb, CancelToken, ProgressTracker};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "download";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),
    #[error("Download failed after {attempts} attempt(s): {reason}")]
    Network { reason: String, attempts: usize },
    #[error("Server returned {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Downloaded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Download I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to hash download: {0}")]
    Hash(String),
    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Download cancelled after {bytes_written} bytes")]
    Cancelled { bytes_written: u64 },
}

impl DownloadError {
    /// Network failures the caller may fix by downloading again
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DownloadError::Network { .. }
                | DownloadError::HttpStatus { .. }
                | DownloadError::SizeMismatch { .. }
        )
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Byte-level download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_written: u64,
    /// 0 when the server did not report a length
    pub total_bytes: u64,
}

/// Per-call download settings
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub expected_size: Option<u64>,
    pub connect_timeout: Duration,
    /// Longest wait for the next body chunk
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions::from(&DownloadConfig::default())
    }
}

impl From<&DownloadConfig> for DownloadOptions {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            expected_size: None,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            retry: config.retry_policy(),
        }
    }
}

/// What to fetch and how to file it in the cache
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// Declared digest of the downloaded bytes; the cache key when present
    pub checksum: Option<&'a Checksum>,
    pub compression: CompressionKind,
}

impl FetchRequest<'_> {
    /// Name of the partial download file for this request
    pub fn partial_key(&self) -> String {
        match self.checksum {
            Some(checksum) => checksum.cache_key(),
            None => {
                let digest = hex::encode(Sha256::digest(self.url.as_bytes()));
                format!("url-{}", &digest[..16])
            }
        }
    }
}

/// Outcome of one attempt
enum Attempt {
    Done,
    Retry(String),
}

fn build_client(connect_timeout: Duration) -> Result<Client, DownloadError> {
    Client::builder()
        .user_agent(config::app::USER_AGENT)
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| DownloadError::Client(e.to_string()))
}

/// Streams images into an [`ImageCache`]
pub struct Downloader {
    cache: Arc<ImageCache>,
    client: Client,
    connect_timeout: Duration,
}

impl Downloader {
    pub fn new(cache: Arc<ImageCache>, config: &DownloadConfig) -> Result<Self, DownloadError> {
        let connect_timeout = config.connect_timeout();
        Ok(Self {
            cache,
            client: build_client(connect_timeout)?,
            connect_timeout,
        })
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Shared HTTP client; clones reuse its connection pool
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fetch `request.url` into the cache
    ///
    /// A cached entry for the declared checksum is returned without network
    /// access. On cancellation the partial file is flushed and kept so the
    /// next call resumes from it.
    pub async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        options: &DownloadOptions,
        cancel: &CancelToken,
        mut progress: impl FnMut(DownloadProgress),
    ) -> Result<CacheEntry, DownloadError> {
        if let Some(entry) = self.cached(request, &mut progress) {
            return Ok(entry);
        }

        let key = request.partial_key();
        let _claim = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DownloadError::Cancelled { bytes_written: self.cache.partial_len(&key) });
            }
            claim = self.cache.claim(&key) => claim,
        };
        // Another fetch may have finished while we waited
        if let Some(entry) = self.cached(request, &mut progress) {
            return Ok(entry);
        }

        self.download(request, options, cancel, &mut progress).await?;
        self.commit(request, None, cancel, |_| {}).await
    }

    fn cached(
        &self,
        request: &FetchRequest<'_>,
        progress: &mut impl FnMut(DownloadProgress),
    ) -> Option<CacheEntry> {
        let checksum = request.checksum?;
        let entry = self.cache.lookup(checksum)?;
        log_info!(MODULE, "Using cached image {}", checksum);
        progress(DownloadProgress {
            bytes_written: entry.size,
            total_bytes: entry.size,
        });
        Some(entry)
    }

    /// Bring `request.url` into its partial file and return the file's path
    ///
    /// The caller holds the cache claim on [`FetchRequest::partial_key`].
    pub async fn download(
        &self,
        request: &FetchRequest<'_>,
        options: &DownloadOptions,
        cancel: &CancelToken,
        mut progress: impl FnMut(DownloadProgress),
    ) -> Result<PathBuf, DownloadError> {
        let key = request.partial_key();
        let partial = self.cache.partial_path(&key);
        if let Some(parent) = partial.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        log_info!(MODULE, "Download requested: {}", request.url);
        log_debug!(MODULE, "Partial path: {}", partial.display());

        if let Some(local) = request.url.strip_prefix("file://") {
            copy_local(Path::new(local), &partial, cancel, &mut progress)?;
        } else {
            self.fetch_http(request.url, &partial, options, cancel, &mut progress)
                .await?;
        }

        let actual = std::fs::metadata(&partial).map_err(io_err(&partial))?.len();
        if let Some(expected) = options.expected_size {
            if actual != expected {
                log_error!(
                    MODULE,
                    "Size mismatch for {}: got {} bytes, expected {}",
                    request.url,
                    actual,
                    expected
                );
                self.cache.discard_partial(&key);
                return Err(DownloadError::SizeMismatch { expected, actual });
            }
        }
        Ok(partial)
    }

    /// Hash the finished partial file and move it into the cache
    ///
    /// With a declared checksum the digest must match or nothing is stored
    /// and the partial file is discarded. Without one the entry is keyed by
    /// the SHA-256 of the bytes. `staged` is filed as the entry's
    /// decompressed image.
    pub async fn commit(
        &self,
        request: &FetchRequest<'_>,
        staged: Option<StagedImage>,
        cancel: &CancelToken,
        progress: impl FnMut(u64) + Send + 'static,
    ) -> Result<CacheEntry, DownloadError> {
        let key = request.partial_key();
        let partial = self.cache.partial_path(&key);
        let cache = Arc::clone(&self.cache);
        let checksum = request.checksum.cloned();
        let compression = request.compression;
        let worker_cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || match checksum {
            Some(checksum) => cache.store_file(
                &checksum,
                &partial,
                compression,
                staged,
                &worker_cancel,
                progress,
            ),
            None => cache.import_file(
                &partial,
                ChecksumAlgorithm::Sha256,
                compression,
                staged,
                &worker_cancel,
                progress,
            ),
        })
        .await
        .map_err(|e| DownloadError::Hash(format!("store task failed: {}", e)))?;

        match result {
            Ok(entry) => Ok(entry),
            Err(CacheError::DigestMismatch { expected, computed }) => {
                log_error!(
                    MODULE,
                    "Checksum mismatch for {}: expected {}, computed {}",
                    request.url,
                    expected,
                    computed
                );
                self.cache.discard_partial(&key);
                Err(DownloadError::ChecksumMismatch { expected, computed })
            }
            Err(CacheError::Cancelled) => Err(DownloadError::Cancelled {
                bytes_written: self.cache.partial_len(&key),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_http(
        &self,
        url: &str,
        partial: &Path,
        options: &DownloadOptions,
        cancel: &CancelToken,
        progress: &mut impl FnMut(DownloadProgress),
    ) -> Result<(), DownloadError> {
        // The shared client carries the configured connect timeout
        let client = if options.connect_timeout == self.connect_timeout {
            self.client.clone()
        } else {
            build_client(options.connect_timeout)?
        };

        let mut retry = options.retry.handle();
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled {
                    bytes_written: file_len(partial),
                });
            }

            let reason = match attempt(&client, url, partial, options, cancel, progress).await? {
                Attempt::Done => return Ok(()),
                Attempt::Retry(reason) => reason,
            };

            let Some(delay) = retry.next_delay() else {
                log_error!(MODULE, "Giving up on {}: {}", url, reason);
                return Err(DownloadError::Network {
                    reason,
                    attempts: retry.attempts() + 1,
                });
            };

            log_warn!(
                MODULE,
                "Transient failure ({}), retry {} in {} ms",
                reason,
                retry.attempts(),
                delay.as_millis()
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DownloadError::Cancelled { bytes_written: file_len(partial) });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Start offset confirmed by a 206 response
fn range_start(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.strip_prefix("bytes ")?;
    range.split('-').next()?.trim().parse().ok()
}

async fn attempt(
    client: &Client,
    url: &str,
    partial: &Path,
    options: &DownloadOptions,
    cancel: &CancelToken,
    progress: &mut impl FnMut(DownloadProgress),
) -> Result<Attempt, DownloadError> {
    let offset = file_len(partial);

    let mut request = client.get(url);
    if offset > 0 {
        log_info!(MODULE, "Resuming download at {} bytes", offset);
        request = request.header(RANGE, format!("bytes={}-", offset));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(DownloadError::Cancelled { bytes_written: offset });
        }
        sent = tokio::time::timeout(options.read_timeout, request.send()) => match sent {
            Err(_) => return Ok(Attempt::Retry("request timed out".to_string())),
            Ok(Err(e)) => return Ok(Attempt::Retry(format!("request failed: {}", e))),
            Ok(Ok(response)) => response,
        }
    };

    let status = response.status();
    let resume = match status {
        StatusCode::PARTIAL_CONTENT if offset > 0 && range_start(&response) == Some(offset) => {
            true
        }
        StatusCode::PARTIAL_CONTENT => {
            log_warn!(MODULE, "Server answered with an unexpected range, restarting");
            let _ = std::fs::remove_file(partial);
            return Ok(Attempt::Retry("unexpected content range".to_string()));
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            log_warn!(MODULE, "Partial download rejected by server, restarting");
            let _ = std::fs::remove_file(partial);
            return Ok(Attempt::Retry("range not satisfiable".to_string()));
        }
        s if s.is_success() => {
            if offset > 0 {
                log_info!(MODULE, "Server ignored range request, restarting from zero");
            }
            false
        }
        s if is_retryable_status(s) => {
            return Ok(Attempt::Retry(format!("server returned {}", s)));
        }
        s => {
            log_error!(MODULE, "Download failed with status: {}", s);
            return Err(DownloadError::HttpStatus {
                status: s.as_u16(),
                url: url.to_string(),
            });
        }
    };

    let already = if resume { offset } else { 0 };
    let total = response
        .content_length()
        .map(|len| len + already)
        .or(options.expected_size)
        .unwrap_or(0);

    log_info!(
        MODULE,
        "Download size: {} bytes ({:.2} MB)",
        total,
        bytes_to_mb(total)
    );

    let mut file = if resume {
        OpenOptions::new().append(true).open(partial)
    } else {
        File::create(partial)
    }
    .map_err(io_err(partial))?;

    let mut written = already;
    let mut tracker = ProgressTracker::new(
        "Download",
        MODULE,
        total,
        config::logging::DOWNLOAD_LOG_INTERVAL_MB,
    )
    .resume_from(already);
    progress(DownloadProgress {
        bytes_written: written,
        total_bytes: total,
    });

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                file.sync_all().map_err(io_err(partial))?;
                log_info!(MODULE, "Download cancelled at {} bytes, partial kept", written);
                return Err(DownloadError::Cancelled { bytes_written: written });
            }
            next = tokio::time::timeout(options.read_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                file.sync_all().map_err(io_err(partial))?;
                return Ok(Attempt::Retry("read timed out".to_string()));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                file.sync_all().map_err(io_err(partial))?;
                return Ok(Attempt::Retry(format!("body error: {}", e)));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        file.write_all(&chunk).map_err(io_err(partial))?;
        written += chunk.len() as u64;
        tracker.update(chunk.len() as u64);
        progress(DownloadProgress {
            bytes_written: written,
            total_bytes: total,
        });
    }

    file.sync_all().map_err(io_err(partial))?;

    if total > 0 && written < total {
        return Ok(Attempt::Retry(format!(
            "connection closed at {} of {} bytes",
            written, total
        )));
    }

    tracker.finish();
    Ok(Attempt::Done)
}

/// `file://` sources are copied into the partial file
fn copy_local(
    source: &Path,
    partial: &Path,
    cancel: &CancelToken,
    progress: &mut impl FnMut(DownloadProgress),
) -> Result<(), DownloadError> {
    let mut input = File::open(source).map_err(io_err(source))?;
    let total = input.metadata().map_err(io_err(source))?.len();
    let mut output = File::create(partial).map_err(io_err(partial))?;
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled {
                bytes_written: written,
            });
        }
        let n = input.read(&mut buffer).map_err(io_err(source))?;
        if n == 0 {
            break;
        }
        output.write_all(&buffer[..n]).map_err(io_err(partial))?;
        written += n as u64;
        progress(DownloadProgress {
            bytes_written: written,
            total_bytes: total,
        });
    }
    output.sync_all().map_err(io_err(partial))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_key_prefers_checksum() {
        let checksum: Checksum = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            .parse()
            .unwrap();
        let with = FetchRequest {
            url: "https://example.org/a.img.xz",
            checksum: Some(&checksum),
            compression: CompressionKind::Xz,
        };
        assert_eq!(with.partial_key(), checksum.cache_key());

        let without = FetchRequest {
            checksum: None,
            ..with.clone()
        };
        let key = without.partial_key();
        assert!(key.starts_with("url-"));
        assert_eq!(key.len(), 20);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_file_url_is_copied_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.img");
        std::fs::write(&source, b"local image").unwrap();

        let cache = Arc::new(ImageCache::open(dir.path().join("cache")).unwrap());
        let downloader = Downloader::new(Arc::clone(&cache), &DownloadConfig::default()).unwrap();
        let url = format!("file://{}", source.display());
        let request = FetchRequest {
            url: &url,
            checksum: None,
            compression: CompressionKind::None,
        };

        let mut last = None;
        let entry = downloader
            .fetch(&request, &DownloadOptions::default(), &CancelToken::new(), |p| {
                last = Some(p)
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read(&entry.path).unwrap(), b"local image");
        assert_eq!(
            entry.checksum.digest,
            hex::encode(Sha256::digest(b"local image"))
        );
        assert_eq!(last.map(|p| p.bytes_written), Some(11));
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_discards_partial() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.img");
        std::fs::write(&source, b"1234").unwrap();

        let cache = Arc::new(ImageCache::open(dir.path().join("cache")).unwrap());
        let downloader = Downloader::new(Arc::clone(&cache), &DownloadConfig::default()).unwrap();
        let url = format!("file://{}", source.display());
        let request = FetchRequest {
            url: &url,
            checksum: None,
            compression: CompressionKind::None,
        };
        let options = DownloadOptions {
            expected_size: Some(10),
            ..DownloadOptions::default()
        };

        let err = downloader
            .fetch(&request, &options, &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::SizeMismatch {
                expected: 10,
                actual: 4
            }
        ));
        assert_eq!(cache.partial_len(&request.partial_key()), 0);
    }

    #[tokio::test]
    async fn test_declared_checksum_mismatch_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.img");
        std::fs::write(&source, b"tampered image").unwrap();
        let checksum = Checksum::new(
            ChecksumAlgorithm::Sha256,
            &hex::encode(Sha256::digest(b"published image")),
        )
        .unwrap();

        let cache = Arc::new(ImageCache::open(dir.path().join("cache")).unwrap());
        let downloader = Downloader::new(Arc::clone(&cache), &DownloadConfig::default()).unwrap();
        let url = format!("file://{}", source.display());
        let request = FetchRequest {
            url: &url,
            checksum: Some(&checksum),
            compression: CompressionKind::None,
        };

        let err = downloader
            .fetch(&request, &DownloadOptions::default(), &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(cache.lookup(&checksum).is_none());
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.partial_len(&request.partial_key()), 0);
    }
}
