//! Verifier
//!
//! Incremental digest computation over fixed-size chunks. Memory use is one
//! chunk buffer regardless of image size.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::config;
use crate::images::{Checksum, ChecksumAlgorithm};
use crate::utils::{CancelToken, ProgressTracker};
use crate::{log_debug, log_error, log_info};

const MODULE: &str = "verify";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Failed to read {path} for hashing: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Verification cancelled")]
    Cancelled,
}

/// Result of comparing a computed digest with the expected one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Mismatch { computed_digest: String },
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok)
    }
}

/// Running hash for one of the supported algorithms
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash up to `limit` bytes of `reader` (all of it when `limit` is None)
///
/// `progress` receives the running byte count after each chunk.
pub fn hash_reader<R: Read>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
    limit: Option<u64>,
    cancel: &CancelToken,
    mut progress: impl FnMut(u64),
) -> std::io::Result<Option<String>> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];
    let mut processed = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let want = match limit {
            Some(limit) if processed >= limit => break,
            Some(limit) => ((limit - processed) as usize).min(buffer.len()),
            None => buffer.len(),
        };

        let n = reader.read(&mut buffer[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        processed += n as u64;
        progress(processed);
    }

    Ok(Some(hasher.finalize_hex()))
}

/// Compute the digest of a file
pub fn compute_digest(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    cancel: &CancelToken,
    mut progress: impl FnMut(u64),
) -> Result<String, VerifyError> {
    let io_err = |source| VerifyError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);
    log_debug!(
        MODULE,
        "Calculating {} of {} ({} bytes)",
        algorithm,
        path.display(),
        total
    );

    let mut tracker = ProgressTracker::new(
        "Hash",
        MODULE,
        total,
        config::logging::VERIFY_LOG_INTERVAL_MB,
    );
    let digest = hash_reader(&mut file, algorithm, None, cancel, |done| {
        tracker.update(done - tracker.processed());
        progress(done);
    })
    .map_err(io_err)?;

    match digest {
        Some(digest) => {
            tracker.finish();
            log_debug!(MODULE, "Calculated {}: {}", algorithm, digest);
            Ok(digest)
        }
        None => {
            log_info!(MODULE, "Hash calculation cancelled");
            Err(VerifyError::Cancelled)
        }
    }
}

/// Verify a file against an expected digest
pub fn verify(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    expected_digest: &str,
    cancel: &CancelToken,
    progress: impl FnMut(u64),
) -> Result<VerifyOutcome, VerifyError> {
    let computed = compute_digest(path, algorithm, cancel, progress)?;

    if computed.eq_ignore_ascii_case(expected_digest.trim()) {
        log_info!(MODULE, "{} verification PASSED", algorithm);
        Ok(VerifyOutcome::Ok)
    } else {
        log_error!(
            MODULE,
            "{} verification FAILED! Expected: {}, Got: {}",
            algorithm,
            expected_digest,
            computed
        );
        Ok(VerifyOutcome::Mismatch {
            computed_digest: computed,
        })
    }
}

/// Verify a file against a declared [`Checksum`]
pub fn verify_checksum(
    path: &Path,
    checksum: &Checksum,
    cancel: &CancelToken,
    progress: impl FnMut(u64),
) -> Result<VerifyOutcome, VerifyError> {
    verify(path, checksum.algorithm, &checksum.digest, cancel, progress)
}

/// Read back the first `len` bytes of a device and compare with the source image
pub fn verify_device(
    source: &Path,
    device_path: &Path,
    len: u64,
    cancel: &CancelToken,
    mut progress: impl FnMut(u64),
) -> Result<VerifyOutcome, VerifyError> {
    log_info!(
        MODULE,
        "Verifying written data on {} ({} bytes)",
        device_path.display(),
        len
    );

    let expected = compute_digest(source, ChecksumAlgorithm::Sha256, cancel, |done| {
        progress(done / 2)
    })?;

    let mut device = File::open(device_path).map_err(|source| VerifyError::Io {
        path: device_path.display().to_string(),
        source,
    })?;
    let actual = hash_reader(
        &mut device,
        ChecksumAlgorithm::Sha256,
        Some(len),
        cancel,
        |done| progress(len / 2 + done / 2),
    )
    .map_err(|source| VerifyError::Io {
        path: device_path.display().to_string(),
        source,
    })?
    .ok_or(VerifyError::Cancelled)?;

    if actual == expected {
        log_info!(MODULE, "Read-back verification PASSED");
        Ok(VerifyOutcome::Ok)
    } else {
        log_error!(MODULE, "Read-back verification FAILED");
        Ok(VerifyOutcome::Mismatch {
            computed_digest: actual,
        })
    }
}
