//! Job-level failure taxonomy
//!
//! Component errors are folded into a [`JobError`] at the orchestrator
//! boundary. The kind decides the remediation shown to the user.

use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::decompress::DecompressError;
use crate::devices::DeviceError;
use crate::download::DownloadError;
use crate::flash::WriteError;
use crate::settings::SettingsError;
use crate::verify::VerifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    ChecksumMismatch,
    Decompression,
    DeviceNotFound,
    DeviceBusy,
    /// Write guard refused the device before touching it
    DeviceRejected,
    WriteFailed { bytes_written: u64 },
    InvalidSettings,
    Cache,
    Cancelled,
}

/// What the user should do before trying again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    Redownload,
    RecheckDevice,
    ReformatDevice,
    FixSettings,
    None,
}

impl Remediation {
    pub fn hint(self) -> &'static str {
        match self {
            Remediation::Redownload => "download the image again",
            Remediation::RecheckDevice => "check that the card is inserted and not in use",
            Remediation::ReformatDevice => "the card is now unusable until it is reformatted",
            Remediation::FixSettings => "correct the install settings",
            Remediation::None => "",
        }
    }
}

impl FailureKind {
    pub fn remediation(self) -> Remediation {
        match self {
            FailureKind::Network | FailureKind::ChecksumMismatch | FailureKind::Decompression => {
                Remediation::Redownload
            }
            FailureKind::DeviceNotFound
            | FailureKind::DeviceBusy
            | FailureKind::DeviceRejected => Remediation::RecheckDevice,
            FailureKind::WriteFailed { .. } => Remediation::ReformatDevice,
            FailureKind::InvalidSettings => Remediation::FixSettings,
            FailureKind::Cache | FailureKind::Cancelled => Remediation::None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{reason}")]
pub struct JobError {
    pub kind: FailureKind,
    pub reason: String,
}

impl JobError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled by user")
    }

    pub fn remediation(&self) -> Remediation {
        self.kind.remediation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl From<DownloadError> for JobError {
    fn from(err: DownloadError) -> Self {
        let kind = match &err {
            DownloadError::Cancelled { .. } => FailureKind::Cancelled,
            DownloadError::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            DownloadError::Cache(inner) => cache_failure(inner),
            DownloadError::Io { .. } => FailureKind::Cache,
            _ => FailureKind::Network,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<DecompressError> for JobError {
    fn from(err: DecompressError) -> Self {
        let kind = match &err {
            DecompressError::Cancelled => FailureKind::Cancelled,
            DecompressError::Cache(inner) => cache_failure(inner),
            _ => FailureKind::Decompression,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<VerifyError> for JobError {
    fn from(err: VerifyError) -> Self {
        let kind = match &err {
            VerifyError::Cancelled => FailureKind::Cancelled,
            VerifyError::Io { .. } => FailureKind::Cache,
        };
        JobError::new(kind, err.to_string())
    }
}

fn cache_failure(err: &CacheError) -> FailureKind {
    match err {
        CacheError::DigestMismatch { .. } => FailureKind::ChecksumMismatch,
        CacheError::Cancelled => FailureKind::Cancelled,
        _ => FailureKind::Cache,
    }
}

impl From<CacheError> for JobError {
    fn from(err: CacheError) -> Self {
        JobError::new(cache_failure(&err), err.to_string())
    }
}

impl From<DeviceError> for JobError {
    fn from(err: DeviceError) -> Self {
        let kind = match &err {
            DeviceError::NotFound(_) | DeviceError::Unsupported(_) => FailureKind::DeviceNotFound,
            _ => FailureKind::DeviceBusy,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<WriteError> for JobError {
    fn from(err: WriteError) -> Self {
        let kind = match &err {
            WriteError::NotRemovable(_) | WriteError::ImageTooLarge { .. } => {
                FailureKind::DeviceRejected
            }
            WriteError::Open { .. } | WriteError::InvalidState(_) => FailureKind::DeviceBusy,
            WriteError::Failed { bytes_written, .. } => FailureKind::WriteFailed {
                bytes_written: *bytes_written,
            },
            WriteError::Cancelled { .. } => FailureKind::Cancelled,
        };
        JobError::new(kind, err.to_string())
    }
}

impl From<SettingsError> for JobError {
    fn from(err: SettingsError) -> Self {
        JobError::new(FailureKind::InvalidSettings, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_failure_needs_reformat() {
        let err: JobError = WriteError::Failed {
            reason: "EIO".to_string(),
            bytes_written: 4096,
        }
        .into();
        assert_eq!(err.kind, FailureKind::WriteFailed { bytes_written: 4096 });
        assert_eq!(err.remediation(), Remediation::ReformatDevice);
    }

    #[test]
    fn test_guard_refusal_is_not_a_write_failure() {
        let err: JobError = WriteError::NotRemovable("sda".to_string()).into();
        assert_eq!(err.kind, FailureKind::DeviceRejected);
        assert_eq!(err.remediation(), Remediation::RecheckDevice);
    }

    #[test]
    fn test_download_errors_map_to_redownload() {
        let err: JobError = DownloadError::HttpStatus {
            status: 404,
            url: "http://x".to_string(),
        }
        .into();
        assert_eq!(err.kind, FailureKind::Network);
        assert_eq!(err.remediation(), Remediation::Redownload);

        let cancelled: JobError = DownloadError::Cancelled { bytes_written: 3 }.into();
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_rejected_content_is_a_checksum_mismatch() {
        let err: JobError = DownloadError::Cache(CacheError::DigestMismatch {
            expected: "aa".to_string(),
            computed: "bb".to_string(),
        })
        .into();
        assert_eq!(err.kind, FailureKind::ChecksumMismatch);
        assert_eq!(err.remediation(), Remediation::Redownload);

        let cancelled: JobError = CacheError::Cancelled.into();
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_device_errors() {
        let err: JobError = DeviceError::NotFound("card".to_string()).into();
        assert_eq!(err.kind, FailureKind::DeviceNotFound);
        let err: JobError = DeviceError::Busy("card".to_string()).into();
        assert_eq!(err.kind, FailureKind::DeviceBusy);
    }
}
