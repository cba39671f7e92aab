//! flashkit - download, verify and flash OS images to SD cards
//!
//! The library drives the whole provisioning pipeline: catalog lookup,
//! cached resumable downloads, decompression, checksum verification,
//! guarded block writes and first-boot configuration injection. The
//! `flashkit` binary is a thin CLI over [`orchestrator::InstallOrchestrator`].

pub mod logging;

pub mod cache;
pub mod config;
pub mod decompress;
pub mod devices;
pub mod download;
pub mod error;
pub mod flash;
pub mod images;
pub mod inject;
pub mod orchestrator;
pub mod settings;
pub mod utils;
pub mod verify;

pub use error::{FailureKind, JobError, Remediation};
pub use orchestrator::{
    ImageSource, InstallOrchestrator, JobHandle, JobOptions, JobOutcome, JobRequest, Stage,
};
pub use settings::InstallSettings;
