//! Config injector
//!
//! Writes first-boot configuration onto the boot partition of a freshly
//! flashed card. Each settings domain is applied independently: one failing
//! domain is reported and the others still run. Nothing here touches the
//! network.

mod boot;
mod files;
mod firstrun;
mod network;
mod packages;
mod scripts;
mod ssh;
mod system;
mod users;

pub use boot::SERIAL_CONSOLE;
pub use files::STAGING_DIR;
pub use firstrun::FIRSTRUN_SCRIPT;
pub use ssh::SSH_MARKER;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::devices::{DeviceDescriptor, DeviceEnumerator, DeviceError};
use crate::settings::{format_issues, InstallSettings, SettingsDomain, SettingsIssue};
use crate::{log_error, log_info, log_warn};

const MODULE: &str = "inject";

/// Failure of one settings domain
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{}", format_issues(.0))]
    Invalid(Vec<SettingsIssue>),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failures that stop every domain
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("Boot partition unavailable: {0}")]
    Mount(#[from] DeviceError),
    #[error("Boot partition at {path} is not writable: {source}")]
    ReadOnly {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainFailure {
    pub domain: SettingsDomain,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InjectReport {
    pub applied: Vec<SettingsDomain>,
    pub failed: Vec<DomainFailure>,
}

impl InjectReport {
    /// Every requested domain landed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_domains(&self) -> Vec<SettingsDomain> {
        self.failed.iter().map(|f| f.domain).collect()
    }

    fn record(&mut self, domain: SettingsDomain, result: Result<(), DomainError>) {
        match result {
            Ok(()) => {
                log_info!(MODULE, "Applied {} settings", domain);
                self.applied.push(domain);
            }
            Err(e) => {
                log_warn!(MODULE, "Failed to apply {} settings: {}", domain, e);
                self.failed.push(DomainFailure {
                    domain,
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Applies [`InstallSettings`] to a device's boot partition
pub struct ConfigInjector<'a> {
    enumerator: &'a dyn DeviceEnumerator,
}

impl<'a> ConfigInjector<'a> {
    pub fn new(enumerator: &'a dyn DeviceEnumerator) -> Self {
        Self { enumerator }
    }

    /// Mount the boot partition, apply every domain, release the mount
    pub fn apply(
        &self,
        device: &DeviceDescriptor,
        settings: &InstallSettings,
    ) -> Result<InjectReport, InjectError> {
        // The kernel may still hold the old partition table
        if let Err(e) = self.enumerator.reread_partitions(device) {
            log_warn!(MODULE, "Partition re-read failed on {}: {}", device.id, e);
        }

        let mount = self.enumerator.mount_boot(device)?;
        log_info!(
            MODULE,
            "Boot partition of {} mounted at {}",
            device.id,
            mount.path.display()
        );

        let result = apply_to_dir(&mount.path, settings);

        if let Err(e) = self.enumerator.sync(device) {
            log_warn!(MODULE, "Sync after configuration failed: {}", e);
        }
        if let Err(e) = self.enumerator.release_boot(&mount) {
            log_warn!(MODULE, "Failed to release boot mount: {}", e);
        }
        result
    }
}

/// Apply `settings` to an already-mounted boot partition
pub fn apply_to_dir(boot: &Path, settings: &InstallSettings) -> Result<InjectReport, InjectError> {
    check_writable(boot)?;

    let mut report = InjectReport::default();
    if let Some(network) = &settings.network {
        report.record(SettingsDomain::Network, network::apply(boot, network));
    }
    if let Some(ssh) = &settings.ssh {
        report.record(SettingsDomain::Ssh, ssh::apply(boot, ssh));
    }
    if let Some(system) = &settings.system {
        report.record(SettingsDomain::System, system::apply(boot, system));
    }
    if !settings.users.is_empty() {
        report.record(SettingsDomain::Users, users::apply(boot, &settings.users));
    }
    if let Some(scripts) = &settings.scripts {
        report.record(SettingsDomain::Scripts, scripts::apply(boot, scripts));
    }
    if let Some(packages) = &settings.packages {
        report.record(SettingsDomain::Packages, packages::apply(boot, packages));
    }
    if let Some(boot_settings) = &settings.boot {
        report.record(SettingsDomain::Boot, boot::apply(boot, boot_settings));
    }

    // Boot-only tweaks are read by the firmware; no first-boot script needed
    let needs_firstrun = report.applied.iter().any(|d| *d != SettingsDomain::Boot);
    if needs_firstrun {
        let applied = report.applied.clone();
        report.record(SettingsDomain::FirstRun, firstrun::apply(boot, &applied));
    }

    if report.is_complete() {
        log_info!(MODULE, "Configuration applied: {} domain(s)", report.applied.len());
    } else {
        log_error!(
            MODULE,
            "Configuration partially failed: {} applied, {} failed",
            report.applied.len(),
            report.failed.len()
        );
    }
    Ok(report)
}

fn check_writable(boot: &Path) -> Result<(), InjectError> {
    let probe = boot.join(".flashkit-write-test");
    std::fs::write(&probe, b"")
        .and_then(|_| std::fs::remove_file(&probe))
        .map_err(|source| InjectError::ReadOnly {
            path: boot.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockEnumerator;
    use crate::settings::{NetworkSettings, SecurityMode, SshSettings, WifiNetwork};

    fn lab_settings() -> InstallSettings {
        InstallSettings {
            network: Some(NetworkSettings {
                primary: WifiNetwork {
                    ssid: "Lab".to_string(),
                    password: Some("labpassword".to_string()),
                    security_mode: SecurityMode::Wpa3Personal,
                    ..Default::default()
                },
                ..Default::default()
            }),
            ssh: Some(SshSettings {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_through_mock_mount() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path()).unwrap();
        let device = mock.add_device("card", 4096, true).unwrap();

        let report = ConfigInjector::new(&mock)
            .apply(&device, &lab_settings())
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(
            report.applied,
            vec![
                SettingsDomain::Network,
                SettingsDomain::Ssh,
                SettingsDomain::FirstRun
            ]
        );
        let boot = mock.boot_dir("card");
        assert!(boot.join(SSH_MARKER).is_file());
        let keyfile =
            std::fs::read_to_string(boot.join("flashkit/network/Lab.nmconnection")).unwrap();
        assert!(keyfile.contains("key-mgmt=sae"));
        assert!(!mock.refresh_device("card").unwrap().mounted);
    }

    #[test]
    fn test_one_bad_domain_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = lab_settings();
        if let Some(network) = settings.network.as_mut() {
            network.primary.ssid = String::new();
        }

        let report = apply_to_dir(dir.path(), &settings).unwrap();
        assert_eq!(report.failed_domains(), vec![SettingsDomain::Network]);
        assert!(report.applied.contains(&SettingsDomain::Ssh));
        assert!(report.applied.contains(&SettingsDomain::FirstRun));
        assert!(dir.path().join(SSH_MARKER).is_file());
    }

    #[test]
    fn test_empty_settings_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let report = apply_to_dir(dir.path(), &InstallSettings::default()).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_mount_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path()).unwrap();
        let device = mock.add_device("card", 4096, true).unwrap();
        mock.eject("card").unwrap();
        assert!(matches!(
            ConfigInjector::new(&mock).apply(&device, &lab_settings()),
            Err(InjectError::Mount(_))
        ));
    }
}
