//! Hostname, locale, timezone, keyboard and interface toggles

use std::fmt::Write as _;
use std::path::Path;

use super::files::{apply_config_txt, staged, write_atomic, ConfigLine};
use super::DomainError;
use crate::settings::{self, InterfaceToggles, SystemSettings};

pub(super) fn apply(boot: &Path, system: &SystemSettings) -> Result<(), DomainError> {
    let issues = settings::system_issues(system);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }

    let mut conf = String::new();
    for (key, value) in [
        ("hostname", &system.hostname),
        ("locale", &system.locale),
        ("timezone", &system.timezone),
        ("keymap", &system.keyboard_layout),
    ] {
        if let Some(value) = value {
            let _ = writeln!(conf, "{}={}", key, value);
        }
    }
    if !conf.is_empty() {
        write_atomic(&staged(boot, "system.conf"), &conf)?;
    }

    let lines = interface_lines(&system.interfaces);
    if !lines.is_empty() {
        apply_config_txt(boot, &lines)?;
    }
    Ok(())
}

/// `config.txt` lines enabling the requested interfaces
fn interface_lines(toggles: &InterfaceToggles) -> Vec<ConfigLine> {
    let mut lines = Vec::new();
    if toggles.i2c {
        lines.push(ConfigLine::new("dtparam=i2c_arm", "on"));
    }
    if toggles.spi {
        lines.push(ConfigLine::new("dtparam=spi", "on"));
    }
    if toggles.serial {
        lines.push(ConfigLine::new("enable_uart", "1"));
    }
    if toggles.camera {
        lines.push(ConfigLine::new("camera_auto_detect", "1"));
    }
    if toggles.onewire {
        lines.push(ConfigLine::bare("dtoverlay=w1-gpio"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_conf_and_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let system = SystemSettings {
            hostname: Some("lab-pi".to_string()),
            timezone: Some("Europe/Berlin".to_string()),
            interfaces: InterfaceToggles {
                spi: true,
                onewire: true,
                ..Default::default()
            },
            ..Default::default()
        };
        apply(dir.path(), &system).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("flashkit/system.conf")).unwrap(),
            "hostname=lab-pi\ntimezone=Europe/Berlin\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("config.txt")).unwrap(),
            "dtparam=spi=on\ndtoverlay=w1-gpio\n"
        );
    }

    #[test]
    fn test_bad_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let system = SystemSettings {
            hostname: Some("has space".to_string()),
            ..Default::default()
        };
        assert!(matches!(apply(dir.path(), &system), Err(DomainError::Invalid(_))));
    }
}
