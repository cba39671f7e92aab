//! `config.txt` overrides and serial console

use std::path::Path;

use super::files::{apply_cmdline, apply_config_txt, ConfigLine};
use super::DomainError;
use crate::settings::{self, BootSettings};

pub const SERIAL_CONSOLE: &str = "console=serial0,115200";

pub(super) fn apply(boot: &Path, settings: &BootSettings) -> Result<(), DomainError> {
    let issues = settings::boot_issues(settings);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }

    let mut lines: Vec<ConfigLine> = settings
        .overrides
        .iter()
        .map(|(k, v)| ConfigLine::new(k.as_str(), v.as_str()))
        .collect();
    if let Some(mb) = settings.gpu_mem {
        lines.push(ConfigLine::new("gpu_mem", mb.to_string()));
    }
    if settings.serial_console {
        lines.push(ConfigLine::new("enable_uart", "1"));
    }
    if !lines.is_empty() {
        apply_config_txt(boot, &lines)?;
    }

    if settings.serial_console {
        apply_cmdline(boot, &[SERIAL_CONSOLE.to_string()])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_and_serial_console() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.txt"), "arm_64bit=0\n").unwrap();
        std::fs::write(dir.path().join("cmdline.txt"), "root=PARTUUID=1-02 rootwait\n").unwrap();

        let mut settings = BootSettings {
            gpu_mem: Some(128),
            serial_console: true,
            ..Default::default()
        };
        settings
            .overrides
            .insert("arm_64bit".to_string(), "1".to_string());
        apply(dir.path(), &settings).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("config.txt")).unwrap(),
            "arm_64bit=1\ngpu_mem=128\nenable_uart=1\n"
        );
        assert!(std::fs::read_to_string(dir.path().join("cmdline.txt"))
            .unwrap()
            .ends_with("rootwait console=serial0,115200\n"));
    }
}
