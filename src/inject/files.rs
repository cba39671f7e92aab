//! File helpers for the boot partition
//!
//! Every write goes to a temp sibling first and is renamed into place, so a
//! card pulled mid-write never holds a truncated config file.

use std::io::Write;
use std::path::{Path, PathBuf};

use super::DomainError;

/// Staging directory on the boot partition for files `firstrun.sh` consumes
pub const STAGING_DIR: &str = "flashkit";

pub fn staged(boot: &Path, relative: &str) -> PathBuf {
    boot.join(STAGING_DIR).join(relative)
}

pub fn write_atomic(path: &Path, contents: &str) -> Result<(), DomainError> {
    let io_err = |source| DomainError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

/// Restrict to owner read/write where the filesystem keeps modes
pub fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // FAT has no modes; the copy made on first boot is chmodded instead
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

pub fn read_optional(path: &Path) -> Result<String, DomainError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(DomainError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// One `config.txt` setting
///
/// `key` may itself contain `=` to pin a single parameter such as
/// `dtparam=spi`; a `None` value renders the key alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    pub key: String,
    pub value: Option<String>,
}

impl ConfigLine {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn bare(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    fn render(&self) -> String {
        match &self.value {
            Some(v) => format!("{}={}", self.key, v),
            None => self.key.clone(),
        }
    }

    fn matches(&self, line: &str) -> bool {
        let line = line.trim();
        line == self.key
            || line
                .strip_prefix(self.key.as_str())
                .is_some_and(|rest| rest.starts_with('='))
    }
}

/// Merge settings into `config.txt` text
///
/// Existing keys are replaced in place; new ones are appended under an
/// `[all]` section so they apply regardless of earlier conditional filters.
pub fn merge_config_txt(existing: &str, lines: &[ConfigLine]) -> String {
    let mut out: Vec<String> = existing.lines().map(str::to_string).collect();
    let mut pending = Vec::new();

    for entry in lines {
        let found = out
            .iter_mut()
            .find(|l| !l.trim_start().starts_with('#') && entry.matches(l));
        match found {
            Some(line) => *line = entry.render(),
            None => pending.push(entry.render()),
        }
    }

    if !pending.is_empty() {
        let last_section = out
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| l.starts_with('[') && l.ends_with(']'));
        if last_section.is_some_and(|s| s != "[all]") {
            if out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push(String::new());
            }
            out.push("[all]".to_string());
        }
        out.extend(pending);
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

pub fn apply_config_txt(boot: &Path, lines: &[ConfigLine]) -> Result<(), DomainError> {
    let path = boot.join("config.txt");
    let existing = read_optional(&path)?;
    write_atomic(&path, &merge_config_txt(&existing, lines))
}

/// Append kernel arguments to the single-line `cmdline.txt`
///
/// Tokens already present are left alone.
pub fn apply_cmdline(boot: &Path, tokens: &[String]) -> Result<(), DomainError> {
    let path = boot.join("cmdline.txt");
    let existing = read_optional(&path)?;
    let mut words: Vec<String> = existing.split_whitespace().map(str::to_string).collect();
    for token in tokens {
        if !words.iter().any(|w| w == token) {
            words.push(token.clone());
        }
    }
    write_atomic(&path, &format!("{}\n", words.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_replaces_in_place_and_appends_under_all() {
        let existing = "# comment\ngpu_mem=64\n[pi4]\narm_boost=1\n";
        let merged = merge_config_txt(
            existing,
            &[
                ConfigLine::new("gpu_mem", "128"),
                ConfigLine::new("dtparam=spi", "on"),
            ],
        );
        assert_eq!(
            merged,
            "# comment\ngpu_mem=128\n[pi4]\narm_boost=1\n\n[all]\ndtparam=spi=on\n"
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let lines = [
            ConfigLine::new("enable_uart", "1"),
            ConfigLine::bare("dtoverlay=w1-gpio"),
        ];
        let once = merge_config_txt("", &lines);
        assert_eq!(once, "enable_uart=1\ndtoverlay=w1-gpio\n");
        assert_eq!(merge_config_txt(&once, &lines), once);
    }

    #[test]
    fn test_key_prefix_does_not_match_longer_key() {
        let merged = merge_config_txt("gpu_mem_1024=256\n", &[ConfigLine::new("gpu_mem", "64")]);
        assert!(merged.contains("gpu_mem_1024=256"));
        assert!(merged.contains("gpu_mem=64"));
    }

    #[test]
    fn test_cmdline_appends_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cmdline.txt"), "root=/dev/mmcblk0p2 rootwait\n").unwrap();
        let tokens = vec!["console=serial0,115200".to_string()];
        apply_cmdline(dir.path(), &tokens).unwrap();
        apply_cmdline(dir.path(), &tokens).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cmdline.txt")).unwrap(),
            "root=/dev/mmcblk0p2 rootwait console=serial0,115200\n"
        );
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = staged(dir.path(), "a/b.conf");
        write_atomic(&path, "x=1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x=1\n");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
