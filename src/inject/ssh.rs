//! SSH service toggle and key material

use std::path::Path;

use super::files::{restrict_permissions, staged, write_atomic};
use super::DomainError;
use crate::settings::{self, SshSettings};

/// Marker read by the image's first-boot service to enable sshd
pub const SSH_MARKER: &str = "ssh";

pub(super) fn apply(boot: &Path, ssh: &SshSettings) -> Result<(), DomainError> {
    let issues = settings::ssh_issues(ssh);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }

    let marker = boot.join(SSH_MARKER);
    if !ssh.enabled {
        if marker.exists() {
            std::fs::remove_file(&marker).map_err(|source| DomainError::Io {
                path: marker.clone(),
                source,
            })?;
        }
        return Ok(());
    }

    write_atomic(&marker, "")?;

    if !ssh.authorized_keys.is_empty() {
        let path = staged(boot, "ssh/authorized_keys");
        let mut keys = ssh
            .authorized_keys
            .iter()
            .map(|k| k.trim())
            .collect::<Vec<_>>()
            .join("\n");
        keys.push('\n');
        write_atomic(&path, &keys)?;
        restrict_permissions(&path);
    }

    write_atomic(&staged(boot, "ssh/sshd_config"), &render_sshd_config(ssh))
}

fn render_sshd_config(ssh: &SshSettings) -> String {
    format!(
        "Port {}\nPasswordAuthentication {}\nPubkeyAuthentication yes\n",
        ssh.port,
        if ssh.password_auth { "yes" } else { "no" }
    )
}
