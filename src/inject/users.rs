//! User accounts

use std::fmt::Write as _;
use std::path::Path;

use super::files::{restrict_permissions, staged, write_atomic};
use super::DomainError;
use crate::settings::{self, UserAccount};

pub(super) fn apply(boot: &Path, users: &[UserAccount]) -> Result<(), DomainError> {
    let issues = settings::user_issues(users);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }
    let Some(first) = users.first() else {
        return Ok(());
    };

    // Read natively by Raspberry Pi OS to rename the default account
    let userconf = boot.join("userconf.txt");
    write_atomic(&userconf, &format!("{}:{}\n", first.username, first.password_hash))?;
    restrict_permissions(&userconf);

    let mut conf = String::new();
    for user in users {
        let _ = writeln!(
            conf,
            "{}:{}:{}:{}",
            user.username,
            user.password_hash,
            if user.sudo { 1 } else { 0 },
            user.groups.join(",")
        );
    }
    let path = staged(boot, "users.conf");
    write_atomic(&path, &conf)?;
    restrict_permissions(&path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_written() {
        let dir = tempfile::tempdir().unwrap();
        let users = vec![
            UserAccount {
                username: "pi".to_string(),
                password_hash: "$6$salt$hash".to_string(),
                sudo: true,
                groups: vec!["video".to_string(), "gpio".to_string()],
            },
            UserAccount {
                username: "guest".to_string(),
                password_hash: "$y$j9T$salt$hash".to_string(),
                ..Default::default()
            },
        ];
        apply(dir.path(), &users).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("userconf.txt")).unwrap(),
            "pi:$6$salt$hash\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("flashkit/users.conf")).unwrap(),
            "pi:$6$salt$hash:1:video,gpio\nguest:$y$j9T$salt$hash:0:\n"
        );
    }
}
