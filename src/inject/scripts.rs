//! Caller-supplied shell scripts

use std::path::Path;

use super::files::{staged, write_atomic};
use super::DomainError;
use crate::settings::ScriptSettings;

pub(super) fn apply(boot: &Path, scripts: &ScriptSettings) -> Result<(), DomainError> {
    for (name, body) in [
        ("pre", &scripts.pre),
        ("post", &scripts.post),
        ("firstboot", &scripts.first_boot),
    ] {
        let Some(body) = body.as_deref().filter(|b| !b.trim().is_empty()) else {
            continue;
        };
        let mut script = String::new();
        if !body.starts_with("#!") {
            script.push_str("#!/bin/bash\n");
        }
        script.push_str(body);
        if !script.ends_with('\n') {
            script.push('\n');
        }
        write_atomic(&staged(boot, &format!("scripts/{}.sh", name)), &script)?;
    }
    Ok(())
}
