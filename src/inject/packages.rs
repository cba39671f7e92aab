//! Package update and install list

use std::path::Path;

use super::files::{staged, write_atomic};
use super::DomainError;
use crate::settings::{self, PackageSettings};

pub(super) fn apply(boot: &Path, packages: &PackageSettings) -> Result<(), DomainError> {
    let issues = settings::package_issues(packages);
    if !issues.is_empty() {
        return Err(DomainError::Invalid(issues));
    }

    let yes_no = |b: bool| if b { "yes" } else { "no" };
    let conf = format!(
        "UPDATE={}\nUPGRADE={}\nINSTALL=\"{}\"\n",
        yes_no(packages.update || packages.upgrade || !packages.install.is_empty()),
        yes_no(packages.upgrade),
        packages.install.join(" ")
    );
    write_atomic(&staged(boot, "packages.conf"), &conf)
}
