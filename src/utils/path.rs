//! Path utility functions

use std::path::Path;

/// Compression extensions recognised on image file names
pub const COMPRESSION_EXTS: &[&str] = &[".xz", ".gz", ".bz2", ".zst", ".zip"];

/// Strip compression extension from filename (.xz, .gz, .bz2, .zst, .zip)
///
/// Returns the original name if there is no compression extension.
pub fn strip_compression_ext(filename: &str) -> &str {
    let lower = filename.to_ascii_lowercase();
    for ext in COMPRESSION_EXTS {
        if lower.ends_with(ext) {
            return &filename[..filename.len() - ext.len()];
        }
    }
    filename
}

/// Last path segment of a URL, ignoring any query string
pub fn filename_from_url(url: &str) -> Option<&str> {
    let url_path = url.split(['?', '#']).next().unwrap_or(url);
    url_path.rsplit('/').next().filter(|s| !s.is_empty())
}

/// True if `path` resolves to a location inside `root`
///
/// Both paths are canonicalized so symlinks cannot escape the root.
pub fn is_within(root: &Path, path: &Path) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so the name is safe as a file name
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
