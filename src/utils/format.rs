//! Formatting helpers for human-readable output

/// Bytes per megabyte
pub const MB: u64 = 1024 * 1024;
/// Bytes per gigabyte
pub const GB: u64 = 1024 * 1024 * 1024;

#[inline]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB as f64
}

/// Format bytes into a size string such as "1.5 GB" or "256 MB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Integer percentage of `done` over `total`, clamped to 0..=100
///
/// An unknown total (0) reports 0.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Lowercase slug used to compare device model names
pub fn normalize_slug(slug: &str) -> String {
    slug.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
