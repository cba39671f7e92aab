//! System helpers

use std::path::PathBuf;

/// Platform cache directory for the application
///
/// Falls back to the temp directory when the platform reports none.
pub fn get_cache_dir(app_name: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(app_name)
}

/// Threads to hand to multi-threaded decoders
///
/// Leaves one core for the writer and the async runtime.
pub fn get_recommended_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).clamp(1, 8))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_threads_bounds() {
        let threads = get_recommended_threads();
        assert!((1..=8).contains(&threads));
    }

    #[test]
    fn test_cache_dir_is_app_scoped() {
        assert!(get_cache_dir("flashkit").ends_with("flashkit"));
    }
}
