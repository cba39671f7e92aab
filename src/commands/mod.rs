//! CLI command handlers
//!
//! Each subcommand lives in its own module. Handlers report failures as
//! plain strings; `main` prints them and sets the exit code.

pub mod cache;
pub mod devices;
pub mod images;
pub mod install;
pub mod logs;

use std::path::Path;
use std::sync::Arc;

use flashkit::cache::ImageCache;
use flashkit::config::AppConfig;
use flashkit::devices::mock::MockEnumerator;
use flashkit::devices::{platform_enumerator, DeviceEnumerator};
use flashkit::images::Catalog;
use flashkit::log_info;

const MODULE: &str = "commands";

/// Device backend: file-backed devices under `mock_dir`, else the OS
pub fn open_enumerator(
    config: &AppConfig,
    mock_dir: Option<&Path>,
) -> Result<Arc<dyn DeviceEnumerator>, String> {
    match mock_dir {
        Some(dir) => {
            log_info!(MODULE, "Using file-backed devices in {}", dir.display());
            let mock = MockEnumerator::from_dir(dir).map_err(|e| e.to_string())?;
            Ok(Arc::new(mock))
        }
        None => platform_enumerator(config.platform)
            .map(Arc::from)
            .map_err(|e| e.to_string()),
    }
}

pub fn open_cache(config: &AppConfig) -> Result<Arc<ImageCache>, String> {
    let dir = config.cache_dir();
    ImageCache::open(&dir)
        .map(Arc::new)
        .map_err(|e| format!("Cannot open cache at {}: {}", dir.display(), e))
}

pub async fn load_catalog(config: &AppConfig) -> Result<Catalog, String> {
    Catalog::load(config.catalog_path.as_deref(), config.catalog_url.as_deref())
        .await
        .map_err(|e| e.to_string())
}
