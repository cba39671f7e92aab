//! `flashkit cache`

use clap::Subcommand;

use flashkit::cache::ImageCache;
use flashkit::images::Checksum;
use flashkit::utils::format_size;

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cached images and total size
    Stats,
    /// Remove one cached image
    Evict {
        /// `sha256:<hex>`, `sha512:<hex>` or a bare digest
        checksum: String,
    },
    /// Remove every cached image and partial download
    Clear,
}

pub fn run(cache: &ImageCache, action: CacheAction) -> Result<(), String> {
    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("Cache: {}", cache.root().display());
            println!(
                "{} entries, {}",
                stats.entry_count,
                format_size(stats.total_bytes)
            );

            let mut entries = cache.entries();
            entries.sort_by(|a, b| a.checksum.to_string().cmp(&b.checksum.to_string()));
            for entry in entries {
                let verified = entry
                    .last_verified
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} {:>10} {:<5} verified {}",
                    entry.checksum,
                    format_size(entry.size),
                    entry.compression,
                    verified
                );
            }
        }
        CacheAction::Evict { checksum } => {
            let checksum: Checksum = checksum.parse()?;
            cache.evict(&checksum).map_err(|e| e.to_string())?;
            println!("Evicted {}", checksum);
        }
        CacheAction::Clear => {
            let removed = cache.clear().map_err(|e| e.to_string())?;
            println!("Removed {} cached images", removed);
        }
    }
    Ok(())
}
