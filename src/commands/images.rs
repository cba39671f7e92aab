//! `flashkit images`

use flashkit::config::AppConfig;
use flashkit::images::{families, filter_images};
use flashkit::log_debug;
use flashkit::utils::format_size;

const MODULE: &str = "commands::images";

pub async fn list(
    config: &AppConfig,
    model: Option<&str>,
    family: Option<&str>,
) -> Result<(), String> {
    let catalog = super::load_catalog(config).await?;
    let images = filter_images(catalog.images(), model, family);
    log_debug!(
        MODULE,
        "{} of {} images match (families: {})",
        images.len(),
        catalog.len(),
        families(catalog.images()).join(", ")
    );

    if images.is_empty() {
        println!("No matching images");
        return Ok(());
    }

    println!("{:<28} {:<40} {:<10} SIZE", "ID", "NAME", "FAMILY");
    for image in images {
        let size = image
            .size
            .or(image.download_size)
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<40} {:<10} {}",
            image.id, image.name, image.family, size
        );
    }
    Ok(())
}
