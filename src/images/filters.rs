//! Catalog filtering
//!
//! Narrow the image list for a device picker.

use crate::utils::normalize_slug;

use super::models::ImageDescriptor;

/// True if `image` declares support for `model` (or declares no models at all)
pub fn supports_model(image: &ImageDescriptor, model: &str) -> bool {
    if image.devices.is_empty() {
        return true;
    }
    let wanted = normalize_slug(model);
    image
        .devices
        .iter()
        .any(|d| normalize_slug(d) == wanted)
}

/// Filter images by optional device model and OS family, sorted by name
pub fn filter_images<'a>(
    images: &'a [ImageDescriptor],
    model: Option<&str>,
    family: Option<&str>,
) -> Vec<&'a ImageDescriptor> {
    let mut filtered: Vec<&ImageDescriptor> = images
        .iter()
        .filter(|img| model.map_or(true, |m| supports_model(img, m)))
        .filter(|img| family.map_or(true, |f| img.family.eq_ignore_ascii_case(f)))
        .collect();

    filtered.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    filtered
}

/// Distinct OS families, sorted
pub fn families(images: &[ImageDescriptor]) -> Vec<String> {
    let mut families: Vec<String> = images.iter().map(|i| i.family.to_lowercase()).collect();
    families.sort();
    families.dedup();
    families
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::CompressionKind;

    fn image(id: &str, name: &str, family: &str, devices: &[&str]) -> ImageDescriptor {
        ImageDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            family: family.to_string(),
            url: format!("https://example.invalid/{}.img", id),
            checksum: None,
            checksum_url: None,
            size: None,
            download_size: None,
            compression: CompressionKind::None,
            devices: devices.iter().map(|d| d.to_string()).collect(),
            description: None,
            release_date: None,
        }
    }

    #[test]
    fn test_filter_by_model() {
        let images = vec![
            image("b", "Bookworm", "debian", &["Raspberry Pi 4"]),
            image("a", "Any Board", "ubuntu", &[]),
            image("c", "Zero Only", "debian", &["pi-zero"]),
        ];

        let ids: Vec<&str> = filter_images(&images, Some("raspberry-pi-4"), None)
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let debian = filter_images(&images, None, Some("Debian"));
        assert_eq!(debian.len(), 2);
        assert_eq!(families(&images), vec!["debian", "ubuntu"]);
    }
}
