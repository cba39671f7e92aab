//! Image catalog
//!
//! Read-only registry of [`ImageDescriptor`]s, loaded from a local JSON
//! file and/or a remote JSON registry. Local entries win on id clashes.

mod filters;
mod models;

pub use filters::{families, filter_images, supports_model};
pub use models::{Checksum, ChecksumAlgorithm, CompressionKind, ImageDescriptor};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config;
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "images";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to fetch catalog: {0}")]
    Fetch(String),
    #[error("Invalid catalog entry: {0}")]
    Invalid(String),
    #[error("Duplicate image id in catalog: {0}")]
    Duplicate(String),
}

/// Accepts either a bare array or `{"images": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<ImageDescriptor>),
    Wrapped { images: Vec<ImageDescriptor> },
}

impl CatalogDocument {
    fn into_images(self) -> Vec<ImageDescriptor> {
        match self {
            CatalogDocument::List(images) => images,
            CatalogDocument::Wrapped { images } => images,
        }
    }
}

/// Immutable image registry
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    images: Vec<ImageDescriptor>,
}

impl Catalog {
    pub fn new(images: Vec<ImageDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for image in &images {
            image.validate().map_err(CatalogError::Invalid)?;
            if !seen.insert(image.id.clone()) {
                return Err(CatalogError::Duplicate(image.id.clone()));
            }
        }
        Ok(Self { images })
    }

    pub fn parse(json: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Self::new(document.into_images())
    }

    pub fn load_file(path: &Path) -> Result<Self, CatalogError> {
        log_info!(MODULE, "Loading catalog from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::parse(&content)?;
        log_info!(MODULE, "Loaded {} images from file", catalog.len());
        Ok(catalog)
    }

    /// Fetch a remote JSON registry
    pub async fn fetch_remote(url: &str) -> Result<Self, CatalogError> {
        log_info!(MODULE, "Fetching catalog from {}", url);

        let client = reqwest::Client::builder()
            .user_agent(config::app::USER_AGENT)
            .connect_timeout(Duration::from_secs(config::download::CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CatalogError::Fetch(format!("Failed to create HTTP client: {}", e)))?;

        let response = client.get(url).send().await.map_err(|e| {
            log_error!(MODULE, "Failed to fetch catalog: {}", e);
            CatalogError::Fetch(e.to_string())
        })?;

        if !response.status().is_success() {
            return Err(CatalogError::Fetch(format!(
                "Catalog request failed with status: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::Fetch(format!("Failed to read catalog: {}", e)))?;
        let catalog = Self::parse(&body)?;
        log_info!(MODULE, "Fetched {} images from registry", catalog.len());
        Ok(catalog)
    }

    /// Load the configured sources. A failing remote source is logged and
    /// skipped when a local catalog is available.
    pub async fn load(
        local: Option<&Path>,
        remote_url: Option<&str>,
    ) -> Result<Self, CatalogError> {
        let local = match local {
            Some(path) => Some(Self::load_file(path)?),
            None => None,
        };

        let remote = match remote_url {
            Some(url) => match Self::fetch_remote(url).await {
                Ok(catalog) => Some(catalog),
                Err(e) if local.is_some() => {
                    log_warn!(MODULE, "Remote catalog unavailable, using local only: {}", e);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        match (local, remote) {
            (Some(local), Some(remote)) => Ok(local.merged_with(remote)),
            (Some(local), None) => Ok(local),
            (None, Some(remote)) => Ok(remote),
            (None, None) => {
                log_warn!(MODULE, "No catalog source configured");
                Ok(Self::default())
            }
        }
    }

    /// Merge `other` into `self`; entries already present in `self` win
    pub fn merged_with(mut self, other: Catalog) -> Catalog {
        let known: HashSet<String> = self.images.iter().map(|i| i.id.clone()).collect();
        for image in other.images {
            if known.contains(&image.id) {
                log_debug!(MODULE, "Local entry overrides remote image {}", image.id);
            } else {
                self.images.push(image);
            }
        }
        self
    }

    pub fn find(&self, id: &str) -> Option<&ImageDescriptor> {
        self.images.iter().find(|i| i.id == id)
    }

    pub fn images(&self) -> &[ImageDescriptor] {
        &self.images
    }

    pub fn for_model(&self, model: Option<&str>) -> Vec<&ImageDescriptor> {
        filter_images(&self.images, model, None)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Fetch a `.sha` sidecar and parse the checksum it declares
pub async fn fetch_sidecar_checksum(
    client: &reqwest::Client,
    sha_url: &str,
) -> Result<Checksum, String> {
    log_debug!(MODULE, "Fetching checksum from: {}", sha_url);

    let response = client
        .get(sha_url)
        .send()
        .await
        .map_err(|e| format!("Failed to fetch SHA: {}", e))?;

    if !response.status().is_success() {
        return Err(format!(
            "SHA fetch failed with status: {}",
            response.status()
        ));
    }

    let content = response
        .text()
        .await
        .map_err(|e| format!("Failed to read SHA response: {}", e))?;

    let checksum = Checksum::from_sidecar(&content)?;
    log_debug!(MODULE, "Expected checksum: {}", checksum);
    Ok(checksum)
}
