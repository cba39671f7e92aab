//! Image data models
//!
//! Catalog descriptors, declared checksums and compression kinds.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hash algorithm of a declared checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Hex digest length
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared checksum: algorithm plus lowercase hex digest
///
/// Parses `"sha256:<hex>"`, `"sha512:<hex>"` or a bare hex digest whose
/// length selects the algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, String> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(format!("Invalid {} digest: {}", algorithm, digest));
        }
        Ok(Self { algorithm, digest })
    }

    /// Directory name of this checksum inside the cache
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.algorithm, self.digest)
    }

    /// Inverse of [`Checksum::cache_key`]
    pub fn from_cache_key(key: &str) -> Option<Self> {
        let (algo, digest) = key.split_once('-')?;
        Checksum::new(ChecksumAlgorithm::from_name(algo)?, digest).ok()
    }

    /// Parse a `.sha` sidecar file: `"<hash>  <filename>"` or `"<hash> *<filename>"`
    pub fn from_sidecar(content: &str) -> Result<Self, String> {
        let hash = content
            .split_whitespace()
            .next()
            .ok_or_else(|| "Invalid SHA file format".to_string())?;
        hash.parse()
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((algo, digest)) = s.split_once(':') {
            let algorithm = ChecksumAlgorithm::from_name(algo)
                .ok_or_else(|| format!("Unsupported checksum algorithm: {}", algo))?;
            return Checksum::new(algorithm, digest);
        }
        match s.len() {
            64 => Checksum::new(ChecksumAlgorithm::Sha256, s),
            128 => Checksum::new(ChecksumAlgorithm::Sha512, s),
            _ => Err(format!("Unrecognised checksum: {}", s)),
        }
    }
}

impl TryFrom<String> for Checksum {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

/// Compression applied to a downloadable image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
    Xz,
    Zip,
    Bzip2,
    Zstd,
}

impl CompressionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Xz => "xz",
            CompressionKind::Zip => "zip",
            CompressionKind::Bzip2 => "bzip2",
            CompressionKind::Zstd => "zstd",
        }
    }

    pub fn is_compressed(self) -> bool {
        self != CompressionKind::None
    }

    /// Guess from a file name extension
    pub fn from_extension(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => CompressionKind::Gzip,
            "xz" => CompressionKind::Xz,
            "zip" => CompressionKind::Zip,
            "bz2" => CompressionKind::Bzip2,
            "zst" | "zstd" => CompressionKind::Zstd,
            _ => CompressionKind::None,
        }
    }

    /// Identify from the leading bytes of a stream
    pub fn from_magic(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            CompressionKind::Gzip
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            CompressionKind::Xz
        } else if header.starts_with(b"PK\x03\x04") {
            CompressionKind::Zip
        } else if header.starts_with(b"BZh") {
            CompressionKind::Bzip2
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            CompressionKind::Zstd
        } else {
            CompressionKind::None
        }
    }

    /// Extension first, then magic bytes
    pub fn detect(path: &Path) -> std::io::Result<Self> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let by_ext = Self::from_extension(name);
        if by_ext.is_compressed() {
            return Ok(by_ext);
        }

        use std::io::Read;
        let mut header = [0u8; 8];
        let mut file = std::fs::File::open(path)?;
        let n = file.read(&mut header)?;
        Ok(Self::from_magic(&header[..n]))
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry for a downloadable OS image. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub id: String,
    pub name: String,
    /// OS family tag, e.g. "debian" or "ubuntu"
    pub family: String,
    pub url: String,
    /// Checksum of the file at `url`
    #[serde(default)]
    pub checksum: Option<Checksum>,
    /// Sidecar `.sha` file used when no inline checksum is declared
    #[serde(default)]
    pub checksum_url: Option<String>,
    /// Declared uncompressed size in bytes
    #[serde(default)]
    pub size: Option<u64>,
    /// Size of the file at `url`
    #[serde(default)]
    pub download_size: Option<u64>,
    #[serde(default)]
    pub compression: CompressionKind,
    /// Supported device models; empty means any
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
}

impl ImageDescriptor {
    /// Check required fields after deserialization
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("image id is empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err(format!("image {} has no name", self.id));
        }
        if !(self.url.starts_with("http://")
            || self.url.starts_with("https://")
            || self.url.starts_with("file://"))
        {
            return Err(format!("image {} has unsupported url {}", self.id, self.url));
        }
        Ok(())
    }
}
