//! Image cache
//!
//! Content-addressed store of downloaded images, keyed by checksum. Layout:
//!
//! ```text
//! <root>/<algo>-<hex>/blob          file as downloaded
//! <root>/<algo>-<hex>/image         decompressed sibling (optional)
//! <root>/<algo>-<hex>/entry.json    metadata record
//! <root>/partial/<key>              in-progress downloads
//! <root>/scratch/                   decompressed custom images, one per job
//! ```
//!
//! Blobs are hashed before they are committed, so an entry's content always
//! matches its key. Mutations (`store`, `evict`, ...) are serialized by one
//! lock. Lookups read an immutable snapshot of the index and never block on
//! writers. Jobs producing the same entry coordinate through [`ImageCache::claim`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::{self, cache::*};
use crate::images::{Checksum, ChecksumAlgorithm, CompressionKind};
use crate::utils::{format_size, is_within, sanitize_file_name, CancelToken};
use crate::verify::{self, Hasher, VerifyError};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "cache";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("No cache entry for {0}")]
    NotFound(String),
    #[error("Refusing to touch path outside cache: {0}")]
    OutsideCache(PathBuf),
    #[error("Content does not match {expected}: computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Cache operation cancelled")]
    Cancelled,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One cached image. Replaced, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub checksum: Checksum,
    /// Blob as downloaded
    pub path: PathBuf,
    pub size: u64,
    pub compression: CompressionKind,
    /// Decompressed sibling, if produced
    pub decompressed: Option<PathBuf>,
    pub decompressed_size: Option<u64>,
    /// SHA-256 of the decompressed sibling, recorded when it was produced
    pub decompressed_digest: Option<String>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// The raw image to write: the decompressed sibling, or the blob itself
    /// when it was never compressed
    pub fn raw_image(&self) -> Option<&Path> {
        match (&self.decompressed, self.compression.is_compressed()) {
            (Some(path), _) => Some(path),
            (None, false) => Some(&self.path),
            (None, true) => None,
        }
    }
}

/// A decompressed image waiting to be filed next to its blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub path: PathBuf,
    pub size: u64,
    /// SHA-256 of the decompressed bytes
    pub digest: String,
}

/// On-disk metadata record; paths are derived from the entry directory
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    checksum: Checksum,
    size: u64,
    compression: CompressionKind,
    decompressed_size: Option<u64>,
    #[serde(default)]
    decompressed_digest: Option<String>,
    last_verified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
}

type Index = HashMap<Checksum, CacheEntry>;

/// Content-addressed image cache
#[derive(Debug)]
pub struct ImageCache {
    root: PathBuf,
    snapshot: RwLock<Arc<Index>>,
    write_lock: Mutex<()>,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_incoming: AtomicU64,
}

impl ImageCache {
    /// Open (creating if needed) a cache rooted at `root` and index existing entries
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;

        let mut index = Index::new();
        let entries = std::fs::read_dir(&root).map_err(io_err(&root))?;
        for dir in entries.flatten() {
            let name = dir.file_name().to_string_lossy().to_string();
            let Some(checksum) = Checksum::from_cache_key(&name) else {
                continue;
            };
            match read_record(&dir.path()) {
                Some(entry) if entry.checksum == checksum => {
                    index.insert(checksum, entry);
                }
                _ => {
                    log_warn!(MODULE, "Discarding unreadable cache entry {}", name);
                    let _ = std::fs::remove_dir_all(dir.path());
                }
            }
        }

        log_info!(
            MODULE,
            "Opened cache at {} ({} entries)",
            root.display(),
            index.len()
        );

        Ok(Self {
            root,
            snapshot: RwLock::new(Arc::new(index)),
            write_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            next_incoming: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(checksum.cache_key())
    }

    /// Where an in-progress download for `key` lives
    pub fn partial_path(&self, key: &str) -> PathBuf {
        self.root.join(PARTIAL_DIR).join(sanitize_file_name(key))
    }

    /// Bytes already downloaded for `key`
    pub fn partial_len(&self, key: &str) -> u64 {
        std::fs::metadata(self.partial_path(key))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Directory for decompressed custom images
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    /// Exclusive claim on `key` while its download or decompression runs
    ///
    /// A second job needing the same image waits here and then finds the
    /// finished entry instead of writing the same partial file.
    pub async fn claim(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Slots nobody holds or waits on
            inflight.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(inflight.entry(key.to_string()).or_default())
        };
        slot.lock_owned().await
    }

    fn current(&self) -> Arc<Index> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in a new index. Callers must hold the write lock.
    fn publish(&self, update: impl FnOnce(&mut Index)) {
        let mut next = (*self.current()).clone();
        update(&mut next);
        let next = Arc::new(next);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Look up a checksum. Entries whose files went missing or changed size
    /// are invalidated and reported as a miss.
    pub fn lookup(&self, checksum: &Checksum) -> Option<CacheEntry> {
        let entry = self.current().get(checksum).cloned()?;

        if let Err(reason) = validate_files(&entry) {
            log_warn!(
                MODULE,
                "Cache entry {} is corrupt ({}), invalidating",
                checksum,
                reason
            );
            let _ = self.evict(checksum);
            return None;
        }

        log_debug!(MODULE, "Cache hit for {}", checksum);
        Some(entry)
    }

    /// Move a completed download into the cache after checking its digest
    ///
    /// On mismatch nothing is stored and `source` is left for the caller.
    /// `progress` receives the number of bytes hashed so far.
    pub fn store_file(
        &self,
        checksum: &Checksum,
        source: &Path,
        compression: CompressionKind,
        staged: Option<StagedImage>,
        cancel: &CancelToken,
        progress: impl FnMut(u64),
    ) -> Result<CacheEntry, CacheError> {
        let computed = hash_file(source, checksum.algorithm, cancel, progress)?;
        if computed != checksum.digest {
            log_warn!(
                MODULE,
                "Refusing to store {}: content hashes to {}",
                checksum,
                computed
            );
            return Err(CacheError::DigestMismatch {
                expected: checksum.digest.clone(),
                computed,
            });
        }
        self.install(checksum, source, compression, staged)
    }

    /// Move a completed download into the cache under its own digest
    pub fn import_file(
        &self,
        source: &Path,
        algorithm: ChecksumAlgorithm,
        compression: CompressionKind,
        staged: Option<StagedImage>,
        cancel: &CancelToken,
        progress: impl FnMut(u64),
    ) -> Result<CacheEntry, CacheError> {
        let digest = hash_file(source, algorithm, cancel, progress)?;
        let checksum = Checksum::new(algorithm, &digest).map_err(CacheError::InvalidDigest)?;
        self.install(&checksum, source, compression, staged)
    }

    /// Stream bytes from `reader` into a new cache entry
    ///
    /// The bytes are hashed on the way in; a mismatch stores nothing and
    /// leaves any existing entry for `checksum` untouched.
    pub fn store(
        &self,
        checksum: &Checksum,
        reader: &mut dyn Read,
        compression: CompressionKind,
    ) -> Result<CacheEntry, CacheError> {
        let incoming = self.root.join(PARTIAL_DIR).join(format!(
            "{}.incoming-{}",
            checksum.cache_key(),
            self.next_incoming.fetch_add(1, Ordering::Relaxed)
        ));

        let result = receive(checksum, reader, &incoming)
            .and_then(|()| self.install(checksum, &incoming, compression, None));
        if result.is_err() {
            let _ = std::fs::remove_file(&incoming);
        }
        result
    }

    fn prepare_entry_dir(&self, checksum: &Checksum) -> Result<PathBuf, CacheError> {
        let dir = self.entry_dir(checksum);
        if dir.exists() {
            // A new entry replaces a stale one
            std::fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        }
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    /// File a blob whose digest is already known to match `checksum`
    fn install(
        &self,
        checksum: &Checksum,
        source: &Path,
        compression: CompressionKind,
        staged: Option<StagedImage>,
    ) -> Result<CacheEntry, CacheError> {
        let _guard = self.lock_writes();
        let dir = self.prepare_entry_dir(checksum)?;
        let blob = dir.join(BLOB_FILE);
        move_file(source, &blob)?;

        let mut entry = CacheEntry {
            checksum: checksum.clone(),
            path: blob.clone(),
            size: std::fs::metadata(&blob).map_err(io_err(&blob))?.len(),
            compression,
            decompressed: None,
            decompressed_size: None,
            decompressed_digest: None,
            last_verified: Some(Utc::now()),
        };
        if let Some(staged) = staged {
            let image = dir.join(IMAGE_FILE);
            move_file(&staged.path, &image)?;
            entry.decompressed = Some(image);
            entry.decompressed_size = Some(staged.size);
            entry.decompressed_digest = Some(staged.digest);
        }

        write_record(&dir, &entry)?;
        self.publish(|index| {
            index.insert(checksum.clone(), entry.clone());
        });

        log_info!(
            MODULE,
            "Stored {} ({}, {})",
            checksum,
            format_size(entry.size),
            compression
        );
        Ok(entry)
    }

    /// Path the decompressor should write to for `checksum`
    pub fn decompressed_path(&self, checksum: &Checksum) -> PathBuf {
        self.entry_dir(checksum).join(IMAGE_FILE)
    }

    /// Record a finished decompressed sibling and its SHA-256, replacing the entry
    pub fn attach_decompressed(
        &self,
        checksum: &Checksum,
        digest: String,
    ) -> Result<CacheEntry, CacheError> {
        let _guard = self.lock_writes();
        let current = self
            .current()
            .get(checksum)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(checksum.to_string()))?;

        let image = self.decompressed_path(checksum);
        let size = std::fs::metadata(&image).map_err(io_err(&image))?.len();
        let entry = CacheEntry {
            decompressed: Some(image),
            decompressed_size: Some(size),
            decompressed_digest: Some(digest),
            ..current
        };
        self.replace(entry)
    }

    /// Drop a decompressed sibling that failed verification, keeping the blob
    pub fn discard_decompressed(&self, checksum: &Checksum) -> Result<CacheEntry, CacheError> {
        let _guard = self.lock_writes();
        let current = self
            .current()
            .get(checksum)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(checksum.to_string()))?;

        let image = self.decompressed_path(checksum);
        if image.exists() {
            std::fs::remove_file(&image).map_err(io_err(&image))?;
        }
        log_info!(MODULE, "Discarded decompressed image of {}", checksum);
        self.replace(CacheEntry {
            decompressed: None,
            decompressed_size: None,
            decompressed_digest: None,
            ..current
        })
    }

    /// Record a successful verification time, replacing the entry
    pub fn touch_verified(&self, checksum: &Checksum) -> Result<CacheEntry, CacheError> {
        let _guard = self.lock_writes();
        let current = self
            .current()
            .get(checksum)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(checksum.to_string()))?;
        self.replace(CacheEntry {
            last_verified: Some(Utc::now()),
            ..current
        })
    }

    fn replace(&self, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        write_record(&self.entry_dir(&entry.checksum), &entry)?;
        self.publish(|index| {
            index.insert(entry.checksum.clone(), entry.clone());
        });
        Ok(entry)
    }

    /// Remove an entry and its files. Missing entries are not an error.
    pub fn evict(&self, checksum: &Checksum) -> Result<(), CacheError> {
        let _guard = self.lock_writes();
        let dir = self.entry_dir(checksum);

        if dir.exists() {
            if !is_within(&self.root, &dir) {
                return Err(CacheError::OutsideCache(dir));
            }
            std::fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            log_info!(MODULE, "Evicted {}", checksum);
        }

        self.publish(|index| {
            index.remove(checksum);
        });
        Ok(())
    }

    /// Remove a partial download
    pub fn discard_partial(&self, key: &str) {
        let path = self.partial_path(key);
        if path.exists() {
            log_debug!(MODULE, "Discarding partial download {}", path.display());
            let _ = std::fs::remove_file(path);
        }
    }

    /// Evict everything, including partial downloads and scratch files
    pub fn clear(&self) -> Result<usize, CacheError> {
        let checksums: Vec<Checksum> = self.current().keys().cloned().collect();
        for checksum in &checksums {
            self.evict(checksum)?;
        }
        for dir in [self.root.join(PARTIAL_DIR), self.scratch_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            }
        }
        Ok(checksums.len())
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.current().values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.current();
        CacheStats {
            entry_count: index.len(),
            total_bytes: index
                .values()
                .map(|e| e.size + e.decompressed_size.unwrap_or(0))
                .sum(),
        }
    }
}

fn validate_files(entry: &CacheEntry) -> Result<(), String> {
    let blob_len = std::fs::metadata(&entry.path)
        .map_err(|_| "blob missing".to_string())?
        .len();
    if blob_len != entry.size {
        return Err(format!("blob size {} != {}", blob_len, entry.size));
    }
    if let (Some(image), Some(size)) = (&entry.decompressed, entry.decompressed_size) {
        let image_len = std::fs::metadata(image)
            .map_err(|_| "decompressed image missing".to_string())?
            .len();
        if image_len != size {
            return Err(format!("image size {} != {}", image_len, size));
        }
    }
    Ok(())
}

fn read_record(dir: &Path) -> Option<CacheEntry> {
    let content = std::fs::read_to_string(dir.join(ENTRY_FILE)).ok()?;
    let record: EntryRecord = serde_json::from_str(&content).ok()?;
    // A sibling without a recorded digest cannot be checked; decompress again
    let (decompressed, decompressed_size, decompressed_digest) =
        match (record.decompressed_size, record.decompressed_digest) {
            (Some(size), Some(digest)) => (Some(dir.join(IMAGE_FILE)), Some(size), Some(digest)),
            _ => (None, None, None),
        };
    Some(CacheEntry {
        checksum: record.checksum,
        path: dir.join(BLOB_FILE),
        size: record.size,
        compression: record.compression,
        decompressed,
        decompressed_size,
        decompressed_digest,
        last_verified: record.last_verified,
    })
}

/// Copy `reader` to `path`, hashing on the way, and check the digest
fn receive(checksum: &Checksum, reader: &mut dyn Read, path: &Path) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut file = File::create(path).map_err(io_err(path))?;
    let mut hasher = Hasher::new(checksum.algorithm);
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).map_err(io_err(path))?;
    }
    file.sync_all().map_err(io_err(path))?;

    let computed = hasher.finalize_hex();
    if computed != checksum.digest {
        log_warn!(
            MODULE,
            "Refusing to store {}: content hashes to {}",
            checksum,
            computed
        );
        return Err(CacheError::DigestMismatch {
            expected: checksum.digest.clone(),
            computed,
        });
    }
    Ok(())
}

fn hash_file(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    cancel: &CancelToken,
    progress: impl FnMut(u64),
) -> Result<String, CacheError> {
    verify::compute_digest(path, algorithm, cancel, progress).map_err(|e| match e {
        VerifyError::Cancelled => CacheError::Cancelled,
        VerifyError::Io { source, .. } => CacheError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

fn move_file(source: &Path, target: &Path) -> Result<(), CacheError> {
    if std::fs::rename(source, target).is_err() {
        // Different filesystem: copy then remove
        std::fs::copy(source, target).map_err(io_err(target))?;
        let _ = std::fs::remove_file(source);
    }
    Ok(())
}

/// Write `entry.json` atomically (temp file + rename)
fn write_record(dir: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
    let record = EntryRecord {
        checksum: entry.checksum.clone(),
        size: entry.size,
        compression: entry.compression,
        decompressed_size: entry.decompressed_size,
        decompressed_digest: entry.decompressed_digest.clone(),
        last_verified: entry.last_verified,
    };
    let json = serde_json::to_vec_pretty(&record)?;
    let tmp = dir.join(format!("{}.tmp", ENTRY_FILE));
    let path = dir.join(ENTRY_FILE);
    std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::compute_digest;

    fn checksum_of(data: &[u8]) -> Checksum {
        use sha2::{Digest, Sha256};
        Checksum::new(ChecksumAlgorithm::Sha256, &hex::encode(Sha256::digest(data))).unwrap()
    }

    #[test]
    fn test_store_then_lookup_matches_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let data = b"raw disk image bytes".repeat(1000);
        let checksum = checksum_of(&data);

        cache
            .store(&checksum, &mut &data[..], CompressionKind::None)
            .unwrap();
        let entry = cache.lookup(&checksum).unwrap();

        let digest = compute_digest(
            &entry.path,
            checksum.algorithm,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(digest, checksum.digest);
        assert_eq!(entry.raw_image(), Some(entry.path.as_path()));
        assert_eq!(
            cache.stats(),
            CacheStats {
                entry_count: 1,
                total_bytes: data.len() as u64
            }
        );
    }

    #[test]
    fn test_identical_content_shares_storage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let data = b"same bytes";
        let checksum = checksum_of(data);

        cache.store(&checksum, &mut &data[..], CompressionKind::None).unwrap();
        cache.store(&checksum, &mut &data[..], CompressionKind::None).unwrap();
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn test_size_corruption_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let data = b"0123456789";
        let checksum = checksum_of(data);
        let entry = cache.store(&checksum, &mut &data[..], CompressionKind::None).unwrap();

        std::fs::write(&entry.path, b"short").unwrap();

        assert!(cache.lookup(&checksum).is_none());
        assert_eq!(cache.stats().entry_count, 0);
        assert!(!entry.path.exists());
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"persisted";
        let checksum = checksum_of(data);
        {
            let cache = ImageCache::open(dir.path()).unwrap();
            cache.store(&checksum, &mut &data[..], CompressionKind::Gzip).unwrap();
            cache.touch_verified(&checksum).unwrap();
        }

        let cache = ImageCache::open(dir.path()).unwrap();
        let entry = cache.lookup(&checksum).unwrap();
        assert_eq!(entry.compression, CompressionKind::Gzip);
        assert!(entry.last_verified.is_some());
        assert!(entry.raw_image().is_none());
    }

    #[test]
    fn test_store_file_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path().join("cache")).unwrap();
        let source = dir.path().join("download.tmp");
        std::fs::write(&source, b"downloaded").unwrap();
        let checksum = checksum_of(b"downloaded");

        let entry = cache
            .store_file(&checksum, &source, CompressionKind::None, None, &CancelToken::new(), |_| {})
            .unwrap();
        assert!(!source.exists());
        assert!(entry.path.exists());

        cache.evict(&checksum).unwrap();
        assert!(cache.lookup(&checksum).is_none());
        assert!(!entry.path.exists());
        cache.evict(&checksum).unwrap();
    }

    #[test]
    fn test_store_rejects_bytes_not_matching_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let checksum = checksum_of(b"expected bytes");

        let err = cache
            .store(&checksum, &mut &b"totally different bytes"[..], CompressionKind::None)
            .unwrap_err();
        assert!(matches!(err, CacheError::DigestMismatch { .. }));
        assert!(cache.lookup(&checksum).is_none());
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(
            std::fs::read_dir(dir.path().join(PARTIAL_DIR)).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_failed_store_keeps_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let data = b"good image";
        let checksum = checksum_of(data);
        cache.store(&checksum, &mut &data[..], CompressionKind::None).unwrap();

        assert!(cache
            .store(&checksum, &mut &b"bad image!"[..], CompressionKind::None)
            .is_err());
        let entry = cache.lookup(&checksum).unwrap();
        assert_eq!(std::fs::read(&entry.path).unwrap(), data);
    }

    #[test]
    fn test_store_file_mismatch_leaves_source() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path().join("cache")).unwrap();
        let source = dir.path().join("download.tmp");
        std::fs::write(&source, b"truncated").unwrap();
        let checksum = checksum_of(b"truncated download");

        let err = cache
            .store_file(&checksum, &source, CompressionKind::None, None, &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, CacheError::DigestMismatch { .. }));
        assert!(source.exists());
        assert!(cache.lookup(&checksum).is_none());
    }

    #[test]
    fn test_import_keys_entry_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path().join("cache")).unwrap();
        let source = dir.path().join("download.tmp");
        std::fs::write(&source, b"unlisted image").unwrap();

        let entry = cache
            .import_file(
                &source,
                ChecksumAlgorithm::Sha256,
                CompressionKind::None,
                None,
                &CancelToken::new(),
                |_| {},
            )
            .unwrap();
        assert_eq!(entry.checksum, checksum_of(b"unlisted image"));
        assert!(cache.lookup(&entry.checksum).is_some());
    }

    #[test]
    fn test_staged_image_digest_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let source = dir.path().join("blob.gz");
        let staged = dir.path().join("image.tmp");
        std::fs::write(&source, b"compressed").unwrap();
        std::fs::write(&staged, b"decompressed").unwrap();
        let checksum = checksum_of(b"compressed");
        let digest = checksum_of(b"decompressed").digest;
        {
            let cache = ImageCache::open(&root).unwrap();
            let staged = StagedImage {
                path: staged.clone(),
                size: 12,
                digest: digest.clone(),
            };
            cache
                .store_file(
                    &checksum,
                    &source,
                    CompressionKind::Gzip,
                    Some(staged),
                    &CancelToken::new(),
                    |_| {},
                )
                .unwrap();
        }

        let cache = ImageCache::open(&root).unwrap();
        let entry = cache.lookup(&checksum).unwrap();
        assert_eq!(entry.decompressed_digest.as_deref(), Some(digest.as_str()));
        assert_eq!(std::fs::read(entry.raw_image().unwrap()).unwrap(), b"decompressed");

        let entry = cache.discard_decompressed(&checksum).unwrap();
        assert!(entry.raw_image().is_none());
        assert!(!cache.decompressed_path(&checksum).exists());
    }

    #[tokio::test]
    async fn test_claim_serializes_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ImageCache::open(dir.path()).unwrap());

        let held = cache.claim("sha256-abc").await;
        let other = Arc::clone(&cache);
        let waiter = tokio::spawn(async move {
            let _claim = other.claim("sha256-abc").await;
        });
        // A different key is not blocked
        let _unrelated = cache.claim("sha256-def").await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn test_lookup_snapshot_is_isolated_from_later_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::open(dir.path()).unwrap();
        let snapshot = cache.current();
        let checksum = checksum_of(b"late");
        cache.store(&checksum, &mut &b"late"[..], CompressionKind::None).unwrap();
        assert!(snapshot.is_empty());
        assert!(cache.lookup(&checksum).is_some());
    }
}
