//! Content-addressed image vault.
//!
//! Images are stored under `images/<sha256>.img` and looked up by alias.
//! Concurrent requests for the same alias share a single fetch: the first
//! caller spawns the fetch task and every caller, the first included, waits
//! on a oneshot that the task completes. Because the fetch runs in its own
//! task, a caller that goes away does not cancel it for the others.
//!
//! Entries carry a reference count of the instances using them. Eviction
//! only considers entries with no references, least recently used first.
//! A fetch admits its entry already holding one reference, which
//! `complete_fetch` hands over to the waiters, so the entry cannot be evicted
//! between admission and delivery.

mod index;
pub mod source;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use index::{AliasEntry, CacheEntry, VaultIndex};
pub use source::{ByteStream, HttpImageSource, ImageManifest, ImageSource, ResolvedImage};

/// Errors from vault operations.
///
/// Cloneable so a single fetch failure can be delivered to every waiter.
#[derive(Debug, Clone, Error)]
pub enum VaultError {
    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("image {alias} failed verification: expected sha256 {expected}, got {actual}")]
    ImageCorrupt {
        alias: String,
        expected: String,
        actual: String,
    },

    #[error("image source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("vault index error: {0}")]
    Index(String),
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        Self::Source(err.to_string())
    }
}

/// Configuration for the vault.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub cache_dir: PathBuf,
    /// Upper bound on the total size of cached images.
    pub max_size_bytes: u64,
    /// How long an alias resolution is trusted.
    pub freshness: Duration,
    pub max_parallel_downloads: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/vmhost/vault"),
            max_size_bytes: 50 * 1024 * 1024 * 1024, // 50 GiB
            freshness: Duration::from_secs(6 * 60 * 60),
            max_parallel_downloads: 2,
        }
    }
}

/// A verified image held by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmImage {
    pub hash: String,
    pub alias: String,
    pub source_url: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Vault statistics.
#[derive(Debug, Default)]
pub struct VaultStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub downloads: AtomicU64,
    pub evictions: AtomicU64,
}

type Waiter = oneshot::Sender<Result<VmImage, VaultError>>;

/// Image vault.
pub struct ImageVault {
    config: VaultConfig,
    source: Arc<dyn ImageSource>,
    index: Mutex<VaultIndex>,
    /// Waiters per alias with a fetch in flight. Locked before `index`.
    in_flight: Mutex<HashMap<String, Vec<Waiter>>>,
    downloads: Semaphore,
    stats: VaultStats,
}

impl ImageVault {
    /// Open the vault, loading its index and dropping entries whose files
    /// are gone.
    pub async fn open(
        config: VaultConfig,
        source: Arc<dyn ImageSource>,
    ) -> Result<Arc<Self>, VaultError> {
        let images_dir = config.cache_dir.join("images");
        let tmp_dir = config.cache_dir.join("tmp");
        tokio::fs::create_dir_all(&images_dir).await?;

        // Partial downloads from a previous run are useless
        if tmp_dir.exists() {
            tokio::fs::remove_dir_all(&tmp_dir).await?;
        }
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let mut index = VaultIndex::load(&config.cache_dir.join("index.json")).await?;
        let missing: Vec<String> = index
            .entries
            .keys()
            .filter(|hash| !image_path(&images_dir, hash).exists())
            .cloned()
            .collect();
        for hash in &missing {
            warn!(hash = %hash, "Cached image file missing, dropping entry");
            index.remove(hash);
        }

        let mut entries = tokio::fs::read_dir(&images_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let known = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|hash| index.entries.contains_key(hash))
                .unwrap_or(false);
            if !known {
                warn!(path = %path.display(), "Removing unindexed image file");
                tokio::fs::remove_file(&path).await.ok();
            }
        }

        info!(
            entries = index.entries.len(),
            size_bytes = index.total_size(),
            "Loaded image vault"
        );

        let vault = Self {
            downloads: Semaphore::new(config.max_parallel_downloads.max(1)),
            config,
            source,
            index: Mutex::new(index),
            in_flight: Mutex::new(HashMap::new()),
            stats: VaultStats::default(),
        };
        vault.save_index(&*vault.index.lock().await).await;

        Ok(Arc::new(vault))
    }

    /// Get a verified image for `alias`, fetching it if needed. The returned
    /// image holds one reference that must be given back with [`release`].
    ///
    /// [`release`]: ImageVault::release
    pub async fn get(self: &Arc<Self>, alias: &str) -> Result<VmImage, VaultError> {
        let rx = {
            let mut in_flight = self.in_flight.lock().await;

            if let Some(image) = self.acquire_fresh(alias).await {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(alias = %alias, hash = %image.hash, "Vault hit");
                return Ok(image);
            }

            let (tx, rx) = oneshot::channel();
            match in_flight.get_mut(alias) {
                Some(waiters) => {
                    debug!(alias = %alias, "Joining in-flight fetch");
                    waiters.push(tx);
                }
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    in_flight.insert(alias.to_string(), vec![tx]);

                    let vault = Arc::clone(self);
                    let alias = alias.to_string();
                    tokio::spawn(async move {
                        let result = vault.fetch(&alias).await;
                        vault.complete_fetch(&alias, result).await;
                    });
                }
            }
            rx
        };

        rx.await
            .map_err(|_| VaultError::Source(format!("fetch of {alias} was abandoned")))?
    }

    /// Give back a reference obtained from [`get`] or [`retain`].
    ///
    /// [`get`]: ImageVault::get
    /// [`retain`]: ImageVault::retain
    pub async fn release(&self, hash: &str) {
        let mut index = self.index.lock().await;
        if let Some(entry) = index.entries.get_mut(hash) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            debug!(hash = %hash, ref_count = entry.ref_count, "Released image reference");
        }
    }

    /// Take a reference on an already cached image. Used to rebuild
    /// reference counts from the instance registry at startup.
    pub async fn retain(&self, hash: &str) -> bool {
        let mut index = self.index.lock().await;
        match index.entries.get_mut(hash) {
            Some(entry) => {
                entry.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Whether the image is cached with its file in place.
    pub async fn contains(&self, hash: &str) -> bool {
        let index = self.index.lock().await;
        index.entries.contains_key(hash) && self.image_path(hash).exists()
    }

    pub async fn ref_count(&self, hash: &str) -> Option<u32> {
        let index = self.index.lock().await;
        index.entries.get(hash).map(|e| e.ref_count)
    }

    pub async fn total_size(&self) -> u64 {
        self.index.lock().await.total_size()
    }

    /// Cached entries, least recently used first.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let index = self.index.lock().await;
        let mut entries: Vec<CacheEntry> = index.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.last_used, e.use_seq));
        entries
    }

    pub fn stats(&self) -> &VaultStats {
        &self.stats
    }

    /// Evict unreferenced images until the vault fits its budget. Returns
    /// the evicted hashes.
    pub async fn prune(&self) -> Result<Vec<String>, VaultError> {
        self.evict_to(self.config.max_size_bytes).await
    }

    /// Make room for `incoming` more bytes.
    async fn prune_for(&self, incoming: u64) -> Result<Vec<String>, VaultError> {
        self.evict_to(self.config.max_size_bytes.saturating_sub(incoming))
            .await
    }

    async fn evict_to(&self, target: u64) -> Result<Vec<String>, VaultError> {
        let mut index = self.index.lock().await;
        let mut evicted = Vec::new();

        for hash in index.eviction_order() {
            if index.total_size() <= target {
                break;
            }
            let Some(entry) = index.remove(&hash) else {
                continue;
            };

            match tokio::fs::remove_file(self.image_path(&hash)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    // Keep the index honest about what is still on disk
                    index.entries.insert(hash.clone(), entry);
                    self.save_index(&index).await;
                    return Err(e.into());
                }
            }

            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            info!(hash = %hash, size_bytes = entry.size_bytes, "Evicted image");
            evicted.push(hash);
        }

        if !evicted.is_empty() {
            self.save_index(&index).await;
        }
        if index.total_size() > target {
            warn!(
                size_bytes = index.total_size(),
                target_bytes = target,
                "Vault over budget, remaining images are in use"
            );
        }

        Ok(evicted)
    }

    /// Reference a fresh cached image for `alias`, if there is one.
    async fn acquire_fresh(&self, alias: &str) -> Option<VmImage> {
        let mut index = self.index.lock().await;
        let now = Utc::now();
        let hash = index
            .fresh_hash(alias, self.config.freshness, now)?
            .to_string();
        if !self.image_path(&hash).exists() {
            return None;
        }

        index.touch(&hash, now);
        let entry = index.entries.get_mut(&hash)?;
        entry.ref_count += 1;
        let image = self.image_for(alias, entry);
        self.save_index(&index).await;
        Some(image)
    }

    /// Resolve, download and verify `alias`. Returns the content hash of the
    /// admitted image, which holds one provisional reference for the waiters.
    async fn fetch(&self, alias: &str) -> Result<String, VaultError> {
        let resolved = self.source.resolve(alias).await?;
        debug!(alias = %alias, url = %resolved.url, "Resolved image");

        let expected = resolved.sha256.as_deref().map(str::to_ascii_lowercase);

        if let Some(expected) = &expected {
            let mut index = self.index.lock().await;
            if self.image_path(expected).exists() {
                if let Some(entry) = index.entries.get_mut(expected) {
                    debug!(alias = %alias, hash = %expected, "Image content already cached");
                    entry.ref_count += 1;
                    index.map_alias(alias, expected, Utc::now());
                    self.save_index(&index).await;
                    return Ok(expected.clone());
                }
            }
        }

        if let Some(size) = resolved.size {
            self.prune_for(size).await?;
        }

        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| VaultError::Source("download limiter closed".to_string()))?;

        info!(alias = %alias, url = %resolved.url, "Downloading image");
        let (tmp_path, hash, size_bytes) = self.download(resolved.stream).await?;
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);

        if let Some(expected) = expected {
            if expected != hash {
                tokio::fs::remove_file(&tmp_path).await.ok();
                return Err(VaultError::ImageCorrupt {
                    alias: alias.to_string(),
                    expected,
                    actual: hash,
                });
            }
        }

        // Eviction removes files under the index lock, so the file check and
        // the admission below must happen under it too.
        let mut index = self.index.lock().await;
        let dest = self.image_path(&hash);
        if dest.exists() {
            // Identical bytes under another alias
            tokio::fs::remove_file(&tmp_path).await.ok();
        } else if let Err(e) = tokio::fs::rename(&tmp_path, &dest).await {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(e.into());
        }

        let now = Utc::now();
        let entry = index
            .entries
            .entry(hash.clone())
            .or_insert_with(|| CacheEntry {
                hash: hash.clone(),
                source_url: resolved.url.clone(),
                size_bytes,
                last_used: now,
                use_seq: 0,
                ref_count: 0,
            });
        entry.ref_count += 1;
        index.map_alias(alias, &hash, now);
        self.save_index(&index).await;

        info!(alias = %alias, hash = %hash, size_bytes, "Image admitted to vault");
        Ok(hash)
    }

    /// Stream into a temporary file while hashing.
    async fn download(
        &self,
        mut stream: ByteStream,
    ) -> Result<(PathBuf, String, u64), VaultError> {
        let tmp_path = self
            .config
            .cache_dir
            .join("tmp")
            .join(format!("{}.part", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;

        let written = async {
            while let Some(chunk) = stream.try_next().await? {
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                size_bytes += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<(), VaultError>(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(e);
        }

        Ok((tmp_path, hex::encode(hasher.finalize()), size_bytes))
    }

    /// Hand the fetch result to every waiter, taking one reference each, and
    /// drop the provisional reference taken at admission.
    async fn complete_fetch(&self, alias: &str, result: Result<String, VaultError>) {
        let mut in_flight = self.in_flight.lock().await;
        let waiters = in_flight.remove(alias).unwrap_or_default();
        let mut index = self.index.lock().await;

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                warn!(alias = %alias, error = %e, "Image fetch failed");
                if matches!(e, VaultError::ImageCorrupt { .. }) {
                    index.aliases.remove(alias);
                    self.save_index(&index).await;
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        };

        index.touch(&hash, Utc::now());
        self.save_index(&index).await;
        let Some(entry) = index.entries.get_mut(&hash) else {
            let e = VaultError::Index(format!("image {hash} vanished after fetch"));
            for waiter in waiters {
                let _ = waiter.send(Err(e.clone()));
            }
            return;
        };

        let image = self.image_for(alias, entry);
        for waiter in waiters {
            entry.ref_count += 1;
            if waiter.send(Ok(image.clone())).is_err() {
                entry.ref_count -= 1;
            }
        }
        entry.ref_count = entry.ref_count.saturating_sub(1);
        debug!(alias = %alias, hash = %hash, ref_count = entry.ref_count, "Fetch delivered");
    }

    fn image_for(&self, alias: &str, entry: &CacheEntry) -> VmImage {
        VmImage {
            hash: entry.hash.clone(),
            alias: alias.to_string(),
            source_url: entry.source_url.clone(),
            path: self.image_path(&entry.hash),
            size_bytes: entry.size_bytes,
        }
    }

    fn image_path(&self, hash: &str) -> PathBuf {
        image_path(&self.config.cache_dir.join("images"), hash)
    }

    async fn save_index(&self, index: &VaultIndex) {
        if let Err(e) = index.save(&self.config.cache_dir.join("index.json")).await {
            warn!(error = %e, "Failed to save vault index");
        }
    }
}

fn image_path(images_dir: &Path, hash: &str) -> PathBuf {
    images_dir.join(format!("{hash}.img"))
}
