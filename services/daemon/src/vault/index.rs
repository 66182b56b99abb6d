//! On-disk vault index.
//!
//! The index maps content hashes to cached files and aliases to the hash
//! they last resolved to. It is written with write-to-temp + rename so a
//! crash leaves either the old or the new index, never a torn one.
//! Reference counts are runtime-only and rebuilt from the instance registry
//! at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::VaultError;

/// Index file format version.
const INDEX_VERSION: u32 = 1;

/// A cached image file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub source_url: String,
    pub size_bytes: u64,
    pub last_used: DateTime<Utc>,
    /// Orders uses that share a timestamp.
    pub use_seq: u64,
    /// Instances currently backed by this entry.
    #[serde(skip)]
    pub ref_count: u32,
}

/// Where an alias last resolved to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasEntry {
    pub hash: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VaultIndex {
    pub version: u32,
    pub next_seq: u64,
    pub entries: BTreeMap<String, CacheEntry>,
    pub aliases: BTreeMap<String, AliasEntry>,
}

impl Default for VaultIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_seq: 0,
            entries: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }
}

impl VaultIndex {
    /// Load the index, starting fresh when the file is missing or from an
    /// incompatible version.
    pub async fn load(path: &Path) -> Result<Self, VaultError> {
        if !fs::try_exists(path).await? {
            debug!(path = %path.display(), "No vault index, starting fresh");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await?;
        let index: Self = serde_json::from_str(&content)
            .map_err(|e| VaultError::Index(format!("{}: {e}", path.display())))?;

        if index.version != INDEX_VERSION {
            warn!(
                file_version = index.version,
                current_version = INDEX_VERSION,
                "Vault index version mismatch, starting fresh"
            );
            return Ok(Self::default());
        }

        Ok(index)
    }

    /// Save the index atomically.
    pub async fn save(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        let content =
            serde_json::to_string_pretty(self).map_err(|e| VaultError::Index(e.to_string()))?;
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, path).await?;

        debug!(
            path = %path.display(),
            entries = self.entries.len(),
            aliases = self.aliases.len(),
            "Saved vault index"
        );
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Hash `alias` maps to, if it was resolved within `freshness`.
    pub fn fresh_hash(&self, alias: &str, freshness: Duration, now: DateTime<Utc>) -> Option<&str> {
        let entry = self.aliases.get(alias)?;
        let age = now.signed_duration_since(entry.resolved_at);
        let fresh = age
            .to_std()
            .map(|age| age < freshness)
            .unwrap_or(true);
        (fresh && self.entries.contains_key(&entry.hash)).then_some(entry.hash.as_str())
    }

    pub fn map_alias(&mut self, alias: &str, hash: &str, now: DateTime<Utc>) {
        self.aliases.insert(
            alias.to_string(),
            AliasEntry {
                hash: hash.to_string(),
                resolved_at: now,
            },
        );
    }

    /// Record a use of `hash`.
    pub fn touch(&mut self, hash: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.last_used = now;
            entry.use_seq = self.next_seq;
            self.next_seq += 1;
        }
    }

    /// Unreferenced entries, least recently used first.
    pub fn eviction_order(&self) -> Vec<String> {
        let mut candidates: Vec<&CacheEntry> =
            self.entries.values().filter(|e| e.ref_count == 0).collect();
        candidates.sort_by_key(|e| (e.last_used, e.use_seq));
        candidates.into_iter().map(|e| e.hash.clone()).collect()
    }

    /// Remove an entry along with every alias pointing at it.
    pub fn remove(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.aliases.retain(|_, alias| alias.hash != hash);
        Some(entry)
    }
}
