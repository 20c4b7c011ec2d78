//! Content-addressed on-disk store for creative assets.
//!
//! Files are named after the SHA-256 of their cache key and listed in a
//! small JSON index so entries survive restarts. Eviction is LRU within a
//! byte budget and never touches pinned entries.

use crate::creative::AssetRef;
use crate::error::{AdError, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

/// Compute SHA-256 and return lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest: [u8; 32] = Sha256::digest(data).into();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check downloaded bytes against what the asset declares: size first, then hash.
///
/// Returns the SHA-256 of the content.
pub fn validate(asset: &AssetRef, data: &[u8]) -> Result<String> {
    if let Some(expected) = asset.size {
        if data.len() as u64 != expected {
            return Err(AdError::AssetIntegrityMismatch {
                url: asset.url.clone(),
                detail: format!("expected {} bytes, got {}", expected, data.len()),
            });
        }
    }

    let actual = sha256_hex(data);
    if let Some(expected) = &asset.sha256 {
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(AdError::AssetIntegrityMismatch {
                url: asset.url.clone(),
                detail: format!("expected sha256 {}, got {}", expected, actual),
            });
        }
    }

    Ok(actual)
}

/// Identity of a cached asset: its URL plus the declared hash when known
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub url: String,
    pub sha256: Option<String>,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, sha256: Option<String>) -> Self {
        Self {
            url: url.into(),
            sha256: sha256.map(|h| h.to_ascii_lowercase()),
        }
    }

    /// Content-addressed file name, keeping the URL's extension
    pub fn file_name(&self) -> String {
        let identity = format!("{}#{}", self.url, self.sha256.as_deref().unwrap_or(""));
        let stem = sha256_hex(identity.as_bytes());
        match url_extension(&self.url) {
            Some(ext) => format!("{}.{}", stem, ext),
            None => stem,
        }
    }
}

impl From<&AssetRef> for CacheKey {
    fn from(asset: &AssetRef) -> Self {
        Self::new(asset.url.clone(), asset.sha256.clone())
    }
}

fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// A validated file in the cache. Never mutated once inserted, only evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,

    /// SHA-256 of the stored content
    pub sha256: String,

    /// Logical access clock; larger is more recent
    pub last_access: u64,
}

/// On-disk form of one entry
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    url: String,
    declared_sha256: Option<String>,
    file: String,
    size: u64,
    sha256: String,
    last_access: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: Vec<IndexEntry>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CachedAsset>,
    pins: HashMap<CacheKey, usize>,
    total_bytes: u64,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn is_pinned(&self, key: &CacheKey) -> bool {
        self.pins.get(key).is_some_and(|count| *count > 0)
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CachedAsset> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        if let Err(e) = fs::remove_file(&entry.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to delete cached file {}: {}", entry.path.display(), e);
            }
        }
        Some(entry)
    }

    /// Drop least recently used unpinned entries until within `budget`.
    /// Returns how many were dropped.
    fn evict_to_budget(&mut self, budget: u64, keep: Option<&CacheKey>) -> usize {
        let mut evicted = 0;
        while self.total_bytes > budget {
            let victim = self
                .entries
                .values()
                .filter(|entry| Some(&entry.key) != keep && !self.is_pinned(&entry.key))
                .min_by_key(|entry| entry.last_access)
                .map(|entry| entry.key.clone());

            let Some(victim) = victim else {
                warn!(
                    "Asset cache over budget ({} > {} bytes) with nothing evictable",
                    self.total_bytes, budget
                );
                break;
            };

            if let Some(entry) = self.remove(&victim) {
                debug!("Evicted {} ({} bytes)", entry.key.url, entry.size);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Shared asset store. All mutation goes through one short lock.
pub struct AssetCache {
    dir: PathBuf,
    budget: u64,
    state: Mutex<CacheState>,
}

impl AssetCache {
    /// Open the cache in `dir`, loading and repairing its index.
    ///
    /// Entries whose file vanished or changed size are dropped.
    pub fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index = load_index(&dir);
        let mut state = CacheState::default();

        for entry in index.entries {
            let path = dir.join(&entry.file);
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() == entry.size => {
                    let key = CacheKey::new(entry.url, entry.declared_sha256);
                    state.tick = state.tick.max(entry.last_access);
                    state.total_bytes += entry.size;
                    state.entries.insert(
                        key.clone(),
                        CachedAsset {
                            key,
                            path,
                            size: entry.size,
                            sha256: entry.sha256,
                            last_access: entry.last_access,
                        },
                    );
                }
                _ => {
                    debug!("Dropping stale cache entry for {}", entry.url);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        state.evict_to_budget(budget, None);
        debug!(
            "Opened asset cache at {} with {} entries ({} bytes)",
            dir.display(),
            state.entries.len(),
            state.total_bytes
        );

        let cache = Self {
            dir,
            budget,
            state: Mutex::new(state),
        };
        {
            let state = cache.state.lock();
            cache.persist(&state)?;
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Look up a validated entry and mark it recently used
    pub fn get(&self, key: &CacheKey) -> Option<CachedAsset> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(key) {
            return None;
        }

        let tick = state.next_tick();
        let entry = state.entries.get_mut(key)?;
        if !entry.path.is_file() {
            warn!("Cached file for {} disappeared", key.url);
            state.remove(key);
            return None;
        }
        entry.last_access = tick;
        Some(entry.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Validate `data` against `asset` and store it.
    ///
    /// Idempotent: when the key is already present the existing entry is
    /// returned and `data` is discarded.
    pub fn put(&self, asset: &AssetRef, data: &[u8]) -> Result<CachedAsset> {
        let key = CacheKey::from(asset);
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }

        let sha256 = validate(asset, data)?;

        let final_path = self.dir.join(key.file_name());
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let temp_path = self.dir.join(format!(".{}.{}.tmp", key.file_name(), suffix));
        fs::write(&temp_path, data)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&key).cloned() {
            drop(state);
            let _ = fs::remove_file(&temp_path);
            debug!("Discarding duplicate download of {}", key.url);
            return Ok(existing);
        }

        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        let tick = state.next_tick();
        let entry = CachedAsset {
            key: key.clone(),
            path: final_path,
            size: data.len() as u64,
            sha256,
            last_access: tick,
        };
        state.total_bytes += entry.size;
        state.entries.insert(key.clone(), entry.clone());
        state.evict_to_budget(self.budget, Some(&key));

        if let Err(e) = self.persist(&state) {
            warn!("Failed to write cache index: {}", e);
        }

        debug!("Cached {} ({} bytes)", key.url, entry.size);
        Ok(entry)
    }

    /// Remove an entry. Returns false when it is pinned or absent.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let mut state = self.state.lock();
        if state.is_pinned(key) {
            debug!("Refusing to evict pinned asset {}", key.url);
            return false;
        }
        if state.remove(key).is_none() {
            return false;
        }
        if let Err(e) = self.persist(&state) {
            warn!("Failed to write cache index: {}", e);
        }
        true
    }

    /// Protect a key from eviction. Pins are counted and may precede the entry.
    pub fn pin(&self, key: &CacheKey) {
        *self.state.lock().pins.entry(key.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(key);
            }
        }
        if state.evict_to_budget(self.budget, None) > 0 {
            if let Err(e) = self.persist(&state) {
                warn!("Failed to write cache index: {}", e);
            }
        }
    }

    pub fn pin_count(&self, key: &CacheKey) -> usize {
        self.state.lock().pins.get(key).copied().unwrap_or(0)
    }

    /// Snapshot of every entry, least recently used first
    pub fn entries(&self) -> Vec<CachedAsset> {
        let mut entries: Vec<CachedAsset> = self.state.lock().entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.last_access);
        entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the index atomically: temp file then rename
    fn persist(&self, state: &CacheState) -> Result<()> {
        let mut entries: Vec<&CachedAsset> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.last_access);

        let index = CacheIndex {
            entries: entries
                .into_iter()
                .filter_map(|entry| {
                    let file = entry.path.file_name()?.to_string_lossy().into_owned();
                    Some(IndexEntry {
                        url: entry.key.url.clone(),
                        declared_sha256: entry.key.sha256.clone(),
                        file,
                        size: entry.size,
                        sha256: entry.sha256.clone(),
                        last_access: entry.last_access,
                    })
                })
                .collect(),
        };

        let temp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&temp, serde_json::to_vec_pretty(&index)?)?;
        fs::rename(&temp, self.dir.join(INDEX_FILE))?;
        Ok(())
    }
}

fn load_index(dir: &Path) -> CacheIndex {
    let path = dir.join(INDEX_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read cache index {}: {}", path.display(), e);
            }
            return CacheIndex::default();
        }
    };

    serde_json::from_slice(&raw).unwrap_or_else(|e| {
        warn!("Ignoring corrupt cache index {}: {}", path.display(), e);
        CacheIndex::default()
    })
}
