//! Local content-addressed store: index, object files, compression,
//! eviction, and the remote tier orchestration.

use crate::key::hash_bytes;
use crate::remote::{RemoteCache, RemoteConfig, SyncDirection, SyncReport};
use crate::stats::{CacheStats, StatsSnapshot};
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Configuration
// ============================================================================

/// Compression applied to stored artifacts at or above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl CompressionAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgo::None => "none",
            CompressionAlgo::Zstd => "zstd",
            CompressionAlgo::Gzip => "gzip",
        }
    }

    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            CompressionAlgo::None => Ok(bytes.to_vec()),
            CompressionAlgo::Zstd => zstd::encode_all(bytes, 3),
            CompressionAlgo::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(bytes)?;
                encoder.finish()
            }
        }
    }

    fn decompress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            CompressionAlgo::None => Ok(bytes.to_vec()),
            CompressionAlgo::Zstd => zstd::decode_all(bytes),
            CompressionAlgo::Gzip => {
                use std::io::Read;
                let mut decoder = flate2::read::GzDecoder::new(bytes);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl FromStr for CompressionAlgo {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionAlgo::None),
            "zstd" => Ok(CompressionAlgo::Zstd),
            "gzip" => Ok(CompressionAlgo::Gzip),
            _ => Err(format!("Invalid compression algorithm: '{}'", s)),
        }
    }
}

/// Which entries go first when space runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            _ => Err(format!("Invalid eviction policy: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_size_bytes: u64,
    pub max_entries: usize,
    /// 0 disables age-based cleanup.
    pub max_age_days: u64,
    pub compression_algo: CompressionAlgo,
    pub compression_threshold: u64,
    pub eviction_policy: EvictionPolicy,
    /// Fraction of `max_size_bytes` at which eviction starts.
    pub eviction_watermark: f64,
    /// Fraction of `max_size_bytes` eviction tries to leave free.
    pub eviction_target_free: f64,
    pub remote: Option<RemoteConfig>,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            max_entries: 100_000,
            max_age_days: 30,
            compression_algo: CompressionAlgo::default(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            eviction_policy: EvictionPolicy::default(),
            eviction_watermark: DEFAULT_EVICTION_WATERMARK,
            eviction_target_free: DEFAULT_EVICTION_TARGET_FREE,
            remote: None,
        }
    }
}

// The cache sits below the protocol crate, so its canonical defaults
// live here rather than being imported from the wire layer.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 4 * 1024;
pub const DEFAULT_EVICTION_WATERMARK: f64 = 0.9;
pub const DEFAULT_EVICTION_TARGET_FREE: f64 = 0.2;

// ============================================================================
// Entries
// ============================================================================

/// What kind of file an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Object,
    StaticLib,
    SharedLib,
    Executable,
    Other,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactType::Object => "object",
            ArtifactType::StaticLib => "static_lib",
            ArtifactType::SharedLib => "shared_lib",
            ArtifactType::Executable => "executable",
            ArtifactType::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// One cached artifact. `content_hash` is always the hash of the
/// decompressed bytes; `compressed_hash` is the hash of the stored form
/// when compression was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub cache_key: String,
    #[serde(default)]
    pub source_hash: String,
    #[serde(default)]
    pub compiler_hash: String,
    pub artifact_type: ArtifactType,
    pub cached_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_hash: Option<String>,
    pub is_compressed: bool,
    #[serde(default)]
    pub compressed_size: u64,
    pub compression_algo: CompressionAlgo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
}

impl ArtifactEntry {
    /// Bytes this entry occupies on disk.
    pub fn stored_size(&self) -> u64 {
        if self.is_compressed {
            self.compressed_size
        } else {
            self.size_bytes
        }
    }
}

/// Provenance attached to a stored artifact.
#[derive(Debug, Clone, Default)]
pub struct StoreOrigin {
    pub source_hash: String,
    pub compiler_hash: String,
    pub producer_host: Option<String>,
    pub build_id: Option<Uuid>,
}

/// Outcome of a key lookup across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Miss,
    HitLocal,
    HitRemote,
    /// A remote fetch for this key is already in flight.
    HitPending,
}

/// Outcome of a `verify` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub corrupt: usize,
    pub removed: usize,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, ArtifactEntry>,
    /// Keys with a remote fetch in flight; at most one fetch per key.
    pending_remote: HashSet<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedIndex {
    entries: Vec<ArtifactEntry>,
}

// ============================================================================
// Cache
// ============================================================================

pub struct ArtifactCache {
    config: CacheConfig,
    index: Mutex<IndexState>,
    remote: Option<RemoteCache>,
    stats: CacheStats,
}

impl ArtifactCache {
    /// Open (or create) the cache at `config.cache_dir`.
    ///
    /// An unreadable or corrupt index degrades to an empty cache rather
    /// than failing; the objects on disk are then unreachable until
    /// re-stored, which is safe.
    pub fn open(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(config.cache_dir.join("objects"))?;

        let index_path = config.cache_dir.join("index.json");
        let mut state = IndexState::default();
        if index_path.exists() {
            match std::fs::read_to_string(&index_path)
                .map_err(CacheError::from)
                .and_then(|text| {
                    serde_json::from_str::<PersistedIndex>(&text).map_err(CacheError::from)
                }) {
                Ok(persisted) => {
                    for entry in persisted.entries {
                        state.entries.insert(entry.cache_key.clone(), entry);
                    }
                    info!("loaded cache index: {} entries", state.entries.len());
                }
                Err(e) => {
                    warn!("cache index unreadable, starting empty: {}", e);
                }
            }
        }

        let remote = match &config.remote {
            Some(remote_config) => Some(RemoteCache::new(remote_config.clone())?),
            None => None,
        };

        Ok(Self {
            config,
            index: Mutex::new(state),
            remote,
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes the stored forms occupy.
    pub fn usage_bytes(&self) -> u64 {
        let index = self.index.lock().unwrap();
        index.entries.values().map(|e| e.stored_size()).sum()
    }

    pub fn entry(&self, key: &str) -> Option<ArtifactEntry> {
        self.index.lock().unwrap().entries.get(key).cloned()
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard, rest) = key.split_at(key.len().min(2));
        self.config.cache_dir.join("objects").join(shard).join(rest)
    }

    /// Consult the local index, then (when configured) the remote.
    /// Remote errors degrade to `Miss`.
    pub fn lookup(&self, key: &str) -> CacheLookup {
        {
            let index = self.index.lock().unwrap();
            if index.pending_remote.contains(key) {
                self.stats.record_hit_pending();
                return CacheLookup::HitPending;
            }
            if index.entries.contains_key(key) {
                self.stats.record_hit_local();
                return CacheLookup::HitLocal;
            }
        }

        if let Some(remote) = &self.remote {
            match remote.exists(key) {
                Ok(true) => {
                    self.stats.record_hit_remote();
                    return CacheLookup::HitRemote;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("remote lookup for {} degraded to miss: {}", key, e);
                }
            }
        }

        self.stats.record_miss();
        CacheLookup::Miss
    }

    /// Store `bytes` under `key`. Idempotent for identical content; a
    /// store with differing content overwrites the previous entry.
    pub fn store(&self, key: &str, bytes: &[u8], artifact_type: ArtifactType) -> Result<ArtifactEntry> {
        self.store_from(key, bytes, artifact_type, StoreOrigin::default())
    }

    pub fn store_from(
        &self,
        key: &str,
        bytes: &[u8],
        artifact_type: ArtifactType,
        origin: StoreOrigin,
    ) -> Result<ArtifactEntry> {
        let content_hash = hash_bytes(bytes);

        // Idempotent re-store of identical content.
        {
            let mut index = self.index.lock().unwrap();
            if let Some(existing) = index.entries.get_mut(key) {
                if existing.content_hash == content_hash {
                    existing.access_count += 1;
                    existing.last_accessed = now_ms();
                    let entry = existing.clone();
                    drop(index);
                    self.save_index()?;
                    return Ok(entry);
                }
            }
        }

        let should_compress = self.config.compression_algo != CompressionAlgo::None
            && bytes.len() as u64 >= self.config.compression_threshold;
        let (stored, is_compressed) = if should_compress {
            (self.config.compression_algo.compress(bytes)?, true)
        } else {
            (bytes.to_vec(), false)
        };

        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &stored)?;

        let now = now_ms();
        let entry = ArtifactEntry {
            cache_key: key.to_string(),
            source_hash: origin.source_hash,
            compiler_hash: origin.compiler_hash,
            artifact_type,
            cached_path: path,
            size_bytes: bytes.len() as u64,
            created_at: now,
            last_accessed: now,
            access_count: 1,
            content_hash,
            compressed_hash: is_compressed.then(|| hash_bytes(&stored)),
            is_compressed,
            compressed_size: if is_compressed { stored.len() as u64 } else { 0 },
            compression_algo: if is_compressed {
                self.config.compression_algo
            } else {
                CompressionAlgo::None
            },
            producer_host: origin.producer_host,
            build_id: origin.build_id,
        };

        let victims = {
            let mut index = self.index.lock().unwrap();
            index.entries.insert(key.to_string(), entry.clone());
            self.plan_eviction(&mut index)
        };

        for victim in &victims {
            if let Err(e) = std::fs::remove_file(&victim.cached_path) {
                debug!("evicted object {} already gone: {}", victim.cache_key, e);
            }
        }
        if !victims.is_empty() {
            self.stats.record_eviction(victims.len() as u64);
            info!("evicted {} cache entries", victims.len());
        }

        self.save_index()?;
        self.stats.record_store(entry.stored_size());
        Ok(entry)
    }

    /// Write the decompressed bytes for `key` to `dest` atomically.
    pub fn retrieve(&self, key: &str, dest: &Path) -> Result<u64> {
        let entry = {
            let mut index = self.index.lock().unwrap();
            let entry = index
                .entries
                .get_mut(key)
                .ok_or_else(|| CacheError::Miss(key.to_string()))?;
            entry.access_count += 1;
            entry.last_accessed = now_ms();
            entry.clone()
        };

        let stored = std::fs::read(&entry.cached_path)?;
        let bytes = if entry.is_compressed {
            entry
                .compression_algo
                .decompress(&stored)
                .map_err(|e| CacheError::Corrupt {
                    key: key.to_string(),
                    detail: format!("decompression failed: {}", e),
                })?
        } else {
            stored
        };

        if hash_bytes(&bytes) != entry.content_hash {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                detail: "content hash mismatch".to_string(),
            });
        }

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_atomic(dest, &bytes)?;

        self.stats.record_read(bytes.len() as u64);
        self.save_index()?;
        Ok(bytes.len() as u64)
    }

    /// Decompressed bytes for `key`, without touching the filesystem at
    /// the destination side. Serving path for artifact requests.
    pub fn load(&self, key: &str) -> Result<Vec<u8>> {
        let entry = {
            let mut index = self.index.lock().unwrap();
            let entry = index
                .entries
                .get_mut(key)
                .ok_or_else(|| CacheError::Miss(key.to_string()))?;
            entry.access_count += 1;
            entry.last_accessed = now_ms();
            entry.clone()
        };

        let stored = std::fs::read(&entry.cached_path)?;
        let bytes = if entry.is_compressed {
            entry
                .compression_algo
                .decompress(&stored)
                .map_err(|e| CacheError::Corrupt {
                    key: key.to_string(),
                    detail: format!("decompression failed: {}", e),
                })?
        } else {
            stored
        };
        if hash_bytes(&bytes) != entry.content_hash {
            return Err(CacheError::Corrupt {
                key: key.to_string(),
                detail: "content hash mismatch".to_string(),
            });
        }
        self.stats.record_read(bytes.len() as u64);
        Ok(bytes)
    }

    /// Download `key` from the remote tier into the local store.
    ///
    /// At most one fetch per key is in flight: concurrent callers observe
    /// `HitPending` instead of starting a second download.
    pub fn fetch_remote(&self, key: &str) -> Result<CacheLookup> {
        {
            let mut index = self.index.lock().unwrap();
            if index.entries.contains_key(key) {
                return Ok(CacheLookup::HitLocal);
            }
            if !index.pending_remote.insert(key.to_string()) {
                self.stats.record_hit_pending();
                return Ok(CacheLookup::HitPending);
            }
        }

        let outcome = self.fetch_remote_inner(key);

        let mut index = self.index.lock().unwrap();
        index.pending_remote.remove(key);
        drop(index);

        outcome
    }

    fn fetch_remote_inner(&self, key: &str) -> Result<CacheLookup> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::RemoteUnavailable("no remote configured".to_string()))?;

        match remote.download(key)? {
            Some(bytes) => {
                self.stats.record_download(bytes.len() as u64);
                self.store(key, &bytes, ArtifactType::Object)?;
                self.stats.record_hit_remote();
                Ok(CacheLookup::HitRemote)
            }
            None => {
                self.stats.record_miss();
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Upload the decompressed bytes for `key` to the remote tier.
    pub fn push_remote(&self, key: &str) -> Result<()> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::RemoteUnavailable("no remote configured".to_string()))?;

        let entry = self
            .entry(key)
            .ok_or_else(|| CacheError::Miss(key.to_string()))?;
        let stored = std::fs::read(&entry.cached_path)?;
        let bytes = if entry.is_compressed {
            entry.compression_algo.decompress(&stored)?
        } else {
            stored
        };

        remote.upload(key, &bytes)?;
        self.stats.record_upload(bytes.len() as u64);
        Ok(())
    }

    /// Reconcile the local index with the remote tier.
    pub fn sync(&self, direction: SyncDirection) -> Result<SyncReport> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::RemoteUnavailable("no remote configured".to_string()))?;

        let entries: Vec<ArtifactEntry> = {
            let index = self.index.lock().unwrap();
            index.entries.values().cloned().collect()
        };

        let mut report = SyncReport::default();
        for entry in entries {
            let key = &entry.cache_key;
            if matches!(direction, SyncDirection::Push | SyncDirection::Both)
                && !remote.read_only()
            {
                match remote.exists(key) {
                    Ok(false) => match self.push_remote(key) {
                        Ok(()) => report.pushed += 1,
                        Err(e) => {
                            warn!("sync push of {} failed: {}", key, e);
                            report.errors += 1;
                        }
                    },
                    Ok(true) => {}
                    Err(e) => {
                        warn!("sync probe of {} failed: {}", key, e);
                        report.errors += 1;
                    }
                }
            }

            if matches!(direction, SyncDirection::Pull | SyncDirection::Both)
                && !entry.cached_path.exists()
            {
                match remote.download(key) {
                    Ok(Some(bytes)) if hash_bytes(&bytes) == entry.content_hash => {
                        let stored = if entry.is_compressed {
                            entry.compression_algo.compress(&bytes)?
                        } else {
                            bytes
                        };
                        if let Some(parent) = entry.cached_path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        write_atomic(&entry.cached_path, &stored)?;
                        report.pulled += 1;
                    }
                    Ok(Some(_)) | Ok(None) => {
                        report.errors += 1;
                    }
                    Err(e) => {
                        warn!("sync pull of {} failed: {}", key, e);
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Drop entries older than `max_age_days`. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize> {
        if self.config.max_age_days == 0 {
            return Ok(0);
        }
        let cutoff = now_ms().saturating_sub(self.config.max_age_days * 24 * 3600 * 1000);

        let expired: Vec<ArtifactEntry> = {
            let mut index = self.index.lock().unwrap();
            let keys: Vec<String> = index
                .entries
                .values()
                .filter(|e| e.created_at < cutoff)
                .map(|e| e.cache_key.clone())
                .collect();
            keys.iter()
                .filter_map(|k| index.entries.remove(k))
                .collect()
        };

        for entry in &expired {
            let _ = std::fs::remove_file(&entry.cached_path);
        }
        if !expired.is_empty() {
            self.save_index()?;
            info!("cleanup removed {} expired entries", expired.len());
        }
        Ok(expired.len())
    }

    /// Re-hash every entry. With `fix`, mismatched entries are removed.
    pub fn verify(&self, fix: bool) -> Result<VerifyReport> {
        let entries: Vec<ArtifactEntry> = {
            let index = self.index.lock().unwrap();
            index.entries.values().cloned().collect()
        };

        let mut report = VerifyReport::default();
        let mut bad_keys = Vec::new();

        for entry in &entries {
            report.checked += 1;
            let healthy = std::fs::read(&entry.cached_path)
                .ok()
                .and_then(|stored| {
                    if entry.is_compressed {
                        entry.compression_algo.decompress(&stored).ok()
                    } else {
                        Some(stored)
                    }
                })
                .map(|bytes| hash_bytes(&bytes) == entry.content_hash)
                .unwrap_or(false);

            if !healthy {
                report.corrupt += 1;
                bad_keys.push(entry.cache_key.clone());
            }
        }

        if fix && !bad_keys.is_empty() {
            let removed: Vec<ArtifactEntry> = {
                let mut index = self.index.lock().unwrap();
                bad_keys
                    .iter()
                    .filter_map(|k| index.entries.remove(k))
                    .collect()
            };
            for entry in &removed {
                let _ = std::fs::remove_file(&entry.cached_path);
            }
            report.removed = removed.len();
            self.save_index()?;
        }

        Ok(report)
    }

    /// Pick eviction victims while the index lock is held; removal of the
    /// on-disk objects happens at the caller, outside the lock.
    fn plan_eviction(&self, index: &mut IndexState) -> Vec<ArtifactEntry> {
        let usage: u64 = index.entries.values().map(|e| e.stored_size()).sum();
        let high_water = (self.config.max_size_bytes as f64 * self.config.eviction_watermark) as u64;
        let over_size = usage > high_water;
        let over_count = index.entries.len() > self.config.max_entries;
        if !over_size && !over_count {
            return Vec::new();
        }

        let mut candidates: Vec<(String, u64, u64, u64)> = index
            .entries
            .values()
            .map(|e| (e.cache_key.clone(), e.last_accessed, e.access_count, e.created_at))
            .collect();
        match self.config.eviction_policy {
            EvictionPolicy::Lru => candidates.sort_by_key(|(_, last, _, _)| *last),
            EvictionPolicy::Lfu => {
                candidates.sort_by_key(|(_, last, count, _)| (*count, *last));
            }
            EvictionPolicy::Fifo => candidates.sort_by_key(|(_, _, _, created)| *created),
        }

        let target = (self.config.max_size_bytes as f64
            * (1.0 - self.config.eviction_target_free)) as u64;
        let mut usage = usage;
        let mut victims = Vec::new();
        for (key, _, _, _) in candidates {
            let within_size = usage <= target;
            let within_count = index.entries.len() <= self.config.max_entries;
            if within_size && within_count {
                break;
            }
            if let Some(entry) = index.entries.remove(&key) {
                usage = usage.saturating_sub(entry.stored_size());
                victims.push(entry);
            }
        }
        victims
    }

    fn save_index(&self) -> Result<()> {
        let persisted = {
            let index = self.index.lock().unwrap();
            PersistedIndex {
                entries: index.entries.values().cloned().collect(),
            }
        };
        let text = serde_json::to_string_pretty(&persisted)?;
        write_atomic(&self.config.cache_dir.join("index.json"), text.as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    fn age_entry(&self, key: &str, created_at: u64) {
        let mut index = self.index.lock().unwrap();
        if let Some(entry) = index.entries.get_mut(key) {
            entry.created_at = created_at;
            entry.last_accessed = created_at;
        }
    }
}

/// Write-to-temp-then-rename publish in the destination directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| CacheError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_cache(dir: &TempDir) -> ArtifactCache {
        ArtifactCache::open(CacheConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);

        let bytes = b"OBJ\0\x01";
        let entry = cache.store("aabbcc", bytes, ArtifactType::Object).unwrap();
        assert_eq!(entry.size_bytes, bytes.len() as u64);
        assert!(!entry.is_compressed); // below threshold

        assert_eq!(cache.lookup("aabbcc"), CacheLookup::HitLocal);

        let out = dir.path().join("out.o");
        let written = cache.retrieve("aabbcc", &out).unwrap();
        assert_eq!(written, bytes.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), bytes);
        assert_eq!(hash_bytes(bytes), entry.content_hash);
    }

    #[test]
    fn test_store_is_idempotent_for_identical_content() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);

        cache.store("k1", b"same", ArtifactType::Object).unwrap();
        let second = cache.store("k1", b"same", ArtifactType::Object).unwrap();
        assert_eq!(second.access_count, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_later_store_wins_on_content_conflict() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);

        cache.store("k1", b"first", ArtifactType::Object).unwrap();
        let second = cache.store("k1", b"second", ArtifactType::Object).unwrap();
        assert_eq!(second.access_count, 1);
        assert_eq!(second.content_hash, hash_bytes(b"second"));

        let out = dir.path().join("out.bin");
        cache.retrieve("k1", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"second");
    }

    #[test]
    fn test_compression_above_threshold() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);

        // Highly compressible and above the 4 KiB threshold.
        let bytes = vec![b'x'; 64 * 1024];
        let entry = cache.store("bigkey", &bytes, ArtifactType::Object).unwrap();
        assert!(entry.is_compressed);
        assert!(entry.compressed_size > 0);
        assert!(entry.compressed_size < entry.size_bytes);
        assert!(entry.compressed_hash.is_some());

        let out = dir.path().join("big.o");
        cache.retrieve("bigkey", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), bytes);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.compression_algo = CompressionAlgo::Gzip;
        let cache = ArtifactCache::open(config).unwrap();

        let bytes = vec![7u8; 8 * 1024];
        let entry = cache.store("gz", &bytes, ArtifactType::Object).unwrap();
        assert!(entry.is_compressed);
        assert_eq!(entry.compression_algo, CompressionAlgo::Gzip);

        let out = dir.path().join("gz.o");
        cache.retrieve("gz", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), bytes);
    }

    #[test]
    fn test_miss_and_missing_retrieve() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);
        assert_eq!(cache.lookup("absent"), CacheLookup::Miss);
        assert!(matches!(
            cache.retrieve("absent", &dir.path().join("x")),
            Err(CacheError::Miss(_))
        ));
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = small_cache(&dir);
            cache.store("persist", b"payload", ArtifactType::Object).unwrap();
        }
        let cache = small_cache(&dir);
        assert_eq!(cache.lookup("persist"), CacheLookup::HitLocal);
        let out = dir.path().join("restored");
        cache.retrieve("persist", &out).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"payload");
    }

    #[test]
    fn test_lru_eviction_removes_coldest() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.max_size_bytes = 3000;
        config.eviction_watermark = 0.9;
        config.eviction_target_free = 0.4;
        config.compression_algo = CompressionAlgo::None;
        let cache = ArtifactCache::open(config).unwrap();

        cache.store("cold", &[1u8; 1000], ArtifactType::Object).unwrap();
        cache.store("warm", &[2u8; 1000], ArtifactType::Object).unwrap();
        // Touch "cold"? No: touch "warm" so "cold" stays coldest.
        cache.retrieve("warm", &dir.path().join("w")).unwrap();

        // Third store crosses the 2700-byte watermark and must evict down
        // to 1800 bytes, dropping the least recently used entry.
        cache.store("hot", &[3u8; 1000], ArtifactType::Object).unwrap();

        assert_eq!(cache.lookup("cold"), CacheLookup::Miss);
        assert_eq!(cache.lookup("hot"), CacheLookup::HitLocal);
    }

    #[test]
    fn test_max_entries_eviction() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.max_entries = 2;
        config.compression_algo = CompressionAlgo::None;
        let cache = ArtifactCache::open(config).unwrap();

        cache.store("a", b"1", ArtifactType::Object).unwrap();
        cache.store("b", b"2", ArtifactType::Object).unwrap();
        cache.store("c", b"3", ArtifactType::Object).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.max_age_days = 7;
        let cache = ArtifactCache::open(config).unwrap();

        cache.store("old", b"old", ArtifactType::Object).unwrap();
        cache.store("new", b"new", ArtifactType::Object).unwrap();
        cache.age_entry("old", 0);

        assert_eq!(cache.cleanup().unwrap(), 1);
        assert_eq!(cache.lookup("old"), CacheLookup::Miss);
        assert_eq!(cache.lookup("new"), CacheLookup::HitLocal);
    }

    #[test]
    fn test_verify_detects_and_fixes_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);

        let entry = cache.store("good", b"good bytes", ArtifactType::Object).unwrap();
        std::fs::write(&entry.cached_path, b"tampered").unwrap();

        let report = cache.verify(false).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.corrupt, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(cache.len(), 1);

        let report = cache.verify(true).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_object_path_sharding() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);
        let path = cache.object_path("abcdef");
        assert!(path.ends_with(PathBuf::from("objects").join("ab").join("cdef")));
    }

    #[test]
    fn test_fetch_remote_without_remote_errors() {
        let dir = TempDir::new().unwrap();
        let cache = small_cache(&dir);
        assert!(matches!(
            cache.fetch_remote("k"),
            Err(CacheError::RemoteUnavailable(_))
        ));
        // The pending marker must not leak after the failed fetch.
        assert_eq!(cache.lookup("k"), CacheLookup::Miss);
    }
}
