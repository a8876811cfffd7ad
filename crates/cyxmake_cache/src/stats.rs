//! Cache hit/miss/traffic counters, updated without taking the index lock.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    hits_local: AtomicU64,
    hits_remote: AtomicU64,
    hits_pending: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl CacheStats {
    pub fn record_hit_local(&self) {
        self.hits_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit_remote(&self) {
        self.hits_remote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit_pending(&self) {
        self.hits_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self, bytes: u64) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits_local: self.hits_local.load(Ordering::Relaxed),
            hits_remote: self.hits_remote.load(Ordering::Relaxed),
            hits_pending: self.hits_pending.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits_local: u64,
    pub hits_remote: u64,
    pub hits_pending: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl StatsSnapshot {
    pub fn total_hits(&self) -> u64 {
        self.hits_local + self.hits_remote
    }
}
