//! Content-addressed artifact cache with compression, eviction, and an
//! optional remote tier.
//!
//! Layout on disk:
//!
//! ```text
//! <cache_dir>/objects/<first-two-hex>/<rest-of-key>   stored bytes
//! <cache_dir>/index.json                              entry records
//! ```
//!
//! Both the object files and the index are published atomically
//! (write-to-temp, then rename). The in-memory index is guarded by one
//! mutex; disk writes happen outside it.

pub mod key;
pub mod remote;
pub mod stats;
mod store;

pub use key::{compiler_hash, generate_key, hash_bytes, KeyInputs};
pub use remote::{RemoteCache, RemoteConfig, SyncDirection, SyncReport};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{
    ArtifactCache, ArtifactEntry, ArtifactType, CacheConfig, CacheLookup, CompressionAlgo,
    EvictionPolicy, StoreOrigin, VerifyReport,
};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss for key {0}")]
    Miss(String),

    #[error("corrupt cache entry {key}: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache index error: {0}")]
    Index(#[from] serde_json::Error),

    #[error("remote cache unavailable: {0}")]
    RemoteUnavailable(String),
}
