//! Coordinator configuration: `cyxmake.toml` tables with serde defaults.

use cyxmake_cache::{CompressionAlgo, EvictionPolicy};
use cyxmake_protocol::defaults;
use cyxmake_protocol::{AuthMethod, DistributionStrategy, LoadBalancing};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub transport: TransportSection,
    pub scheduler: SchedulerSection,
    pub cache: CacheSection,
    pub auth: AuthSection,
    pub registry: RegistrySection,
}

impl CoordinatorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` when given, otherwise `<home>/cyxmake.toml` if present,
    /// otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = cyxmake_logging::cyxmake_home().join("cyxmake.toml");
                if fallback.exists() {
                    Self::load(&fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub bind_addr: String,
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: defaults::DEFAULT_PORT,
            tls_cert: None,
            tls_key: None,
            max_connections: 64,
            max_frame_bytes: defaults::DEFAULT_MAX_FRAME_BYTES,
            send_queue_depth: defaults::DEFAULT_SEND_QUEUE_DEPTH,
            heartbeat_interval_secs: defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub load_balancing: LoadBalancing,
    pub default_strategy: DistributionStrategy,
    pub max_retries: u32,
    pub max_queue_length: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::LeastLoaded,
            default_strategy: DistributionStrategy::CompileUnits,
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            max_queue_length: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Empty means `<home>/cache`.
    pub dir: PathBuf,
    pub max_size_mb: u64,
    pub max_entries: usize,
    pub max_age_days: u64,
    pub compression: CompressionAlgo,
    pub compression_threshold: u64,
    pub eviction_policy: EvictionPolicy,
    pub remote_url: Option<String>,
    pub remote_read_only: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            max_size_mb: 10 * 1024,
            max_entries: 100_000,
            max_age_days: 30,
            compression: CompressionAlgo::Zstd,
            compression_threshold: defaults::DEFAULT_COMPRESSION_THRESHOLD,
            eviction_policy: EvictionPolicy::Lru,
            remote_url: None,
            remote_read_only: false,
        }
    }
}

impl CacheSection {
    pub fn resolved_dir(&self) -> PathBuf {
        if self.dir.as_os_str().is_empty() {
            cyxmake_logging::cyxmake_home().join("cache")
        } else {
            self.dir.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub method: AuthMethod,
    pub token: String,
    pub token_ttl_secs: Option<u64>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            method: AuthMethod::Token,
            token: String::new(),
            token_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub heartbeat_timeout_secs: u64,
    pub max_missed_heartbeats: u32,
    pub auto_remove_offline: bool,
    pub offline_removal_delay_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: defaults::DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_missed_heartbeats: defaults::DEFAULT_MAX_MISSED_HEARTBEATS,
            auto_remove_offline: true,
            offline_removal_delay_secs: defaults::DEFAULT_OFFLINE_REMOVAL_DELAY_SECS,
        }
    }
}
