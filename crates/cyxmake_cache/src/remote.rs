//! HTTP remote cache tier.
//!
//! The remote is a plain object store: `GET/HEAD/PUT <url>/artifacts/<key>`
//! carrying the raw (decompressed) artifact bytes. All failures surface as
//! [`CacheError::RemoteUnavailable`]; the caller decides whether to degrade.

use crate::{CacheError, Result};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://cache.internal:8443`.
    pub url: String,
    /// When set, `push_remote` and push-mode sync are refused locally.
    pub read_only: bool,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            read_only: false,
            timeout_secs: 30,
        }
    }
}

/// Direction of a reconcile pass over the local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Upload local entries the remote does not have.
    Push,
    /// Re-download entries whose local object file is missing.
    Pull,
    Both,
}

pub struct RemoteCache {
    client: reqwest::blocking::Client,
    config: RemoteConfig,
}

impl RemoteCache {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn read_only(&self) -> bool {
        self.config.read_only
    }

    fn artifact_url(&self, key: &str) -> String {
        format!("{}/artifacts/{}", self.config.url.trim_end_matches('/'), key)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let response = self
            .client
            .head(self.artifact_url(key))
            .send()
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        Ok(response.status().is_success())
    }

    /// Fetch the stored bytes; `None` when the remote does not have the key.
    pub fn download(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.artifact_url(key))
            .send()
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::RemoteUnavailable(format!(
                "GET {} returned {}",
                key,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        debug!("downloaded {} bytes for key {}", bytes.len(), key);
        Ok(Some(bytes.to_vec()))
    }

    pub fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.config.read_only {
            return Err(CacheError::RemoteUnavailable(
                "remote cache is read-only".to_string(),
            ));
        }
        let response = self
            .client
            .put(self.artifact_url(key))
            .body(bytes.to_vec())
            .send()
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CacheError::RemoteUnavailable(format!(
                "PUT {} returned {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Result of a `sync` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_url_joins_cleanly() {
        let remote = RemoteCache::new(RemoteConfig {
            url: "http://cache.local:9000/".to_string(),
            ..RemoteConfig::default()
        })
        .unwrap();
        assert_eq!(
            remote.artifact_url("abc123"),
            "http://cache.local:9000/artifacts/abc123"
        );
    }

    #[test]
    fn test_read_only_refuses_upload() {
        let remote = RemoteCache::new(RemoteConfig {
            url: "http://cache.local:9000".to_string(),
            read_only: true,
            ..RemoteConfig::default()
        })
        .unwrap();
        assert!(remote.upload("k", b"bytes").is_err());
    }
}
