//! Deterministic cache key generation.
//!
//! A key identifies a build artifact by everything that influences its
//! bytes: source content, compiler identity, flags, include paths, and the
//! target triple. Same inputs always produce the same key, across
//! processes and hosts.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Components are separated with ASCII Unit Separator (0x1f) so adjacent
/// fields cannot run together.
const SEP: u8 = 0x1f;

/// Inputs to key generation. Flag and include ordering is normalized
/// internally, so callers may pass them in any order.
#[derive(Debug, Clone)]
pub struct KeyInputs<'a> {
    pub source_contents: &'a [u8],
    pub compiler: &'a str,
    pub compiler_args: &'a [String],
    pub include_paths: &'a [PathBuf],
    pub target_triple: &'a str,
}

/// SHA-256 hex digest of raw bytes.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the cache key for one artifact.
pub fn generate_key(inputs: &KeyInputs<'_>) -> String {
    let source_hash = hash_bytes(inputs.source_contents);

    let mut args: Vec<&str> = inputs.compiler_args.iter().map(String::as_str).collect();
    args.sort_unstable();

    let mut includes: Vec<String> = inputs
        .include_paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    includes.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(source_hash.as_bytes());
    hasher.update([SEP]);
    hasher.update(inputs.compiler.as_bytes());
    hasher.update([SEP]);
    for arg in &args {
        hasher.update(arg.as_bytes());
        hasher.update([SEP]);
    }
    for include in &includes {
        hasher.update(include.as_bytes());
        hasher.update([SEP]);
    }
    hasher.update(inputs.target_triple.as_bytes());
    hex::encode(hasher.finalize())
}

/// Identity hash of a compiler invocation (path + version string).
pub fn compiler_hash(compiler: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(compiler.as_bytes());
    hasher.update([SEP]);
    hasher.update(version.as_bytes());
    hex::encode(hasher.finalize())
}
