//! End-to-end cache behavior over a real temp directory.

use cyxmake_cache::{
    generate_key, hash_bytes, ArtifactCache, ArtifactType, CacheConfig, CacheLookup, KeyInputs,
    StoreOrigin,
};
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_store_lookup_retrieve_cycle() {
    let dir = TempDir::new().unwrap();
    let cache = ArtifactCache::open(CacheConfig::new(dir.path())).unwrap();

    // Key derived from the compile inputs, content stored under it.
    let args = vec!["-O2".to_string()];
    let includes: Vec<PathBuf> = vec![PathBuf::from("/usr/include")];
    let key = generate_key(&KeyInputs {
        source_contents: b"int add(int a, int b) { return a + b; }\n",
        compiler: "cc",
        compiler_args: &args,
        include_paths: &includes,
        target_triple: "x86_64-unknown-linux-gnu",
    });

    let content = b"OBJ\0\x01";
    let entry = cache
        .store_from(
            &key,
            content,
            ArtifactType::Object,
            StoreOrigin {
                source_hash: hash_bytes(b"int add(int a, int b) { return a + b; }\n"),
                compiler_hash: String::new(),
                producer_host: Some("worker-1".to_string()),
                build_id: None,
            },
        )
        .unwrap();

    assert_eq!(cache.lookup(&key), CacheLookup::HitLocal);

    let out = dir.path().join("tmp").join("out.o");
    cache.retrieve(&key, &out).unwrap();
    let retrieved = std::fs::read(&out).unwrap();
    assert_eq!(retrieved, content);
    assert_eq!(hash_bytes(&retrieved), entry.content_hash);
}

#[test]
fn test_key_stability_across_cache_instances() {
    let args = vec!["-Wall".to_string(), "-O2".to_string()];
    let includes: Vec<PathBuf> = Vec::new();
    let inputs = KeyInputs {
        source_contents: b"static int x;\n",
        compiler: "clang",
        compiler_args: &args,
        include_paths: &includes,
        target_triple: "aarch64-apple-darwin",
    };

    // Two independent "processes": the key function carries no state.
    let first = generate_key(&inputs);
    let second = generate_key(&inputs);
    assert_eq!(first, second);

    // And an entry stored under it is found again after reopen.
    let dir = TempDir::new().unwrap();
    {
        let cache = ArtifactCache::open(CacheConfig::new(dir.path())).unwrap();
        cache.store(&first, b"obj", ArtifactType::Object).unwrap();
    }
    let cache = ArtifactCache::open(CacheConfig::new(dir.path())).unwrap();
    assert_eq!(cache.lookup(&second), CacheLookup::HitLocal);
}

#[test]
fn test_stats_reflect_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = ArtifactCache::open(CacheConfig::new(dir.path())).unwrap();

    cache.store("k", b"bytes", ArtifactType::Object).unwrap();
    cache.lookup("k");
    cache.lookup("k");
    cache.lookup("missing");

    let stats = cache.stats();
    assert_eq!(stats.hits_local, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.stores, 1);
}
