use ad_session::AdError;
use ad_session::cache::{AssetCache, CacheKey, sha256_hex};
use ad_session::creative::AssetRef;

const MB: u64 = 1024 * 1024;

fn asset(name: &str) -> AssetRef {
    AssetRef::new(format!("https://cdn.example/{}", name))
}

#[test]
fn test_put_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), MB).unwrap();

    let data = b"creative bytes";
    let hero = asset("hero.png").with_sha256(sha256_hex(data)).with_size(data.len() as u64);
    let stored = cache.put(&hero, data).unwrap();

    assert_eq!(stored.size, data.len() as u64);
    assert_eq!(stored.sha256, sha256_hex(data));
    assert!(stored.path.starts_with(dir.path()));
    assert_eq!(stored.path.extension().unwrap(), "png");
    assert_eq!(std::fs::read(&stored.path).unwrap(), data);

    let key = CacheKey::from(&hero);
    assert!(cache.contains(&key));
    assert_eq!(cache.get(&key).unwrap().path, stored.path);
    assert_eq!(cache.total_bytes(), data.len() as u64);

    // Same URL with a different declared hash is a different entry.
    assert!(!cache.contains(&CacheKey::new(hero.url.clone(), None)));
}

#[test]
fn test_put_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), MB).unwrap();

    let first = cache.put(&asset("a.mp4"), b"first").unwrap();
    let second = cache.put(&asset("a.mp4"), b"second copy").unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_bytes(), 5);
    assert_eq!(std::fs::read(&second.path).unwrap(), b"first");
}

#[test]
fn test_integrity_mismatch_is_not_stored() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), MB).unwrap();

    let declared = asset("a.mp4").with_sha256(sha256_hex(b"H1"));
    let err = cache.put(&declared, b"H2").unwrap_err();

    assert!(matches!(err, AdError::AssetIntegrityMismatch { .. }));
    assert!(cache.is_empty());
    assert!(cache.get(&CacheKey::from(&declared)).is_none());
}

#[test]
fn test_lru_eviction_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), 10).unwrap();

    let a = cache.put(&asset("a.bin"), b"aaaa").unwrap();
    cache.put(&asset("b.bin"), b"bbbb").unwrap();

    // Touch a so b becomes the least recently used.
    assert!(cache.get(&CacheKey::from(&asset("a.bin"))).is_some());
    cache.put(&asset("c.bin"), b"cccc").unwrap();

    assert!(cache.contains(&CacheKey::from(&asset("a.bin"))));
    assert!(!cache.contains(&CacheKey::from(&asset("b.bin"))));
    assert!(cache.contains(&CacheKey::from(&asset("c.bin"))));
    assert_eq!(cache.total_bytes(), 8);
    assert!(a.path.exists());
}

#[test]
fn test_pinned_entries_survive_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), 10).unwrap();

    let pinned = CacheKey::from(&asset("a.bin"));
    cache.pin(&pinned);
    cache.put(&asset("a.bin"), b"aaaa").unwrap();
    cache.put(&asset("b.bin"), b"bbbb").unwrap();
    cache.put(&asset("c.bin"), b"cccc").unwrap();

    assert!(cache.contains(&pinned));
    assert!(!cache.contains(&CacheKey::from(&asset("b.bin"))));
    assert!(!cache.evict(&pinned));

    cache.unpin(&pinned);
    assert_eq!(cache.pin_count(&pinned), 0);
    assert!(cache.evict(&pinned));
    assert!(!cache.evict(&pinned));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_unpin_eviction_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AssetCache::open(dir.path(), 10).unwrap();
    let index = dir.path().join("index.json");

    let names = ["a.bin", "b.bin", "c.bin"];
    for name in names {
        cache.pin(&CacheKey::from(&asset(name)));
    }
    for name in names {
        cache.put(&asset(name), b"xxxx").unwrap();
    }
    assert_eq!(cache.total_bytes(), 12);
    assert!(std::fs::read_to_string(&index).unwrap().contains("https://cdn.example/a.bin"));

    cache.unpin(&CacheKey::from(&asset("a.bin")));

    assert!(!cache.contains(&CacheKey::from(&asset("a.bin"))));
    let persisted = std::fs::read_to_string(&index).unwrap();
    assert!(!persisted.contains("https://cdn.example/a.bin"));
    assert!(persisted.contains("https://cdn.example/b.bin"));
    assert!(persisted.contains("https://cdn.example/c.bin"));
}

#[test]
fn test_index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let kept = asset("kept.mp4");
    let lost = asset("lost.mp4");

    let lost_path = {
        let cache = AssetCache::open(dir.path(), MB).unwrap();
        cache.put(&kept, b"kept").unwrap();
        cache.put(&lost, b"lost").unwrap().path
    };
    std::fs::remove_file(lost_path).unwrap();

    let reopened = AssetCache::open(dir.path(), MB).unwrap();
    assert_eq!(reopened.len(), 1);
    let entry = reopened.get(&CacheKey::from(&kept)).unwrap();
    assert_eq!(entry.sha256, sha256_hex(b"kept"));
    assert!(!reopened.contains(&CacheKey::from(&lost)));
    assert_eq!(reopened.total_bytes(), 4);
}

#[test]
fn test_corrupt_index_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.json"), b"{ not json").unwrap();

    let cache = AssetCache::open(dir.path(), MB).unwrap();
    assert!(cache.is_empty());
    cache.put(&asset("a.png"), b"png").unwrap();
    assert_eq!(cache.len(), 1);
}
