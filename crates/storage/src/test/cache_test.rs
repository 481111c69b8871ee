use std::sync::Arc;

use crate::cache::{PageCache, TocCache};

fn entry(tag: u64) -> Arc<dyn std::any::Any + Send + Sync> {
    Arc::new(tag)
}

#[test]
fn test_put_get_remove() {
    let cache = PageCache::new(1024 * 1024, 4);
    cache.put(100, entry(1), 128);
    cache.put(200, entry(2), 128);

    let hit = cache.get(100).expect("cached");
    assert_eq!(*hit.downcast::<u64>().unwrap(), 1);
    cache.remove(100);
    assert!(cache.get(100).is_none());
    assert!(cache.get(200).is_some());
}

#[test]
fn test_miss_returns_none() {
    let cache = PageCache::new(1024 * 1024, 4);
    assert!(cache.get(42).is_none());
}

#[test]
fn test_eviction_bounds_weight() {
    // One segment so the budget is easy to reason about.
    let cache = PageCache::new(256 * 1024, 1);
    for i in 0..10_000u64 {
        cache.put(i, entry(i), 1024);
    }
    assert!(cache.used_bytes() <= 256 * 1024);
    // Something must have been evicted.
    let resident = (0..10_000u64).filter(|&i| cache.get(i).is_some()).count();
    assert!(resident < 10_000);
    assert!(resident > 0);
}

#[test]
fn test_rehit_survives_scan() {
    let cache = PageCache::new(64 * 1024, 1);
    cache.put(1, entry(1), 1024);
    // Re-reference so the entry becomes hot.
    for _ in 0..3 {
        assert!(cache.get(1).is_some());
    }
    // A scan of cold entries should not push the hot entry out.
    for i in 100..200u64 {
        cache.put(i, entry(i), 1024);
    }
    assert!(cache.get(1).is_some(), "hot entry evicted by a cold scan");
}

#[test]
fn test_clear() {
    let cache = PageCache::new(1024 * 1024, 2);
    cache.put(1, entry(1), 100);
    cache.put(2, entry(2), 100);
    cache.clear();
    assert!(cache.get(1).is_none());
    assert!(cache.get(2).is_none());
    assert_eq!(cache.used_bytes(), 0);
}

#[test]
fn test_toc_cache() {
    let cache = TocCache::new(1024 * 1024);
    let toc = Arc::new(vec![1u64, 2, 3]);
    cache.put(7, toc.clone());
    assert_eq!(cache.get(7).unwrap().as_slice(), &[1, 2, 3]);
    cache.remove(7);
    assert!(cache.get(7).is_none());
}
