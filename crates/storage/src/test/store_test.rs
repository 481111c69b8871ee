use std::sync::Arc;

use tempfile::TempDir;

use crate::data_type::{LongType, StringType};
use crate::store::Store;

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("store.kdb")
}

fn open(dir: &TempDir) -> Store {
    Store::builder(store_path(dir))
        .auto_commit_delay(0)
        .open()
        .expect("open store")
}

#[test]
fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(&dir);
        let map = store
            .open_map("kv", Arc::new(LongType), Arc::new(StringType))
            .unwrap();
        for i in 0..500i64 {
            map.put(i, format!("value-{i}")).unwrap();
        }
        let version = store.commit().unwrap();
        assert!(version > 0);
        store.close().unwrap();
    }

    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    assert_eq!(map.size(), 500);
    for i in (0..500i64).step_by(17) {
        assert_eq!(map.get(&i).unwrap(), Some(format!("value-{i}")));
    }
}

#[test]
fn test_multiple_commits_advance_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();

    map.put(1, "a".into()).unwrap();
    let v1 = store.commit().unwrap();
    map.put(2, "b".into()).unwrap();
    let v2 = store.commit().unwrap();
    assert!(v2 > v1);
    // Further commits may flush occupancy bookkeeping but never lose
    // data or go backwards.
    let v3 = store.commit().unwrap();
    assert!(v3 >= v2);
    assert_eq!(map.get(&1).unwrap(), Some("a".into()));
    assert_eq!(map.get(&2).unwrap(), Some("b".into()));
}

#[test]
fn test_rollback_discards_uncommitted() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();

    map.put(1, "committed".into()).unwrap();
    store.commit().unwrap();
    map.put(1, "uncommitted".into()).unwrap();
    map.put(2, "extra".into()).unwrap();
    store.rollback().unwrap();

    assert_eq!(map.get(&1).unwrap(), Some("committed".into()));
    assert_eq!(map.get(&2).unwrap(), None);
}

#[test]
fn test_rollback_to_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();

    for i in 0..10i64 {
        map.put(i, "first".into()).unwrap();
    }
    let v1 = store.commit().unwrap();
    for i in 10..20i64 {
        map.put(i, "second".into()).unwrap();
    }
    store.commit().unwrap();
    assert_eq!(map.size(), 20);

    store.rollback_to(v1).unwrap();
    assert_eq!(store.current_version(), v1);
    assert_eq!(map.size(), 10);
    assert_eq!(map.get(&15).unwrap(), None);
    assert_eq!(map.get(&5).unwrap(), Some("first".into()));
}

#[test]
fn test_rollback_to_zero_empties_user_maps() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    map.put(1, "x".into()).unwrap();
    store.commit().unwrap();

    store.rollback_to(0).unwrap();
    assert_eq!(store.current_version(), 0);
    assert!(map.is_empty());
    // The store stays usable afterwards.
    map.put(2, "y".into()).unwrap();
    store.commit().unwrap();
    assert_eq!(map.get(&2).unwrap(), Some("y".into()));
}

#[test]
fn test_map_names_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let _a = store
        .open_map("alpha", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    let _b = store
        .open_map("beta", Arc::new(LongType), Arc::new(StringType))
        .unwrap();

    let mut names = store.map_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    assert!(store.has_map("alpha").unwrap());

    store.remove_map("alpha").unwrap();
    assert!(!store.has_map("alpha").unwrap());
    assert_eq!(store.map_names().unwrap(), vec!["beta".to_string()]);
}

#[test]
fn test_map_ids_are_stable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = open(&dir);
        let map = store
            .open_map("kv", Arc::new(LongType), Arc::new(StringType))
            .unwrap();
        map.put(1, "x".into()).unwrap();
        store.commit().unwrap();
        let id = map.id();
        store.close().unwrap();
        id
    };
    let store = open(&dir);
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    assert_eq!(map.id(), id);
}

#[test]
fn test_second_open_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let err = Store::builder(store_path(&dir))
        .auto_commit_delay(0)
        .open();
    assert!(err.is_err());
    drop(store);
}

#[test]
fn test_store_header_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let header = store.store_header();
    assert_eq!(header.get("H").map(String::as_str), Some("2"));
    assert_eq!(header.get("blockSize").map(String::as_str), Some("1000"));
    assert!(header.contains_key("format"));
    assert!(header.contains_key("created"));
}

#[test]
fn test_compressed_store_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::builder(store_path(&dir))
            .auto_commit_delay(0)
            .compress(true)
            .open()
            .unwrap();
        let map = store
            .open_map("kv", Arc::new(LongType), Arc::new(StringType))
            .unwrap();
        for i in 0..1000i64 {
            map.put(i, format!("all work and no play {i}").repeat(4)).unwrap();
        }
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = Store::builder(store_path(&dir))
        .auto_commit_delay(0)
        .compress(true)
        .open()
        .unwrap();
    let map = store
        .open_map("kv", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    assert_eq!(map.size(), 1000);
    assert_eq!(
        map.get(&7).unwrap(),
        Some("all work and no play 7".repeat(4))
    );
}

#[test]
fn test_encrypted_store_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let key = b"correct horse battery staple".to_vec();
    {
        let store = Store::builder(store_path(&dir))
            .auto_commit_delay(0)
            .encryption_key(key.clone())
            .open()
            .unwrap();
        let map = store
            .open_map("secret", Arc::new(LongType), Arc::new(StringType))
            .unwrap();
        map.put(1, "classified".into()).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let store = Store::builder(store_path(&dir))
        .auto_commit_delay(0)
        .encryption_key(key)
        .open()
        .unwrap();
    let map = store
        .open_map("secret", Arc::new(LongType), Arc::new(StringType))
        .unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("classified".into()));
}
