use std::sync::Arc;

use tempfile::TempDir;

use crate::data_type::{LongType, StringType};
use crate::mvmap::MvMap;
use crate::store::Store;

fn open_store(dir: &TempDir) -> Store {
    Store::builder(dir.path().join("map.kdb"))
        .auto_commit_delay(0)
        .open()
        .expect("open store")
}

fn open_map(store: &Store) -> Arc<MvMap<i64, String>> {
    store
        .open_map("data", Arc::new(LongType), Arc::new(StringType))
        .expect("open map")
}

#[test]
fn test_put_get_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.put(1, "one".into()).unwrap(), None);
    assert_eq!(map.get(&1).unwrap(), Some("one".into()));
    assert_eq!(map.put(1, "uno".into()).unwrap(), Some("one".into()));
    assert_eq!(map.get(&1).unwrap(), Some("uno".into()));
    assert_eq!(map.remove(&1).unwrap(), Some("uno".into()));
    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.remove(&1).unwrap(), None);
}

#[test]
fn test_size_tracks_inserts_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    assert!(map.is_empty());
    for i in 0..100 {
        map.put(i, format!("value-{i}")).unwrap();
    }
    assert_eq!(map.size(), 100);
    for i in 0..50 {
        map.remove(&i).unwrap();
    }
    assert_eq!(map.size(), 50);
    // Overwrites do not change the size.
    map.put(99, "other".into()).unwrap();
    assert_eq!(map.size(), 50);
}

#[test]
fn test_splits_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    // Enough entries to force several page splits.
    let count = 5000i64;
    for i in 0..count {
        map.put(i, format!("value-{i:06}")).unwrap();
    }
    assert_eq!(map.size(), count as u64);

    let mut cursor = map.cursor(None).unwrap();
    let mut expected = 0i64;
    while let Some((k, v)) = cursor.next_entry().unwrap() {
        assert_eq!(k, expected);
        assert_eq!(v, format!("value-{expected:06}"));
        expected += 1;
    }
    assert_eq!(expected, count);

    // Spot-check lookups after splitting.
    assert_eq!(map.get(&0).unwrap(), Some("value-000000".into()));
    assert_eq!(map.get(&4999).unwrap(), Some("value-004999".into()));
    assert_eq!(map.first_key().unwrap(), Some(0));
    assert_eq!(map.last_key().unwrap(), Some(4999));
}

#[test]
fn test_bound_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    for i in [10i64, 20, 30, 40] {
        map.put(i, i.to_string()).unwrap();
    }
    assert_eq!(map.ceiling_key(&20).unwrap(), Some(20));
    assert_eq!(map.ceiling_key(&21).unwrap(), Some(30));
    assert_eq!(map.higher_key(&20).unwrap(), Some(30));
    assert_eq!(map.higher_key(&40).unwrap(), None);
    assert_eq!(map.floor_key(&20).unwrap(), Some(20));
    assert_eq!(map.floor_key(&19).unwrap(), Some(10));
    assert_eq!(map.lower_key(&20).unwrap(), Some(10));
    assert_eq!(map.lower_key(&10).unwrap(), None);
    assert_eq!(map.ceiling_key(&41).unwrap(), None);
}

#[test]
fn test_cursor_from_and_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    for i in 0..20i64 {
        map.put(i, i.to_string()).unwrap();
    }

    let mut cursor = map.cursor(Some(&15)).unwrap();
    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.next_entry().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, vec![15, 16, 17, 18, 19]);

    let root = map.current_root().root;
    let mut cursor = map.cursor_at(root, Some(&4), true).unwrap();
    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.next_entry().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, vec![4, 3, 2, 1, 0]);
}

#[test]
fn test_cursor_is_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map = open_map(&store);

    for i in 0..10i64 {
        map.put(i, i.to_string()).unwrap();
    }
    let mut cursor = map.cursor(None).unwrap();
    // Writes after cursor construction are invisible to it.
    map.put(100, "late".into()).unwrap();
    map.remove(&5).unwrap();

    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.next_entry().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_append_mode() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let map: Arc<MvMap<i64, String>> = store
        .open_map_single_writer("log", Arc::new(LongType), Arc::new(StringType))
        .unwrap();

    for i in 0..100i64 {
        map.append(i, format!("entry-{i}")).unwrap();
    }
    assert_eq!(map.size(), 100);
    assert_eq!(map.get(&42).unwrap(), Some("entry-42".into()));
    // Out-of-order append is rejected.
    assert!(map.append(5, "out of order".into()).is_err());
}
