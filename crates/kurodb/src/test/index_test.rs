use std::sync::Arc;

use kurodb_storage::{Store, Value};
use kurodb_tx::TransactionStore;
use tempfile::TempDir;

use crate::bulk::BufferedRows;
use crate::delegate::DelegateIndex;
use crate::error::IndexError;
use crate::index::Index;
use crate::primary::PrimaryIndex;
use crate::secondary::SecondaryIndex;

fn open(dir: &TempDir) -> (Store, TransactionStore) {
    let store = Store::builder(dir.path().join("idx.kdb"))
        .auto_commit_delay(0)
        .open()
        .expect("open store");
    let ts = TransactionStore::new(store.clone()).expect("tx store");
    (store, ts)
}

fn row(key: i64, name: &str, age: i64) -> Vec<Value> {
    vec![
        Value::Long(key),
        Value::String(name.to_string()),
        Value::Long(age),
    ]
}

#[test]
fn test_primary_index_crud() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let primary = PrimaryIndex::open(&tx, "t.data").unwrap();

    let k1 = primary.insert(row(0, "alice", 30)).unwrap();
    let k2 = primary.insert(row(0, "bob", 40)).unwrap();
    assert!(k2 > k1);

    assert_eq!(
        primary.get(k1).unwrap().unwrap()[1],
        Value::String("alice".into())
    );
    primary.update(k1, row(k1, "alice", 31)).unwrap();
    assert_eq!(primary.get(k1).unwrap().unwrap()[2], Value::Long(31));

    match primary.update(999, row(999, "ghost", 0)) {
        Err(IndexError::RowNotFound { key }) => assert_eq!(key, 999),
        other => panic!("expected RowNotFound, got {other:?}"),
    }

    primary.delete(k2).unwrap();
    assert_eq!(primary.get(k2).unwrap(), None);
    match primary.delete(k2) {
        Err(IndexError::RowNotFound { .. }) => {}
        other => panic!("expected RowNotFound, got {other:?}"),
    }
    tx.commit().unwrap();
}

#[test]
fn test_primary_duplicate_detection() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);

    let tx = ts.begin().unwrap();
    let primary = PrimaryIndex::open(&tx, "t.data").unwrap();
    primary.add(1, &row(1, "alice", 30)).unwrap();
    tx.commit().unwrap();

    let tx = ts.begin().unwrap();
    let primary = PrimaryIndex::open(&tx, "t.data").unwrap();
    match primary.add(1, &row(1, "impostor", 0)) {
        Err(IndexError::DuplicateKey { .. }) => {}
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    tx.rollback().unwrap();
}

#[test]
fn test_primary_key_allocation_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let last;
    {
        let (store, ts) = open(&dir);
        let tx = ts.begin().unwrap();
        let primary = PrimaryIndex::open(&tx, "t.data").unwrap();
        primary.insert(row(0, "a", 1)).unwrap();
        last = primary.insert(row(0, "b", 2)).unwrap();
        tx.commit().unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }
    let (_store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let primary = PrimaryIndex::open(&tx, "t.data").unwrap();
    let next = primary.insert(row(0, "c", 3)).unwrap();
    assert!(next > last);
    tx.commit().unwrap();
}

#[test]
fn test_secondary_index_find() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let index = SecondaryIndex::open(&tx, "t.by_name", vec![1], false).unwrap();

    index.add(1, &row(1, "alice", 30)).unwrap();
    index.add(2, &row(2, "bob", 40)).unwrap();
    index.add(3, &row(3, "alice", 50)).unwrap();

    let mut hits = index.find(&row(0, "alice", 0)).unwrap();
    hits.sort();
    assert_eq!(hits, vec![1, 3]);
    assert_eq!(index.find(&row(0, "carol", 0)).unwrap(), Vec::<i64>::new());

    index.remove(1, &row(1, "alice", 30)).unwrap();
    assert_eq!(index.find(&row(0, "alice", 0)).unwrap(), vec![3]);
    tx.commit().unwrap();
}

#[test]
fn test_unique_secondary_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);

    // Committed duplicate.
    let tx = ts.begin().unwrap();
    let index = SecondaryIndex::open(&tx, "t.uq", vec![1], true).unwrap();
    index.add(1, &row(1, "x", 1)).unwrap();
    tx.commit().unwrap();

    let tx_b = ts.begin().unwrap();
    let index_b = SecondaryIndex::open(&tx_b, "t.uq", vec![1], true).unwrap();
    match index_b.add(2, &row(2, "x", 2)) {
        Err(IndexError::DuplicateKey { .. }) => {}
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    // A different value is fine.
    index_b.add(2, &row(2, "y", 2)).unwrap();
    tx_b.commit().unwrap();
}

#[test]
fn test_unique_secondary_concurrent_update() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);

    // Transaction A inserts "x" but does not commit yet.
    let tx_a = ts.begin().unwrap();
    let index_a = SecondaryIndex::open(&tx_a, "t.uq", vec![1], true).unwrap();
    index_a.add(1, &row(1, "x", 1)).unwrap();

    // Transaction B colliding on the same unique value observes the
    // uncommitted conflict.
    let tx_b = ts.begin().unwrap();
    let index_b = SecondaryIndex::open(&tx_b, "t.uq", vec![1], true).unwrap();
    match index_b.add(2, &row(2, "x", 2)) {
        Err(IndexError::ConcurrentUpdate { .. }) => {}
        other => panic!("expected ConcurrentUpdate, got {other:?}"),
    }

    // After A commits, a retry sees a hard duplicate.
    tx_a.commit().unwrap();
    match index_b.add(2, &row(2, "x", 2)) {
        Err(IndexError::DuplicateKey { .. }) => {}
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    tx_b.rollback().unwrap();
}

#[test]
fn test_own_writes_do_not_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let index = SecondaryIndex::open(&tx, "t.uq", vec![1], true).unwrap();

    index.add(1, &row(1, "x", 1)).unwrap();
    // Updating the same row within the same transaction: remove + add.
    index.remove(1, &row(1, "x", 1)).unwrap();
    index.add(1, &row(1, "x", 99)).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_delegate_index_forwards() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let primary = Arc::new(PrimaryIndex::open(&tx, "t.data").unwrap());
    primary.add(5, &row(5, "alice", 30)).unwrap();

    let delegate = DelegateIndex::new("t.pk", primary.clone(), 0);
    assert_eq!(delegate.find(&vec![Value::Long(5)]).unwrap(), vec![5]);
    assert_eq!(delegate.find(&vec![Value::Long(6)]).unwrap(), Vec::<i64>::new());
    assert_eq!(delegate.entry_count().unwrap(), 1);
    tx.commit().unwrap();
}

#[test]
fn test_bulk_build_merges_sorted_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (store, ts) = open(&dir);
    let tx = ts.begin().unwrap();
    let index = SecondaryIndex::open(&tx, "t.by_age", vec![2], false).unwrap();

    let mut bulk = BufferedRows::new(store.clone(), vec![2], 1);
    // Insert in descending order so the merge has to re-sort.
    for i in (0..500i64).rev() {
        bulk.add(i, &row(i, "name", i % 17)).unwrap();
    }
    let added = bulk.build_into(&index).unwrap();
    assert_eq!(added, 500);

    let hits = index.find(&vec![Value::Null, Value::Null, Value::Long(3)]).unwrap();
    assert_eq!(hits.len(), 500 / 17 + usize::from(3 < 500 % 17));
    tx.commit().unwrap();

    // Temporary maps are gone.
    for name in store.map_names().unwrap() {
        assert!(!name.starts_with("temp.bulk."), "leftover {name}");
    }
}
