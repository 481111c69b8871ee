use std::sync::Arc;

use kurodb_storage::{DataType, LongType, Store, StringType};
use tempfile::TempDir;

use crate::error::TxError;
use crate::store::{IsolationLevel, TransactionStore};
use crate::transaction::{InDoubtState, TxStatus};

fn open_store(dir: &TempDir) -> Store {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Store::builder(dir.path().join("tx.kdb"))
        .auto_commit_delay(0)
        .open()
        .expect("open store")
}

fn tx_store(store: &Store) -> TransactionStore {
    TransactionStore::new(store.clone()).expect("transaction store")
}

fn key_type() -> Arc<dyn DataType<i64>> {
    Arc::new(LongType)
}

fn value_type() -> Arc<dyn DataType<String>> {
    Arc::new(StringType)
}

#[test]
fn test_commit_makes_writes_visible() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "hello".into()).unwrap();

    // Uncommitted writes are visible to the writer only.
    assert_eq!(map.get(&1).unwrap(), Some("hello".into()));
    let other = ts.begin().unwrap();
    let other_map = other.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(other_map.get(&1).unwrap(), None);

    tx.commit().unwrap();
    assert_eq!(other_map.get(&1).unwrap(), Some("hello".into()));
    other.rollback().unwrap();
}

#[test]
fn test_rollback_restores_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "original".into()).unwrap();
    setup.commit().unwrap();

    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "changed".into()).unwrap();
    map.put(2, "new".into()).unwrap();
    map.remove(&1).unwrap();
    tx.rollback().unwrap();

    let check = ts.begin().unwrap();
    let map = check.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some("original".into()));
    assert_eq!(map.get(&2).unwrap(), None);
    check.rollback().unwrap();
}

#[test]
fn test_read_your_writes_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "committed".into()).unwrap();
    setup.commit().unwrap();

    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    map.remove(&1).unwrap();
    assert_eq!(map.get(&1).unwrap(), None, "own delete visible");

    let other = ts.begin().unwrap();
    let other_map = other.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(
        other_map.get(&1).unwrap(),
        Some("committed".into()),
        "tombstone invisible to others"
    );
    tx.rollback().unwrap();
    other.rollback().unwrap();
}

#[test]
fn test_snapshot_isolation_repeatable_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    map.put(42, "old".into()).unwrap();
    setup.commit().unwrap();
    store.commit().unwrap();

    let reader = ts.begin_with(IsolationLevel::RepeatableRead, 1000).unwrap();
    let reader_map = reader.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(reader_map.get(&42).unwrap(), Some("old".into()));

    let writer = ts.begin().unwrap();
    let writer_map = writer.open_map("t", key_type(), value_type()).unwrap();
    writer_map.put(42, "new".into()).unwrap();
    writer.commit().unwrap();
    store.commit().unwrap();

    // The repeatable reader keeps seeing the pre-image.
    assert_eq!(reader_map.get(&42).unwrap(), Some("old".into()));
    // A read-committed reader sees the new value.
    let rc = ts.begin().unwrap();
    let rc_map = rc.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(rc_map.get(&42).unwrap(), Some("new".into()));
    rc.rollback().unwrap();
    reader.rollback().unwrap();
}

#[test]
fn test_lock_contention_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "value".into()).unwrap();
    setup.commit().unwrap();

    let holder = ts.begin_with(IsolationLevel::ReadCommitted, 200).unwrap();
    let holder_map = holder.open_map("t", key_type(), value_type()).unwrap();
    holder_map.lock(&1, 200).unwrap();

    let blocked = ts.begin_with(IsolationLevel::ReadCommitted, 200).unwrap();
    let blocked_map = blocked.open_map("t", key_type(), value_type()).unwrap();
    match blocked_map.put(1, "other".into()) {
        Err(TxError::TxLocked { owner }) => assert_eq!(owner, holder.id()),
        other => panic!("expected a lock timeout, got {other:?}"),
    }

    // Non-waiting lock reports the conflict as a miss.
    assert_eq!(blocked_map.lock(&1, -2).unwrap(), None);

    holder.rollback().unwrap();
    // With the holder gone the write goes through.
    blocked_map.put(1, "other".into()).unwrap();
    blocked.commit().unwrap();
}

#[test]
fn test_deadlock_detection() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    map.put(1, "one".into()).unwrap();
    map.put(2, "two".into()).unwrap();
    setup.commit().unwrap();

    let tx_a = ts.begin_with(IsolationLevel::ReadCommitted, 10_000).unwrap();
    let tx_b = ts.begin_with(IsolationLevel::ReadCommitted, 10_000).unwrap();
    let map_a = tx_a.open_map("t", key_type(), value_type()).unwrap();
    let map_b = tx_b.open_map("t", key_type(), value_type()).unwrap();

    map_a.lock(&1, 1000).unwrap();
    map_b.lock(&2, 1000).unwrap();

    // tx_a blocks on key 2 in another thread, then tx_b closes the cycle.
    let ts_clone = ts.clone();
    let a_handle = std::thread::spawn(move || {
        let map_a = tx_a.open_map("t", key_type(), value_type()).unwrap();
        let result = map_a.put(2, "a wants this".into());
        (tx_a, result)
    });
    let _ = ts_clone; // keep the clone alive for the thread's duration

    let result_b = map_b.put(1, "b wants this".into());
    match result_b {
        Err(TxError::TxDeadlock { chain }) => {
            assert!(chain.contains(&tx_b.id()));
            tx_b.rollback().unwrap();
        }
        Ok(_) => {
            // tx_b won; then tx_a must have been the victim.
            tx_b.rollback().unwrap();
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let (tx_a, result_a) = a_handle.join().unwrap();
    match result_a {
        Ok(_) => tx_a.commit().unwrap(),
        Err(TxError::TxDeadlock { .. }) => tx_a.rollback().unwrap(),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_savepoint_partial_rollback() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let tx = ts.begin()?;
    let map = tx.open_map("t", key_type(), value_type())?;
    map.put(1, "keep".into())?;
    let savepoint = tx.set_savepoint();
    map.put(2, "discard".into())?;
    map.put(1, "discard-too".into())?;

    tx.rollback_to_savepoint(savepoint)?;
    assert_eq!(map.get(&1)?, Some("keep".into()));
    assert_eq!(map.get(&2)?, None);

    tx.commit()?;
    let check = ts.begin()?;
    let map = check.open_map("t", key_type(), value_type())?;
    assert_eq!(map.get(&1)?, Some("keep".into()));
    assert_eq!(map.get(&2)?, None);
    check.rollback()?;
    Ok(())
}

#[test]
fn test_entry_iteration_respects_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let setup = ts.begin().unwrap();
    let map = setup.open_map("t", key_type(), value_type()).unwrap();
    for i in 0..10i64 {
        map.put(i, format!("v{i}")).unwrap();
    }
    setup.commit().unwrap();

    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    map.remove(&3).unwrap();
    map.put(100, "own".into()).unwrap();

    let mut keys = Vec::new();
    let mut iter = map.entries(None).unwrap();
    while let Some((k, _)) = iter.next_entry().unwrap() {
        keys.push(k);
    }
    assert_eq!(keys, vec![0, 1, 2, 4, 5, 6, 7, 8, 9, 100]);
    assert_eq!(map.size().unwrap(), 10);
    tx.rollback().unwrap();
}

#[test]
fn test_uncommitted_iterator_sees_foreign_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ts = tx_store(&store);

    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    map.put(5, "pending".into()).unwrap();

    let other = ts.begin().unwrap();
    let other_map = other.open_map("t", key_type(), value_type()).unwrap();
    let mut iter = other_map.key_iterator_uncommitted(None).unwrap();
    let (key, owner, committed) = iter.next_key().unwrap().expect("pending key visible");
    assert_eq!(key, 5);
    assert_eq!(owner, tx.id());
    assert!(!committed);

    tx.rollback().unwrap();
    other.rollback().unwrap();
}

#[test]
fn test_prepare_and_in_doubt_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let name;
    {
        let store = open_store(&dir);
        let ts = tx_store(&store);
        let tx = ts.begin().unwrap();
        let map = tx.open_map("t", key_type(), value_type()).unwrap();
        map.put(1, "prepared write".into()).unwrap();
        tx.set_name("x42");
        tx.prepare().unwrap();
        name = tx.name();
        assert_eq!(tx.status(), TxStatus::Prepared);
        // Simulated crash: the store is dropped without commit/rollback
        // of the prepared transaction.
        store.close().unwrap();
    }
    assert_eq!(name.as_deref(), Some("x42"));

    let store = open_store(&dir);
    let ts = tx_store(&store);
    let mut in_doubt = ts.in_doubt_transactions();
    assert_eq!(in_doubt.len(), 1);
    let tx = &mut in_doubt[0];
    assert_eq!(tx.transaction_name().as_deref(), Some("x42"));
    assert_eq!(tx.state(), InDoubtState::InDoubt);

    // The involved map must be open before resolution.
    let opener = ts.begin().unwrap();
    let map = opener.open_map("t", key_type(), value_type()).unwrap();
    tx.set_state(InDoubtState::Commit).unwrap();

    assert_eq!(map.get(&1).unwrap(), Some("prepared write".into()));
    assert!(ts.in_doubt_transactions().is_empty());
    opener.rollback().unwrap();
}

#[test]
fn test_unprepared_transaction_discarded_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir);
        let ts = tx_store(&store);
        let tx = ts.begin().unwrap();
        let map = tx.open_map("t", key_type(), value_type()).unwrap();
        map.put(1, "never committed".into()).unwrap();
        // Force the uncommitted state to disk, then "crash".
        store.commit().unwrap();
        store.close().unwrap();
        drop(tx);
    }

    let store = open_store(&dir);
    let ts = tx_store(&store);
    let tx = ts.begin().unwrap();
    let map = tx.open_map("t", key_type(), value_type()).unwrap();
    assert_eq!(map.get(&1).unwrap(), None, "dead uncommitted write leaked");
    tx.rollback().unwrap();
}
