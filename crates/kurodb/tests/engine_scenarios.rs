//! End-to-end engine scenarios across the full stack: unique-index
//! conflicts, deadlock resolution, snapshot isolation, and in-doubt
//! transaction recovery.

use std::sync::Arc;

use kurodb::{
    DataType, InDoubtState, Index, IndexError, IsolationLevel, LongType, PrimaryIndex,
    SecondaryIndex, Store, StringType, TransactionStore, TxError, Value,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> (Store, TransactionStore) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Store::builder(dir.path().join("engine.kdb"))
        .auto_commit_delay(0)
        .open()
        .expect("open store");
    let ts = TransactionStore::new(store.clone()).expect("tx store");
    (store, ts)
}

fn person(key: i64, name: &str) -> Vec<Value> {
    vec![Value::Long(key), Value::String(name.to_string())]
}

/// Unique secondary index conflict: B collides with A's uncommitted row
/// and observes `ConcurrentUpdate`; after A commits, the retry observes
/// `DuplicateKey`.
#[test]
fn unique_secondary_index_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);

    let tx_a = ts.begin().unwrap();
    let primary_a = PrimaryIndex::open(&tx_a, "people.data").unwrap();
    let unique_a = SecondaryIndex::open(&tx_a, "people.name", vec![1], true).unwrap();
    primary_a.add(1, &person(1, "x")).unwrap();
    unique_a.add(1, &person(1, "x")).unwrap();

    let tx_b = ts.begin().unwrap();
    let primary_b = PrimaryIndex::open(&tx_b, "people.data").unwrap();
    let unique_b = SecondaryIndex::open(&tx_b, "people.name", vec![1], true).unwrap();
    primary_b.add(2, &person(2, "x")).unwrap();
    match unique_b.add(2, &person(2, "x")) {
        Err(IndexError::ConcurrentUpdate { .. }) => {}
        other => panic!("expected ConcurrentUpdate, got {other:?}"),
    }

    tx_a.commit().unwrap();
    match unique_b.add(2, &person(2, "x")) {
        Err(IndexError::DuplicateKey { .. }) => {}
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
    tx_b.rollback().unwrap();
}

/// Two transactions locking rows in opposite order: exactly one receives
/// `TxDeadlock`, the other finishes once the victim rolls back.
#[test]
fn deadlock_between_two_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, ts) = open(&dir);

    let setup = ts.begin().unwrap();
    let map = setup
        .open_map(
            "rows",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    map.put(1, "one".into()).unwrap();
    map.put(2, "two".into()).unwrap();
    setup.commit().unwrap();

    let tx_a = ts.begin_with(IsolationLevel::ReadCommitted, 10_000).unwrap();
    let tx_b = ts.begin_with(IsolationLevel::ReadCommitted, 10_000).unwrap();
    let map_a = tx_a
        .open_map(
            "rows",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    let map_b = tx_b
        .open_map(
            "rows",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();

    map_a.lock(&1, 1000).unwrap();
    map_b.lock(&2, 1000).unwrap();

    let a_thread = std::thread::spawn(move || {
        let result = map_a.lock(&2, 10_000);
        (tx_a, result)
    });

    let result_b = map_b.lock(&1, 10_000);
    let mut deadlocks = 0;
    match result_b {
        Err(TxError::TxDeadlock { .. }) => {
            deadlocks += 1;
            tx_b.rollback().unwrap();
        }
        Ok(_) => tx_b.commit().unwrap(),
        other => panic!("unexpected outcome for B: {other:?}"),
    }

    let (tx_a, result_a) = a_thread.join().unwrap();
    match result_a {
        Err(TxError::TxDeadlock { .. }) => {
            deadlocks += 1;
            tx_a.rollback().unwrap();
        }
        Ok(_) => tx_a.commit().unwrap(),
        other => panic!("unexpected outcome for A: {other:?}"),
    }

    assert_eq!(deadlocks, 1, "exactly one transaction must be the victim");
}

/// Snapshot isolation: a repeatable-read transaction keeps seeing the
/// pre-image of a key another transaction overwrites and commits.
#[test]
fn snapshot_isolation_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (store, ts) = open(&dir);

    let setup = ts.begin().unwrap();
    let map = setup
        .open_map(
            "kv",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    map.put(42, "old".into()).unwrap();
    setup.commit().unwrap();
    store.commit().unwrap();

    let tx_a = ts
        .begin_with(IsolationLevel::RepeatableRead, 1_000)
        .unwrap();
    let map_a = tx_a
        .open_map(
            "kv",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    assert_eq!(map_a.get(&42).unwrap(), Some("old".into()));

    let tx_b = ts.begin().unwrap();
    let map_b = tx_b
        .open_map(
            "kv",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    map_b.put(42, "new".into()).unwrap();
    tx_b.commit().unwrap();
    store.commit().unwrap();

    // A keeps its snapshot until it ends.
    assert_eq!(map_a.get(&42).unwrap(), Some("old".into()));
    tx_a.rollback().unwrap();

    let tx_c = ts.begin().unwrap();
    let map_c = tx_c
        .open_map(
            "kv",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    assert_eq!(map_c.get(&42).unwrap(), Some("new".into()));
    tx_c.rollback().unwrap();
}

/// In-doubt recovery: a prepared transaction survives a restart, shows up
/// with its name, and resolving it with COMMIT finalizes the writes.
#[test]
fn in_doubt_transaction_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (store, ts) = open(&dir);
        let tx = ts.begin().unwrap();
        let map = tx
            .open_map(
                "accounts",
                Arc::new(LongType) as Arc<dyn DataType<i64>>,
                Arc::new(StringType) as Arc<dyn DataType<String>>,
            )
            .unwrap();
        map.put(7, "prepared balance".into()).unwrap();
        tx.set_name("x42");
        tx.prepare().unwrap();
        // Crash: no commit, no rollback.
        store.close().unwrap();
    }

    let (_store, ts) = open(&dir);
    let open_txs = ts.open_transactions();
    assert_eq!(open_txs.len(), 1);
    let mut in_doubt = ts.in_doubt_transactions();
    assert_eq!(in_doubt.len(), 1);
    assert_eq!(in_doubt[0].transaction_name().as_deref(), Some("x42"));

    let resolver = ts.begin().unwrap();
    let map = resolver
        .open_map(
            "accounts",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )
        .unwrap();
    in_doubt[0].set_state(InDoubtState::Commit).unwrap();

    assert_eq!(map.get(&7).unwrap(), Some("prepared balance".into()));
    assert!(ts.in_doubt_transactions().is_empty());
    resolver.rollback().unwrap();
}

/// The primary and a unique index working together through the facade
/// `Index` capability.
#[test]
fn table_with_primary_and_unique_index() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (store, ts) = open(&dir);

    let tx = ts.begin()?;
    let primary = PrimaryIndex::open(&tx, "emp.data")?;
    let by_name = SecondaryIndex::open(&tx, "emp.by_name", vec![1], true)?;

    for name in ["ada", "grace", "edsger"] {
        let key = primary.next_key();
        let row = person(key, name);
        primary.add(key, &row)?;
        by_name.add(key, &row)?;
    }
    tx.commit()?;
    store.commit()?;

    let tx = ts.begin()?;
    let by_name = SecondaryIndex::open(&tx, "emp.by_name", vec![1], true)?;
    let primary = PrimaryIndex::open(&tx, "emp.data")?;
    let hits = by_name.find(&person(0, "grace"))?;
    assert_eq!(hits.len(), 1);
    let row = primary.get(hits[0])?.expect("row for hit");
    assert_eq!(row[1], Value::String("grace".into()));
    tx.rollback()?;
    Ok(())
}
