//! End-to-end store scenarios: crash recovery from a torn chunk, and file
//! compaction after bulk deletes.

use std::sync::Arc;

use kurodb_storage::{DataType, LongType, Store, StringType};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn key_type() -> Arc<dyn DataType<i64>> {
    Arc::new(LongType)
}

fn value_type() -> Arc<dyn DataType<String>> {
    Arc::new(StringType)
}

/// Write two commits, snapshot the file as a crash image, tear the tail
/// off the second chunk, and reopen: the store must come back at the
/// first commit's version with all of its data and none of the torn
/// commit's.
#[test]
fn crash_after_partial_chunk() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let live_path = dir.path().join("live.kdb");
    let crash_path = dir.path().join("crash.kdb");

    let first_version;
    {
        let store = Store::builder(&live_path)
            .auto_commit_delay(0)
            .open()
            .unwrap();
        let map = store.open_map("m", key_type(), value_type()).unwrap();

        for i in 1..=1000i64 {
            map.put(i, format!("value-{i}")).unwrap();
        }
        first_version = store.commit().unwrap();

        for i in 1001..=2000i64 {
            map.put(i, format!("value-{i}")).unwrap();
        }
        store.commit().unwrap();

        // Take the crash image while the store is still open, so the
        // header on disk does not carry the clean flag, exactly as after
        // a real crash.
        std::fs::copy(&live_path, &crash_path).unwrap();
        store.close().unwrap();
    }

    // Tear the last 2 KiB off the crash image, destroying the second
    // chunk's footer.
    let len = std::fs::metadata(&crash_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&crash_path)
        .unwrap();
    file.set_len(len - 2048).unwrap();
    drop(file);

    let store = Store::builder(&crash_path)
        .auto_commit_delay(0)
        .open()
        .unwrap();
    assert_eq!(store.current_version(), first_version);

    let map = store.open_map("m", key_type(), value_type()).unwrap();
    for i in (1..=1000i64).step_by(13) {
        assert_eq!(
            map.get(&i).unwrap(),
            Some(format!("value-{i}")),
            "key {i} lost by recovery"
        );
    }
    for i in (1001..=2000i64).step_by(13) {
        assert_eq!(map.get(&i).unwrap(), None, "torn commit leaked key {i}");
    }
}

/// Fill the store, delete half the keys, compact: the file must shrink
/// by at least 40% and every surviving key stays readable, including
/// after a reopen.
#[test]
fn compaction_shrinks_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.kdb");

    let store = Store::builder(&path)
        .auto_commit_delay(0)
        .retention_time(0)
        .open()
        .unwrap();
    let map = store.open_map("m", key_type(), value_type()).unwrap();

    let payload = "x".repeat(1024);
    for i in 0..4000i64 {
        map.put(i, format!("{i}:{payload}")).unwrap();
        if i % 500 == 499 {
            store.commit().unwrap();
        }
    }
    store.commit().unwrap();

    for i in 0..4000i64 {
        if i % 2 == 0 {
            map.remove(&i).unwrap();
        }
    }
    store.commit().unwrap();

    let before = store.file_size();
    store.compact_file(0).unwrap();
    let after = store.file_size();
    assert!(
        after * 10 <= before * 6,
        "compaction shrank {before} only to {after}"
    );

    for i in (1..4000i64).step_by(2) {
        assert_eq!(
            map.get(&i).unwrap(),
            Some(format!("{i}:{payload}")),
            "key {i} lost by compaction"
        );
    }
    store.close().unwrap();
    drop(map);
    drop(store);

    // Everything still there after a clean reopen.
    let store = Store::builder(&path).auto_commit_delay(0).open().unwrap();
    let map = store.open_map("m", key_type(), value_type()).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(format!("1:{payload}")));
    assert_eq!(map.get(&3999).unwrap(), Some(format!("3999:{payload}")));
    assert_eq!(map.get(&2).unwrap(), None);
}

/// A store that was never closed cleanly recovers on a read-only open
/// without touching the file.
#[test]
fn read_only_open_recovers_unclean_file() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let live_path = dir.path().join("live.kdb");
    let snapshot_path = dir.path().join("snapshot.kdb");

    {
        let store = Store::builder(&live_path).auto_commit_delay(0).open()?;
        let map = store.open_map("m", key_type(), value_type())?;
        for i in 0..100i64 {
            map.put(i, i.to_string())?;
        }
        store.commit()?;
        std::fs::copy(&live_path, &snapshot_path)?;
        store.close()?;
    }

    let len_before = std::fs::metadata(&snapshot_path)?.len();
    let store = Store::builder(&snapshot_path)
        .auto_commit_delay(0)
        .read_only(true)
        .open()?;
    let map = store.open_map("m", key_type(), value_type())?;
    assert_eq!(map.get(&42)?, Some("42".to_string()));
    drop(map);
    drop(store);
    assert_eq!(
        std::fs::metadata(&snapshot_path)?.len(),
        len_before,
        "read-only open must not write"
    );
    Ok(())
}
