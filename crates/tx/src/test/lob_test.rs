use kurodb_storage::Store;
use tempfile::TempDir;

use crate::lob::LobStorage;

fn open_store(dir: &TempDir) -> Store {
    Store::builder(dir.path().join("lob.kdb"))
        .auto_commit_delay(0)
        .open()
        .expect("open store")
}

#[test]
fn test_create_and_open_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let lobs = LobStorage::open(store.clone()).unwrap();

    let content = vec![0xabu8; 700 * 1024]; // spans three stream blocks
    let id = lobs.create_blob(&content, 7).unwrap();
    assert_eq!(lobs.open_blob(id).unwrap(), content);

    let meta = lobs.meta(id).unwrap();
    assert_eq!(meta.byte_count, content.len() as u64);
    assert_eq!(meta.table_id, 7);
    lobs.close();
}

#[test]
fn test_blob_ids_are_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let lobs = LobStorage::open(store.clone()).unwrap();

    let a = lobs.create_blob(b"first", 1).unwrap();
    let b = lobs.create_blob(b"second", 1).unwrap();
    assert!(b > a);
    lobs.close();
}

#[test]
fn test_copy_is_zero_copy_and_refcounted() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let lobs = LobStorage::open(store.clone()).unwrap();

    let original = lobs.create_blob(b"shared content", 1).unwrap();
    let copy = lobs.copy_blob(original, 2).unwrap();
    assert_ne!(original, copy);
    // Same stream underneath.
    assert_eq!(
        lobs.meta(original).unwrap().stream_id,
        lobs.meta(copy).unwrap().stream_id
    );

    // Removing one reference keeps the content alive for the other.
    lobs.remove_blob(original).unwrap();
    assert_eq!(lobs.pending_removals(), 0);
    assert_eq!(lobs.open_blob(copy).unwrap(), b"shared content");

    // Removing the last reference queues the stream for removal.
    lobs.remove_blob(copy).unwrap();
    assert_eq!(lobs.pending_removals(), 1);
    lobs.close();
}

#[test]
fn test_cleanup_waits_for_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let lobs = LobStorage::open(store.clone()).unwrap();

    let id = lobs.create_blob(b"to be removed", 1).unwrap();
    store.commit().unwrap();

    // A reader keeps the pre-removal version open.
    let hold = store.acquire_version(store.current_version());
    lobs.remove_blob(id).unwrap();
    store.commit().unwrap();

    assert_eq!(lobs.cleanup_now().unwrap(), 0, "snapshot still open");
    assert_eq!(lobs.pending_removals(), 1);

    drop(hold);
    store.commit().unwrap();
    // With the snapshot gone and the version advanced, the blocks go.
    assert!(lobs.cleanup_now().unwrap() > 0 || {
        // The removal version equals the current version until another
        // commit happens; force one more.
        let map = store
            .open_map(
                "nudge",
                std::sync::Arc::new(kurodb_storage::LongType)
                    as std::sync::Arc<dyn kurodb_storage::DataType<i64>>,
                std::sync::Arc::new(kurodb_storage::StringType)
                    as std::sync::Arc<dyn kurodb_storage::DataType<String>>,
            )
            .unwrap();
        map.put(1, "x".into()).unwrap();
        store.commit().unwrap();
        lobs.cleanup_now().unwrap() > 0
    });
    assert_eq!(lobs.pending_removals(), 0);
    lobs.close();
}

#[test]
fn test_temp_blob_registration() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let lobs = LobStorage::open(store.clone()).unwrap();

    let id = lobs.create_temp_blob(b"temporary").unwrap();
    assert_eq!(lobs.meta(id).unwrap().table_id, -1);
    lobs.remove_blob(id).unwrap();
    lobs.close();
}
