use std::sync::Arc;

use kurodb_storage::{DataType, ReadBuffer, StringType, WriteBuffer};

use crate::versioned::{
    MAX_TX_ID, Uncommitted, VersionedType, VersionedValue, op_log_id, op_tx_id, pack_op_id,
};

#[test]
fn test_op_id_packing() {
    let op = pack_op_id(0x123456, 0x89abcdef01);
    assert_eq!(op_tx_id(op), 0x123456);
    assert_eq!(op_log_id(op), 0x89abcdef01);

    let op = pack_op_id(MAX_TX_ID, 1);
    assert_eq!(op_tx_id(op), MAX_TX_ID);
    assert_eq!(op_log_id(op), 1);
}

fn roundtrip(value: VersionedValue<String>) {
    let codec = VersionedType::new(Arc::new(StringType) as Arc<dyn DataType<String>>);
    let mut buf = WriteBuffer::new();
    codec.write(&mut buf, &value);
    let mut reader = ReadBuffer::new(buf.as_slice());
    let back = codec.read(&mut reader).expect("decode");
    assert_eq!(back, value);
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn test_versioned_value_roundtrip() {
    roundtrip(VersionedValue::committed_only("hello".to_string()));
    roundtrip(VersionedValue {
        op_id: pack_op_id(5, 9),
        committed: None,
        uncommitted: Uncommitted::Put("pending".to_string()),
    });
    roundtrip(VersionedValue {
        op_id: pack_op_id(5, 10),
        committed: Some("old".to_string()),
        uncommitted: Uncommitted::Delete,
    });
    roundtrip(VersionedValue {
        op_id: 0,
        committed: None,
        uncommitted: Uncommitted::None,
    });
}

#[test]
fn test_owner_and_own_view() {
    let committed: VersionedValue<String> = VersionedValue::committed_only("a".into());
    assert_eq!(committed.owner(), None);
    assert_eq!(committed.own_view(), Some("a".into()));

    let pending = VersionedValue {
        op_id: pack_op_id(7, 1),
        committed: Some("a".to_string()),
        uncommitted: Uncommitted::Put("b".to_string()),
    };
    assert_eq!(pending.owner(), Some(7));
    assert_eq!(pending.own_view(), Some("b".into()));

    let tombstone = VersionedValue {
        op_id: pack_op_id(7, 2),
        committed: Some("a".to_string()),
        uncommitted: Uncommitted::Delete,
    };
    assert_eq!(tombstone.owner(), Some(7));
    assert_eq!(tombstone.own_view(), None);
}
