use kurodb_storage::Value;

use crate::row::{index_key, index_key_max, index_key_min, key_matches_columns, row_key_of};

#[test]
fn test_index_key_layout() {
    let row = vec![
        Value::Long(10),
        Value::String("alice".into()),
        Value::Int(30),
    ];
    let key = index_key(&[1], &row, 42);
    assert_eq!(key, vec![Value::String("alice".into()), Value::Long(42)]);
    assert_eq!(row_key_of(&key), Some(42));
}

#[test]
fn test_range_sentinels_bound_the_prefix() {
    let row = vec![Value::Long(1), Value::String("bob".into())];
    let min = index_key_min(&[1], &row);
    let max = index_key_max(&[1], &row);
    let actual = index_key(&[1], &row, 7);

    let codec = kurodb_storage::ValueArrayType;
    use kurodb_storage::DataType;
    assert_eq!(codec.compare(&min, &actual), std::cmp::Ordering::Less);
    assert_eq!(codec.compare(&actual, &max), std::cmp::Ordering::Less);
}

#[test]
fn test_key_matches_columns() {
    let prefix = vec![Value::String("x".into())];
    let key = index_key(&[0], &vec![Value::String("x".into())], 1);
    assert!(key_matches_columns(&key, &prefix));

    let other = index_key(&[0], &vec![Value::String("y".into())], 1);
    assert!(!key_matches_columns(&other, &prefix));
}

#[test]
fn test_missing_column_becomes_null() {
    let key = index_key(&[5], &vec![Value::Long(1)], 9);
    assert_eq!(key, vec![Value::Null, Value::Long(9)]);
}
