use kurodb_storage::Value;

/// A table row: one [`Value`] per column.
pub type Row = Vec<Value>;

/// Build a composite index key from the indexed columns of a row plus the
/// row key as the trailing disambiguator. Two rows with equal indexed
/// values still produce distinct index keys.
pub fn index_key(columns: &[usize], row: &Row, row_key: i64) -> Vec<Value> {
    index_key_with(columns, row, row_key)
}

/// Range bound covering every row key under the given indexed values;
/// `i64::MIN`/`i64::MAX` act as the open-ended sentinels.
pub fn index_key_min(columns: &[usize], row: &Row) -> Vec<Value> {
    index_key_with(columns, row, i64::MIN)
}

pub fn index_key_max(columns: &[usize], row: &Row) -> Vec<Value> {
    index_key_with(columns, row, i64::MAX)
}

fn index_key_with(columns: &[usize], row: &Row, row_key: i64) -> Vec<Value> {
    let mut key = Vec::with_capacity(columns.len() + 1);
    for &column in columns {
        key.push(row.get(column).cloned().unwrap_or(Value::Null));
    }
    key.push(Value::Long(row_key));
    key
}

/// Whether an index key carries the given column prefix.
pub fn key_matches_columns(key: &[Value], prefix: &[Value]) -> bool {
    key.len() == prefix.len() + 1
        && key
            .iter()
            .zip(prefix.iter())
            .all(|(a, b)| a.compare(b) == std::cmp::Ordering::Equal)
}

/// The trailing row-key disambiguator of a composite index key.
pub fn row_key_of(key: &[Value]) -> Option<i64> {
    match key.last() {
        Some(Value::Long(k)) => Some(*k),
        _ => None,
    }
}
