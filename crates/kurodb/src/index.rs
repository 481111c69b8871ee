use crate::error::IndexError;
use crate::row::Row;

/// Capability interface shared by the index variants: the primary index
/// on the row key, secondary indexes on column values, and the
/// zero-storage delegate.
pub trait Index {
    fn index_name(&self) -> &str;

    /// Register a row under its key. Unique variants raise
    /// `DuplicateKey`/`ConcurrentUpdate` on collisions.
    fn add(&self, row_key: i64, row: &Row) -> Result<(), IndexError>;

    /// Unregister a row.
    fn remove(&self, row_key: i64, row: &Row) -> Result<(), IndexError>;

    /// Row keys matching the given column values, in key order.
    fn find(&self, values: &Row) -> Result<Vec<i64>, IndexError>;

    /// Approximate entry count, for planning.
    fn entry_count(&self) -> Result<u64, IndexError>;
}
