use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use kurodb_storage::{DataType, LongType, ValueArrayType};
use kurodb_tx::{Transaction, TransactionMap};

use crate::error::IndexError;
use crate::index::Index;
use crate::row::Row;

/// The primary index: rows stored by their 64-bit row key. Keys can be
/// assigned explicitly or auto-allocated from a counter seeded with the
/// largest key on disk.
pub struct PrimaryIndex {
    name: String,
    map: TransactionMap<i64, Row>,
    next_key: AtomicI64,
}

impl PrimaryIndex {
    pub fn open(tx: &Transaction, name: &str) -> Result<PrimaryIndex, IndexError> {
        let map = tx.open_map(
            name,
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(ValueArrayType) as Arc<dyn DataType<Row>>,
        )?;
        let next_key = map.last_key_any()?.unwrap_or(0) + 1;
        Ok(PrimaryIndex {
            name: name.to_string(),
            map,
            next_key: AtomicI64::new(next_key),
        })
    }

    pub fn map(&self) -> &TransactionMap<i64, Row> {
        &self.map
    }

    /// Allocate the next row key.
    pub fn next_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::AcqRel)
    }

    /// Insert a row with an auto-assigned key; returns the key.
    pub fn insert(&self, row: Row) -> Result<i64, IndexError> {
        let key = self.next_key();
        self.add(key, &row)?;
        Ok(key)
    }

    pub fn get(&self, row_key: i64) -> Result<Option<Row>, IndexError> {
        Ok(self.map.get(&row_key)?)
    }

    /// Replace an existing row; the row must exist.
    pub fn update(&self, row_key: i64, row: Row) -> Result<(), IndexError> {
        if self.map.get(&row_key)?.is_none() {
            return Err(IndexError::RowNotFound { key: row_key });
        }
        self.map.put(row_key, row)?;
        Ok(())
    }

    /// Delete a row; the row must exist.
    pub fn delete(&self, row_key: i64) -> Result<Row, IndexError> {
        match self.map.remove(&row_key)? {
            Some(row) => Ok(row),
            None => Err(IndexError::RowNotFound { key: row_key }),
        }
    }
}

impl Index for PrimaryIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    /// Put-if-absent: an existing committed row is a duplicate, an
    /// uncommitted one by another live transaction is a concurrent
    /// update.
    fn add(&self, row_key: i64, row: &Row) -> Result<(), IndexError> {
        if let Some(current) = self.map.raw(&row_key)? {
            if let Some(owner) = current.owner() {
                if owner != self.map.transaction().id() && self.map.is_active_tx(owner)? {
                    return Err(IndexError::ConcurrentUpdate {
                        index: self.name.clone(),
                    });
                }
            }
            let visible = if current.owner() == Some(self.map.transaction().id()) {
                current.own_view().is_some()
            } else {
                current.committed.is_some()
            };
            if visible {
                return Err(IndexError::DuplicateKey {
                    index: self.name.clone(),
                });
            }
        }
        self.map.put(row_key, row.clone())?;
        self.next_key.fetch_max(row_key + 1, Ordering::AcqRel);
        Ok(())
    }

    fn remove(&self, row_key: i64, _row: &Row) -> Result<(), IndexError> {
        self.delete(row_key).map(|_| ())
    }

    fn find(&self, values: &Row) -> Result<Vec<i64>, IndexError> {
        // Lookups by row key only: the first value must be the key.
        match values.first() {
            Some(kurodb_storage::Value::Long(key)) => {
                Ok(match self.map.get(key)? {
                    Some(_) => vec![*key],
                    None => Vec::new(),
                })
            }
            _ => Ok(Vec::new()),
        }
    }

    fn entry_count(&self) -> Result<u64, IndexError> {
        Ok(self.map.size()?)
    }
}
