use std::sync::Arc;

use kurodb_storage::{DataType, LongType, Value, ValueArrayType};
use kurodb_tx::{Transaction, TransactionMap};

use crate::error::IndexError;
use crate::index::Index;
use crate::row::{Row, index_key, index_key_min, key_matches_columns, row_key_of};

/// A secondary index over one or more columns. The stored key is the
/// concatenation of the indexed values and the row key, so equal column
/// values from different rows coexist; `i64::MIN`/`i64::MAX` in the
/// trailing slot bound range scans.
pub struct SecondaryIndex {
    name: String,
    map: TransactionMap<Vec<Value>, i64>,
    columns: Vec<usize>,
    unique: bool,
}

impl SecondaryIndex {
    pub fn open(
        tx: &Transaction,
        name: &str,
        columns: Vec<usize>,
        unique: bool,
    ) -> Result<SecondaryIndex, IndexError> {
        let map = tx.open_map(
            name,
            Arc::new(ValueArrayType) as Arc<dyn DataType<Vec<Value>>>,
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
        )?;
        Ok(SecondaryIndex {
            name: name.to_string(),
            map,
            columns,
            unique,
        })
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Uniqueness check over both the committed and the uncommitted view
    /// of `[values + MIN, values + MAX]`: entries written by this
    /// transaction are ignored, a committed match is a duplicate, and an
    /// uncommitted match by a live transaction is a concurrent update.
    fn check_unique(&self, row: &Row) -> Result<(), IndexError> {
        let prefix: Vec<Value> = self
            .columns
            .iter()
            .map(|&c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if prefix.iter().any(|v| matches!(v, Value::Null)) {
            // Nulls never collide, matching SQL unique semantics.
            return Ok(());
        }
        let from = index_key_min(&self.columns, row);
        let own_id = self.map.transaction().id();

        let mut iter = self.map.key_iterator_uncommitted(Some(&from))?;
        while let Some((key, owner, has_committed)) = iter.next_key()? {
            if !key_matches_columns(&key, &prefix) {
                break;
            }
            if owner == own_id {
                continue;
            }
            if owner != 0 && self.map.is_active_tx(owner)? {
                return Err(IndexError::ConcurrentUpdate {
                    index: self.name.clone(),
                });
            }
            if has_committed {
                return Err(IndexError::DuplicateKey {
                    index: self.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Index for SecondaryIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn add(&self, row_key: i64, row: &Row) -> Result<(), IndexError> {
        if self.unique {
            self.check_unique(row)?;
        }
        let key = index_key(&self.columns, row, row_key);
        self.map.put(key, row_key)?;
        Ok(())
    }

    fn remove(&self, row_key: i64, row: &Row) -> Result<(), IndexError> {
        let key = index_key(&self.columns, row, row_key);
        self.map.remove(&key)?;
        Ok(())
    }

    fn find(&self, values: &Row) -> Result<Vec<i64>, IndexError> {
        let from = index_key_min(&self.columns, values);
        let prefix: Vec<Value> = self
            .columns
            .iter()
            .map(|&c| values.get(c).cloned().unwrap_or(Value::Null))
            .collect();

        let mut keys = Vec::new();
        let mut iter = self.map.entries(Some(&from))?;
        while let Some((key, _)) = iter.next_entry()? {
            if !key_matches_columns(&key, &prefix) {
                break;
            }
            if let Some(row_key) = row_key_of(&key) {
                keys.push(row_key);
            }
        }
        Ok(keys)
    }

    fn entry_count(&self) -> Result<u64, IndexError> {
        Ok(self.map.size()?)
    }
}
