use std::sync::Arc;

use kurodb_storage::Value;

use crate::error::IndexError;
use crate::index::Index;
use crate::primary::PrimaryIndex;
use crate::row::Row;

/// Zero-storage index used when a single non-null long column is the row
/// key itself: every operation forwards to the primary index.
pub struct DelegateIndex {
    name: String,
    primary: Arc<PrimaryIndex>,
    column: usize,
}

impl DelegateIndex {
    pub fn new(name: &str, primary: Arc<PrimaryIndex>, column: usize) -> DelegateIndex {
        DelegateIndex {
            name: name.to_string(),
            primary,
            column,
        }
    }

    fn column_key(&self, row: &Row) -> Option<i64> {
        match row.get(self.column) {
            Some(Value::Long(key)) => Some(*key),
            _ => None,
        }
    }
}

impl Index for DelegateIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    fn add(&self, _row_key: i64, _row: &Row) -> Result<(), IndexError> {
        // The primary index already stores the row.
        Ok(())
    }

    fn remove(&self, _row_key: i64, _row: &Row) -> Result<(), IndexError> {
        Ok(())
    }

    fn find(&self, values: &Row) -> Result<Vec<i64>, IndexError> {
        let Some(key) = values
            .get(self.column)
            .and_then(|v| match v {
                Value::Long(k) => Some(*k),
                _ => None,
            })
            .or_else(|| self.column_key(values))
        else {
            return Ok(Vec::new());
        };
        Ok(match self.primary.get(key)? {
            Some(_) => vec![key],
            None => Vec::new(),
        })
    }

    fn entry_count(&self) -> Result<u64, IndexError> {
        self.primary.entry_count()
    }
}
