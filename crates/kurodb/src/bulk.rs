use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use kurodb_storage::{DataType, LongType, MvMap, Store, Value, ValueArrayType};
use tracing::debug;

use crate::error::IndexError;
use crate::index::Index;
use crate::row::{Row, index_key};
use crate::secondary::SecondaryIndex;

/// Rows buffered in memory before a sorted run is spilled.
const SPILL_THRESHOLD: usize = 4096;

/// Bulk-build a secondary index: batches of input rows are sorted by
/// index key and spilled into temporary maps, then all pre-sorted runs
/// are merged into the target through a priority queue, with the unique
/// check applied at each step by the index itself.
pub struct BufferedRows {
    store: Store,
    columns: Vec<usize>,
    buffer: Vec<(Vec<Value>, i64)>,
    runs: Vec<Arc<MvMap<Vec<Value>, i64>>>,
    run_names: Vec<String>,
    sequence: u64,
}

impl BufferedRows {
    pub fn new(store: Store, columns: Vec<usize>, sequence: u64) -> BufferedRows {
        BufferedRows {
            store,
            columns,
            buffer: Vec::new(),
            runs: Vec::new(),
            run_names: Vec::new(),
            sequence,
        }
    }

    pub fn add(&mut self, row_key: i64, row: &Row) -> Result<(), IndexError> {
        let key = index_key(&self.columns, row, row_key);
        self.buffer.push((key, row_key));
        if self.buffer.len() >= SPILL_THRESHOLD {
            self.spill()?;
        }
        Ok(())
    }

    /// Sort the in-memory batch and write it into a temporary map.
    fn spill(&mut self) -> Result<(), IndexError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let codec = ValueArrayType;
        self.buffer.sort_by(|a, b| codec.compare(&a.0, &b.0));

        let name = format!("temp.bulk.{}.{}", self.sequence, self.runs.len());
        let run = self.store.open_map(
            &name,
            Arc::new(ValueArrayType) as Arc<dyn DataType<Vec<Value>>>,
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
        )?;
        for (key, row_key) in self.buffer.drain(..) {
            run.put(key, row_key)?;
        }
        debug!(run = %name, "sorted run spilled");
        self.runs.push(run);
        self.run_names.push(name);
        Ok(())
    }

    /// Merge every run into the target index and drop the temporary maps
    /// on all exit paths.
    pub fn build_into(mut self, index: &SecondaryIndex) -> Result<u64, IndexError> {
        self.spill()?;
        let result = self.merge(index);
        // Temporary maps go regardless of how the merge ended.
        for name in &self.run_names {
            let _ = self.store.remove_map(name);
        }
        result
    }

    fn merge(&mut self, index: &SecondaryIndex) -> Result<u64, IndexError> {
        let mut heap: BinaryHeap<MergeHead> = BinaryHeap::new();
        let mut cursors = Vec::new();
        for (source, run) in self.runs.iter().enumerate() {
            let mut cursor = run.cursor(None)?;
            if let Some((key, row_key)) = cursor.next_entry()? {
                heap.push(MergeHead {
                    key,
                    row_key,
                    source,
                });
            }
            cursors.push(cursor);
        }

        let mut added = 0u64;
        while let Some(head) = heap.pop() {
            // Re-derive the row shape the index expects: the indexed
            // values sit at their column positions.
            let mut row: Row = vec![Value::Null; self.columns.iter().max().map_or(0, |&c| c + 1)];
            for (i, &column) in self.columns.iter().enumerate() {
                if let Some(value) = head.key.get(i) {
                    row[column] = value.clone();
                }
            }
            index.add(head.row_key, &row)?;
            added += 1;

            if let Some((key, row_key)) = cursors[head.source].next_entry()? {
                heap.push(MergeHead {
                    key,
                    row_key,
                    source: head.source,
                });
            }
        }
        debug!(entries = added, "bulk index build finished");
        Ok(added)
    }
}

/// Heap entry ordering is reversed so the `BinaryHeap` pops the smallest
/// key first.
struct MergeHead {
    key: Vec<Value>,
    row_key: i64,
    source: usize,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        let codec = ValueArrayType;
        codec
            .compare(&other.key, &self.key)
            .then(other.row_key.cmp(&self.row_key))
    }
}
