use std::cmp::Ordering;
use std::sync::Arc;

use kurodb_storage::{DataType, ReadBuffer, StoreError, WriteBuffer};

/// Number of bits in a transaction id; the rest of an operation id is the
/// per-transaction log sequence.
pub const TX_ID_BITS: u32 = 24;
pub const MAX_TX_ID: u32 = (1 << TX_ID_BITS) - 1;
const LOG_ID_BITS: u32 = 64 - TX_ID_BITS;
const LOG_ID_MASK: u64 = (1 << LOG_ID_BITS) - 1;

/// Pack a transaction id and its log sequence into one operation id.
pub fn pack_op_id(tx_id: u32, log_id: u64) -> u64 {
    debug_assert!(tx_id <= MAX_TX_ID);
    debug_assert!(log_id <= LOG_ID_MASK);
    ((tx_id as u64) << LOG_ID_BITS) | log_id
}

pub fn op_tx_id(op_id: u64) -> u32 {
    (op_id >> LOG_ID_BITS) as u32
}

pub fn op_log_id(op_id: u64) -> u64 {
    op_id & LOG_ID_MASK
}

/// The uncommitted slot of a versioned value. `None` is a real sentinel
/// distinct from a tentative delete: it means no open transaction has
/// touched the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Uncommitted<V> {
    None,
    Put(V),
    Delete,
}

impl<V> Uncommitted<V> {
    pub fn is_none(&self) -> bool {
        matches!(self, Uncommitted::None)
    }
}

/// The value type of every transactional map: the last committed value
/// plus at most one tentative change, tagged with the operation id of the
/// transaction that made it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue<V> {
    /// Zero when no uncommitted change is pending.
    pub op_id: u64,
    pub committed: Option<V>,
    pub uncommitted: Uncommitted<V>,
}

impl<V: Clone> VersionedValue<V> {
    pub fn committed_only(value: V) -> Self {
        VersionedValue {
            op_id: 0,
            committed: Some(value),
            uncommitted: Uncommitted::None,
        }
    }

    /// The transaction currently owning the uncommitted slot, if any.
    pub fn owner(&self) -> Option<u32> {
        if self.uncommitted.is_none() {
            None
        } else {
            Some(op_tx_id(self.op_id))
        }
    }

    /// The value the owning transaction itself observes.
    pub fn own_view(&self) -> Option<V> {
        match &self.uncommitted {
            Uncommitted::None => self.committed.clone(),
            Uncommitted::Put(v) => Some(v.clone()),
            Uncommitted::Delete => None,
        }
    }
}

const FLAG_COMMITTED: u8 = 1;
const FLAG_UNCOMMITTED: u8 = 2;
const FLAG_DELETE: u8 = 4;

/// Codec for [`VersionedValue`] wrapping the plain value codec.
pub struct VersionedType<V> {
    value_type: Arc<dyn DataType<V>>,
}

impl<V> VersionedType<V> {
    pub fn new(value_type: Arc<dyn DataType<V>>) -> Self {
        VersionedType { value_type }
    }
}

impl<V: Clone + Send + Sync + 'static> DataType<VersionedValue<V>> for VersionedType<V> {
    fn compare(&self, a: &VersionedValue<V>, b: &VersionedValue<V>) -> Ordering {
        // Versioned values are never used as keys; ordering by operation
        // id keeps the trait total.
        a.op_id.cmp(&b.op_id)
    }

    fn memory(&self, value: &VersionedValue<V>) -> u32 {
        let mut memory = 32;
        if let Some(v) = &value.committed {
            memory += self.value_type.memory(v);
        }
        if let Uncommitted::Put(v) = &value.uncommitted {
            memory += self.value_type.memory(v);
        }
        memory
    }

    fn write(&self, buf: &mut WriteBuffer, value: &VersionedValue<V>) {
        let mut flags = 0u8;
        if value.committed.is_some() {
            flags |= FLAG_COMMITTED;
        }
        match &value.uncommitted {
            Uncommitted::None => {}
            Uncommitted::Put(_) => flags |= FLAG_UNCOMMITTED,
            Uncommitted::Delete => flags |= FLAG_UNCOMMITTED | FLAG_DELETE,
        }
        buf.put_u8(flags);
        buf.put_var_u64(value.op_id);
        if let Some(v) = &value.committed {
            self.value_type.write(buf, v);
        }
        if let Uncommitted::Put(v) = &value.uncommitted {
            self.value_type.write(buf, v);
        }
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<VersionedValue<V>, StoreError> {
        let flags = buf.read_u8()?;
        let op_id = buf.read_var_u64()?;
        let committed = if flags & FLAG_COMMITTED != 0 {
            Some(self.value_type.read(buf)?)
        } else {
            None
        };
        let uncommitted = if flags & FLAG_UNCOMMITTED == 0 {
            Uncommitted::None
        } else if flags & FLAG_DELETE != 0 {
            Uncommitted::Delete
        } else {
            Uncommitted::Put(self.value_type.read(buf)?)
        };
        Ok(VersionedValue {
            op_id,
            committed,
            uncommitted,
        })
    }
}
