use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kurodb_storage::{Cursor, DataType, MvMap, Page, ReadBuffer, StoreError, WriteBuffer};

use crate::error::TxError;
use crate::store::{
    DEADLOCK_CHECK_MS, TxMapApply, TxStoreInner, UndoRecord,
};
use crate::transaction::{Transaction, TxStatus};
use crate::versioned::{Uncommitted, VersionedType, VersionedValue, pack_op_id};

/// The shared, transaction-independent part of a transactional map: the
/// underlying versioned map plus its codecs. Registered with the
/// transaction store so undo records can be applied by map id.
pub(crate) struct TxMapInner<K, V> {
    pub map: Arc<MvMap<K, VersionedValue<V>>>,
    key_type: Arc<dyn DataType<K>>,
    versioned_type: Arc<VersionedType<V>>,
    store: Weak<TxStoreInner>,
}

impl<K, V> TxMapInner<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn open(
        store: &Arc<TxStoreInner>,
        name: &str,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
    ) -> Result<Arc<Self>, TxError> {
        let versioned_type = Arc::new(VersionedType::new(value_type));
        let map = store.store.open_map(
            name,
            key_type.clone(),
            versioned_type.clone() as Arc<dyn DataType<VersionedValue<V>>>,
        )?;
        let inner = Arc::new(TxMapInner {
            map,
            key_type,
            versioned_type,
            store: Arc::downgrade(store),
        });
        // Crashed unprepared transactions left their uncommitted slots in
        // this map; restore the pre-images now that the types are known,
        // before any new transaction can reuse their ids.
        for (slot, record) in store.take_zombie_undo(inner.map.id()) {
            inner.apply_rollback(slot, &record.key, &record.prev)?;
        }
        store.register_map(inner.clone());
        Ok(inner)
    }

    fn encode_key(&self, key: &K) -> Vec<u8> {
        let mut buf = WriteBuffer::with_capacity(32);
        self.key_type.write(&mut buf, key);
        buf.as_slice().to_vec()
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<K, StoreError> {
        let mut buf = ReadBuffer::new(bytes);
        self.key_type.read(&mut buf)
    }

    fn encode_prev(&self, prev: Option<&VersionedValue<V>>) -> Vec<u8> {
        let mut buf = WriteBuffer::with_capacity(32);
        match prev {
            None => buf.put_u8(0),
            Some(value) => {
                buf.put_u8(1);
                self.versioned_type.write(&mut buf, value);
            }
        }
        buf.as_slice().to_vec()
    }

    fn decode_prev(&self, bytes: &[u8]) -> Result<Option<VersionedValue<V>>, StoreError> {
        let mut buf = ReadBuffer::new(bytes);
        match buf.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.versioned_type.read(&mut buf)?)),
        }
    }
}

impl<K, V> TxMapApply for TxMapInner<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn map_id(&self) -> u32 {
        self.map.id()
    }

    fn apply_commit(&self, tx_id: u32, key_bytes: &[u8]) -> Result<(), TxError> {
        let key = self.decode_key(key_bytes)?;
        loop {
            let Some(current) = self.map.get(&key)? else {
                return Ok(());
            };
            if current.owner() != Some(tx_id) {
                // Already promoted, or overwritten after resolution.
                return Ok(());
            }
            let observed_op = current.op_id;
            let replacement = match &current.uncommitted {
                Uncommitted::Put(v) => Some(VersionedValue::committed_only(v.clone())),
                Uncommitted::Delete => None,
                Uncommitted::None => unreachable!("owner() checked the slot"),
            };
            // Only the owner writes its own uncommitted slot, so a failed
            // swap here means the entry moved underneath us in a way that
            // should be impossible.
            if self.map.cas(
                &key,
                |cur| cur.map(|vv| vv.op_id) == Some(observed_op),
                replacement,
            )? {
                return Ok(());
            }
            return Err(TxError::internal(
                "commit promotion lost a compare-and-set on an owned entry",
            ));
        }
    }

    fn apply_rollback(&self, tx_id: u32, key_bytes: &[u8], prev_bytes: &[u8]) -> Result<(), TxError> {
        let key = self.decode_key(key_bytes)?;
        let prev = self.decode_prev(prev_bytes)?;
        let Some(current) = self.map.get(&key)? else {
            return Ok(());
        };
        if current.owner() != Some(tx_id) {
            return Ok(());
        }
        let observed_op = current.op_id;
        self.map.cas(
            &key,
            |cur| cur.map(|vv| vv.op_id) == Some(observed_op),
            prev,
        )?;
        Ok(())
    }
}

/// A transaction's view of one transactional map.
///
/// Reads follow the transaction's isolation level: read-committed returns
/// the committed slot of the current entry, repeatable-read resolves
/// foreign entries against the root captured at the transaction's begin
/// version. The transaction's own writes are always visible to itself.
pub struct TransactionMap<K, V> {
    tx: Transaction,
    inner: Arc<TxMapInner<K, V>>,
    /// Root snapshot for repeatable-read resolution, captured lazily.
    snapshot: Mutex<Option<Arc<Page<K, VersionedValue<V>>>>>,
}

impl<K, V> TransactionMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(tx: Transaction, inner: Arc<TxMapInner<K, V>>) -> Self {
        TransactionMap {
            tx,
            inner,
            snapshot: Mutex::new(None),
        }
    }

    pub fn map_id(&self) -> u32 {
        self.inner.map.id()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    fn store(&self) -> Result<Arc<TxStoreInner>, TxError> {
        self.inner
            .store
            .upgrade()
            .ok_or_else(|| TxError::internal("transaction store is gone"))
    }

    /// Root captured the first time this transaction touches the map.
    /// Promotions commit into new roots, so the captured root freezes the
    /// committed state as of that moment; later commits by others never
    /// reach it.
    fn snapshot_root(&self) -> Result<Arc<Page<K, VersionedValue<V>>>, TxError> {
        let mut slot = self.snapshot.lock();
        if let Some(root) = slot.as_ref() {
            return Ok(root.clone());
        }
        let root = self.inner.map.current_root().root;
        *slot = Some(root.clone());
        Ok(root)
    }

    // -- reads --------------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<V>, TxError> {
        let current = self.inner.map.get(key)?;
        if let Some(vv) = &current {
            if vv.owner() == Some(self.tx.id()) {
                return Ok(vv.own_view());
            }
        }
        match self.tx.state.isolation {
            crate::store::IsolationLevel::ReadCommitted => {
                Ok(current.and_then(|vv| vv.committed))
            }
            crate::store::IsolationLevel::RepeatableRead => {
                let root = self.snapshot_root()?;
                let snap = self.inner.map.get_from_root(&root, key)?;
                Ok(snap.and_then(|vv| vv.committed))
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, TxError> {
        Ok(self.get(key)?.is_some())
    }

    /// The raw versioned triple for a key, bypassing visibility; index
    /// uniqueness checks use it to tell committed conflicts apart from
    /// concurrent uncommitted ones.
    pub fn raw(&self, key: &K) -> Result<Option<VersionedValue<V>>, TxError> {
        Ok(self.inner.map.get(key)?)
    }

    /// Largest key present in the underlying map, committed or not; used
    /// to seed key auto-assignment.
    pub fn last_key_any(&self) -> Result<Option<K>, TxError> {
        Ok(self.inner.map.last_key()?)
    }

    /// Whether `tx_id` still owns its uncommitted writes.
    pub fn is_active_tx(&self, tx_id: u32) -> Result<bool, TxError> {
        Ok(self.store()?.is_active_tx(tx_id))
    }

    /// Number of committed-visible entries; walks the map.
    pub fn size(&self) -> Result<u64, TxError> {
        let mut count = 0;
        let mut iter = self.entries(None)?;
        while iter.next_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub fn first_key(&self) -> Result<Option<K>, TxError> {
        Ok(self.entries(None)?.next_entry()?.map(|(k, _)| k))
    }

    /// Committed-visible entries starting at `from`, per the
    /// transaction's isolation level.
    pub fn entries(&self, from: Option<&K>) -> Result<TxEntryIter<'_, K, V>, TxError> {
        let own_keys = self.own_written_keys(from)?;
        match self.tx.state.isolation {
            crate::store::IsolationLevel::ReadCommitted => {
                let cursor = self.inner.map.cursor(from)?;
                Ok(TxEntryIter {
                    map: self,
                    cursor,
                    own_keys: VecDeque::new(),
                    snapshot_mode: false,
                    pending: None,
                })
            }
            crate::store::IsolationLevel::RepeatableRead => {
                let root = self.snapshot_root()?;
                let cursor = self.inner.map.cursor_at(root, from, false)?;
                Ok(TxEntryIter {
                    map: self,
                    cursor,
                    own_keys: own_keys.into(),
                    snapshot_mode: true,
                    pending: None,
                })
            }
        }
    }

    pub fn key_iterator(&self, from: Option<&K>) -> Result<TxEntryIter<'_, K, V>, TxError> {
        self.entries(from)
    }

    /// Keys whose uncommitted slot is set by any transaction, merged with
    /// the committed view; unique-constraint checks scan this.
    pub fn key_iterator_uncommitted(
        &self,
        from: Option<&K>,
    ) -> Result<UncommittedKeyIter<'_, K, V>, TxError> {
        let cursor = self.inner.map.cursor(from)?;
        Ok(UncommittedKeyIter { cursor })
    }

    /// Keys this transaction itself has written in this map, sorted.
    fn own_written_keys(&self, from: Option<&K>) -> Result<Vec<K>, TxError> {
        let map_id = self.map_id();
        let undo = self.tx.state.undo.lock();
        let mut keys = Vec::new();
        for record in undo.iter().filter(|r| r.map_id == map_id) {
            let key = self.inner.decode_key(&record.key)?;
            if let Some(from) = from {
                if self.inner.key_type.compare(&key, from) == std::cmp::Ordering::Less {
                    continue;
                }
            }
            keys.push(key);
        }
        keys.sort_by(|a, b| self.inner.key_type.compare(a, b));
        keys.dedup_by(|a, b| self.inner.key_type.compare(a, b) == std::cmp::Ordering::Equal);
        Ok(keys)
    }

    // -- writes -------------------------------------------------------------

    pub fn put(&self, key: K, value: V) -> Result<Option<V>, TxError> {
        self.write(key, WriteOp::Value(Uncommitted::Put(value)), true)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>, TxError> {
        self.write(key.clone(), WriteOp::Value(Uncommitted::Delete), true)
    }

    /// Install row ownership without changing the value: writes the
    /// committed value back into the uncommitted slot. A `timeout_ms` of
    /// -2 skips waiting and returns `None` when the row is already
    /// locked; otherwise the committed value (possibly absent) is
    /// returned.
    pub fn lock(&self, key: &K, timeout_ms: i64) -> Result<Option<V>, TxError> {
        let wait = timeout_ms != -2;
        match self.write(key.clone(), WriteOp::LockCurrent, wait) {
            Ok(old) => Ok(old),
            Err(TxError::TxLocked { .. }) if !wait => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: K, op: WriteOp<V>, wait: bool) -> Result<Option<V>, TxError> {
        if self.tx.status() != TxStatus::Open {
            return Err(TxError::internal("write on a transaction that is not open"));
        }
        let store = self.store()?;
        let tx_id = self.tx.id();
        let deadline = Instant::now() + Duration::from_millis(self.tx.state.timeout_ms);

        loop {
            let current = self.inner.map.get(&key)?;

            if let Some(vv) = &current {
                if let Some(owner) = vv.owner() {
                    if owner != tx_id && store.is_active_tx(owner) {
                        if !wait {
                            return Err(TxError::TxLocked { owner });
                        }
                        self.wait_for(&store, tx_id, owner, deadline)?;
                        continue;
                    }
                }
            }

            let observed_op = current.as_ref().map(|vv| vv.op_id);
            let old_view = match &current {
                Some(vv) if vv.owner() == Some(tx_id) => vv.own_view(),
                Some(vv) => vv.committed.clone(),
                None => None,
            };
            let committed_base = current.as_ref().and_then(|vv| vv.committed.clone());
            // The lock operation copies whatever is committed right now,
            // so a stale copy can never be promoted over a newer commit.
            let uncommitted = match &op {
                WriteOp::Value(value) => value.clone(),
                WriteOp::LockCurrent => match &committed_base {
                    Some(v) => Uncommitted::Put(v.clone()),
                    None => Uncommitted::Delete,
                },
            };

            let log_id = self.tx.state.next_log_id();
            let new = VersionedValue {
                op_id: pack_op_id(tx_id, log_id),
                committed: committed_base,
                uncommitted,
            };
            self.tx.append_undo(UndoRecord {
                log_id,
                map_id: self.map_id(),
                key: self.inner.encode_key(&key),
                prev: self.inner.encode_prev(current.as_ref()),
            })?;

            if self.inner.map.cas(
                &key,
                |cur| cur.map(|vv| vv.op_id) == observed_op,
                Some(new),
            )? {
                return Ok(old_view);
            }
            // Lost the race; drop the stale undo record and try again.
            self.tx.pop_undo()?;
        }
    }

    /// One bounded wait slice on the lock condition, with a deadlock walk
    /// before sleeping.
    fn wait_for(
        &self,
        store: &Arc<TxStoreInner>,
        waiter: u32,
        owner: u32,
        deadline: Instant,
    ) -> Result<(), TxError> {
        if let Some(chain) = store.check_deadlock(waiter, owner) {
            return Err(TxError::TxDeadlock { chain });
        }
        let now = Instant::now();
        if now >= deadline {
            store.clear_wait(waiter);
            return Err(TxError::TxLocked { owner });
        }
        let slice = Duration::from_millis(DEADLOCK_CHECK_MS).min(deadline - now);
        {
            let (lock, condvar) = &store.lock_signal;
            let mut guard = lock.lock();
            condvar.wait_for(&mut guard, slice);
        }
        store.clear_wait(waiter);
        Ok(())
    }
}

enum WriteOp<V> {
    Value(Uncommitted<V>),
    /// Re-install the committed value as the uncommitted slot (row lock).
    LockCurrent,
}

/// Iterator over committed-visible entries, merging the transaction's own
/// writes into the snapshot view under repeatable read.
pub struct TxEntryIter<'a, K, V> {
    map: &'a TransactionMap<K, V>,
    cursor: Cursor<'a, K, VersionedValue<V>>,
    /// Own-written keys still to merge (repeatable read only).
    own_keys: VecDeque<K>,
    snapshot_mode: bool,
    pending: Option<(K, VersionedValue<V>)>,
}

impl<K, V> TxEntryIter<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, TxError> {
        loop {
            if let Some((key, value)) = self.next_candidate()? {
                if let Some(value) = value {
                    return Ok(Some((key, value)));
                }
                continue;
            }
            return Ok(None);
        }
    }

    /// Next key in order with its resolved visibility, tombstones
    /// included as `None`.
    fn next_candidate(&mut self) -> Result<Option<(K, Option<V>)>, TxError> {
        let tx_id = self.map.tx.id();

        if self.pending.is_none() {
            self.pending = self.cursor.next_entry()?;
        }

        if self.snapshot_mode {
            // Merge own-written keys with the snapshot stream.
            let ordering = match (&self.pending, self.own_keys.front()) {
                (Some((cursor_key, _)), Some(own_key)) => {
                    Some(self.map.inner.key_type.compare(own_key, cursor_key))
                }
                (None, Some(_)) => Some(std::cmp::Ordering::Less),
                _ => None,
            };
            if let Some(ordering) = ordering {
                if ordering != std::cmp::Ordering::Greater {
                    if ordering == std::cmp::Ordering::Equal {
                        // The own write shadows the snapshot entry.
                        self.pending = None;
                    }
                    let key = self.own_keys.pop_front().expect("own key present");
                    let value = self
                        .map
                        .inner
                        .map
                        .get(&key)?
                        .filter(|vv| vv.owner() == Some(tx_id))
                        .and_then(|vv| vv.own_view());
                    return Ok(Some((key, value)));
                }
            }
        }

        let Some((key, vv)) = self.pending.take() else {
            return Ok(None);
        };
        let value = if vv.owner() == Some(tx_id) {
            vv.own_view()
        } else {
            vv.committed
        };
        Ok(Some((key, value)))
    }
}

/// Iterator yielding every key with a pending uncommitted change by any
/// transaction, plus committed keys; unique checks scan both.
pub struct UncommittedKeyIter<'a, K, V> {
    cursor: Cursor<'a, K, VersionedValue<V>>,
}

impl<K, V> UncommittedKeyIter<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Next key and the id of the transaction owning its uncommitted
    /// slot, zero when the entry is committed-only.
    pub fn next_key(&mut self) -> Result<Option<(K, u32, bool)>, TxError> {
        loop {
            let Some((key, vv)) = self.cursor.next_entry()? else {
                return Ok(None);
            };
            match vv.owner() {
                Some(owner) => return Ok(Some((key, owner, vv.committed.is_some()))),
                None if vv.committed.is_some() => return Ok(Some((key, 0, true))),
                None => continue,
            }
        }
    }
}
