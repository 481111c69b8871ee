use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use kurodb_storage::{
    DataType, LongType, MvMap, ReadBuffer, Store, StoreError, StringType, VersionHold, WriteBuffer,
};

use crate::error::TxError;
use crate::transaction::{InDoubtState, InDoubtTransaction, Transaction, TxStatus};
use crate::versioned::MAX_TX_ID;

/// Interval between deadlock-detection walks while a writer is blocked.
pub(crate) const DEADLOCK_CHECK_MS: u64 = 100;

/// Default row-lock wait before `TxError::TxLocked`.
pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;

/// Name of the persisted prepared-transaction registry map.
const REGISTRY_MAP: &str = "tx.registry";

/// Prefix of the persisted per-transaction undo-log maps.
pub(crate) const UNDO_MAP_PREFIX: &str = "undolog.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// One undo-log record: enough to restore the previous versioned value of
/// a key, with key and value carried as codec bytes so records of any map
/// type share one shape.
#[derive(Debug, Clone)]
pub(crate) struct UndoRecord {
    pub log_id: u64,
    pub map_id: u32,
    pub key: Vec<u8>,
    /// Encoded previous versioned value; empty flag means the key was
    /// absent.
    pub prev: Vec<u8>,
}

impl UndoRecord {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = WriteBuffer::with_capacity(self.key.len() + self.prev.len() + 16);
        buf.put_var_u64(self.map_id as u64);
        buf.put_var_u64(self.key.len() as u64);
        buf.put(&self.key);
        buf.put_var_u64(self.prev.len() as u64);
        buf.put(&self.prev);
        buf.as_slice().to_vec()
    }

    pub(crate) fn decode(log_id: u64, bytes: &[u8]) -> Result<UndoRecord, StoreError> {
        let mut buf = ReadBuffer::new(bytes);
        let map_id = buf.read_var_u64()? as u32;
        let key_len = buf.read_var_u64()? as usize;
        let key = buf.read(key_len)?.to_vec();
        let prev_len = buf.read_var_u64()? as usize;
        let prev = buf.read(prev_len)?.to_vec();
        Ok(UndoRecord {
            log_id,
            map_id,
            key,
            prev,
        })
    }
}

/// Shared state of one transaction.
pub(crate) struct TxState {
    pub id: u32,
    pub status: Mutex<TxStatus>,
    pub name: Mutex<Option<String>>,
    pub isolation: IsolationLevel,
    pub begin_version: u64,
    pub timeout_ms: u64,
    next_log: AtomicU64,
    pub undo: Mutex<Vec<UndoRecord>>,
    pub hold: Mutex<Option<VersionHold>>,
    /// Persisted copy of the undo log, created on first write so prepared
    /// transactions survive a restart.
    pub undo_map: Mutex<Option<Arc<MvMap<i64, Vec<u8>>>>>,
}

impl TxState {
    pub(crate) fn next_log_id(&self) -> u64 {
        self.next_log.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn current_status(&self) -> TxStatus {
        *self.status.lock()
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.current_status(),
            TxStatus::Open | TxStatus::Prepared | TxStatus::Committing
        )
    }
}

/// Type-erased hooks a transactional map registers so commit, rollback,
/// and crash recovery can apply undo records without knowing the map's
/// key/value types.
pub(crate) trait TxMapApply: Send + Sync {
    fn map_id(&self) -> u32;
    /// Promote this transaction's uncommitted slot on `key` to committed.
    fn apply_commit(&self, tx_id: u32, key: &[u8]) -> Result<(), TxError>;
    /// Restore the previous versioned value recorded in `prev`.
    fn apply_rollback(&self, tx_id: u32, key: &[u8], prev: &[u8]) -> Result<(), TxError>;
}

pub(crate) struct TxStoreInner {
    pub store: Store,
    pub transactions: Mutex<HashMap<u32, Arc<TxState>>>,
    last_slot: Mutex<u32>,
    pub registry: Arc<MvMap<i64, String>>,
    pub tx_maps: Mutex<HashMap<u32, Arc<dyn TxMapApply>>>,
    /// Undo records of transactions that died unprepared, keyed by map
    /// id; applied (as rollbacks) when the owning map is first opened,
    /// which is also when its key/value types become known.
    pub zombie_undo: Mutex<HashMap<u32, Vec<(u32, UndoRecord)>>>,
    /// Writers blocked on a row lock wait here; any transaction ending
    /// notifies.
    pub lock_signal: (Mutex<()>, Condvar),
    /// waits_for[a] = b: transaction a is blocked on b.
    pub waits_for: Mutex<HashMap<u32, u32>>,
    pub default_timeout_ms: u64,
}

/// Multi-version transaction layer above the page store.
///
/// Transactions get snapshot-isolated, optimistic access to transactional
/// maps; writes install row-level ownership on versioned value triples,
/// blocked writers run periodic deadlock detection, and prepared
/// transactions are persisted so an external coordinator can resolve them
/// after a crash.
#[derive(Clone)]
pub struct TransactionStore {
    pub(crate) inner: Arc<TxStoreInner>,
}

impl TransactionStore {
    pub fn new(store: Store) -> Result<TransactionStore, TxError> {
        Self::with_timeout(store, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn with_timeout(store: Store, default_timeout_ms: u64) -> Result<TransactionStore, TxError> {
        let registry = store.open_map(
            REGISTRY_MAP,
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(StringType) as Arc<dyn DataType<String>>,
        )?;

        let inner = Arc::new(TxStoreInner {
            store,
            transactions: Mutex::new(HashMap::new()),
            last_slot: Mutex::new(0),
            registry,
            tx_maps: Mutex::new(HashMap::new()),
            zombie_undo: Mutex::new(HashMap::new()),
            lock_signal: (Mutex::new(()), Condvar::new()),
            waits_for: Mutex::new(HashMap::new()),
            default_timeout_ms,
        });
        let tx_store = TransactionStore { inner };
        tx_store.recover()?;
        Ok(tx_store)
    }

    /// Rebuild prepared transactions from the registry and sweep undo
    /// logs of transactions that died before preparing.
    fn recover(&self) -> Result<(), TxError> {
        let inner = &self.inner;
        let mut prepared = Vec::new();
        {
            let mut cursor = inner.registry.cursor(None)?;
            while let Some((slot, record)) = cursor.next_entry()? {
                let name = record
                    .strip_prefix("prepared,")
                    .map(str::to_string)
                    .unwrap_or_default();
                prepared.push((slot as u32, name));
            }
        }

        for (slot, name) in prepared {
            let undo_name = format!("{UNDO_MAP_PREFIX}{slot:x}");
            let mut undo = Vec::new();
            let undo_map = if inner.store.has_map(&undo_name)? {
                let map = inner.store.open_map(
                    &undo_name,
                    Arc::new(LongType) as Arc<dyn DataType<i64>>,
                    Arc::new(kurodb_storage::BytesType) as Arc<dyn DataType<Vec<u8>>>,
                )?;
                let mut cursor = map.cursor(None)?;
                while let Some((log_id, bytes)) = cursor.next_entry()? {
                    undo.push(UndoRecord::decode(log_id as u64, &bytes)?);
                }
                Some(map)
            } else {
                None
            };

            info!(tx = slot, name = %name, entries = undo.len(), "recovered prepared transaction");
            let max_log = undo.last().map(|r| r.log_id).unwrap_or(0);
            let state = Arc::new(TxState {
                id: slot,
                status: Mutex::new(TxStatus::Prepared),
                name: Mutex::new(if name.is_empty() { None } else { Some(name) }),
                isolation: IsolationLevel::ReadCommitted,
                begin_version: inner.store.current_version(),
                timeout_ms: inner.default_timeout_ms,
                next_log: AtomicU64::new(max_log),
                undo: Mutex::new(undo),
                hold: Mutex::new(Some(
                    inner.store.acquire_version(inner.store.current_version()),
                )),
                undo_map: Mutex::new(undo_map),
            });
            inner.transactions.lock().insert(slot, state);
        }

        // Undo logs without a registry entry belong to transactions that
        // died before preparing: collect their records so each map rolls
        // them back the first time it is opened with its real types, then
        // drop the logs.
        for name in inner.store.map_names()? {
            if let Some(slot_hex) = name.strip_prefix(UNDO_MAP_PREFIX) {
                let slot = u32::from_str_radix(slot_hex, 16).unwrap_or(0);
                if inner.transactions.lock().contains_key(&slot) {
                    continue;
                }
                warn!(map = %name, "rolling back an unprepared transaction from before a restart");
                let map = inner.store.open_map(
                    &name,
                    Arc::new(LongType) as Arc<dyn DataType<i64>>,
                    Arc::new(kurodb_storage::BytesType) as Arc<dyn DataType<Vec<u8>>>,
                )?;
                {
                    let mut cursor = map.cursor(None)?;
                    let mut zombies = inner.zombie_undo.lock();
                    while let Some((log_id, bytes)) = cursor.next_entry()? {
                        let record = UndoRecord::decode(log_id as u64, &bytes)?;
                        zombies
                            .entry(record.map_id)
                            .or_default()
                            .push((slot, record));
                    }
                }
                inner.store.remove_map(&name)?;
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Begin a read-committed transaction with the default lock timeout.
    pub fn begin(&self) -> Result<Transaction, TxError> {
        self.begin_with(IsolationLevel::ReadCommitted, self.inner.default_timeout_ms)
    }

    pub fn begin_with(
        &self,
        isolation: IsolationLevel,
        timeout_ms: u64,
    ) -> Result<Transaction, TxError> {
        let inner = &self.inner;
        inner.store.current_version(); // fail fast on a closed store
        let id = inner.allocate_slot()?;
        let begin_version = inner.store.current_version();
        let state = Arc::new(TxState {
            id,
            status: Mutex::new(TxStatus::Open),
            name: Mutex::new(None),
            isolation,
            begin_version,
            timeout_ms,
            next_log: AtomicU64::new(0),
            undo: Mutex::new(Vec::new()),
            hold: Mutex::new(Some(inner.store.acquire_version(begin_version))),
            undo_map: Mutex::new(None),
        });
        inner.transactions.lock().insert(id, state.clone());
        debug!(tx = id, begin_version, "transaction started");
        Ok(Transaction::new(inner.clone(), state))
    }

    /// All transactions that are not yet closed, prepared ones included.
    pub fn open_transactions(&self) -> Vec<Transaction> {
        let inner = &self.inner;
        inner
            .transactions
            .lock()
            .values()
            .filter(|s| s.is_active())
            .map(|s| Transaction::new(inner.clone(), s.clone()))
            .collect()
    }

    /// Prepared transactions awaiting an external commit/rollback
    /// decision.
    pub fn in_doubt_transactions(&self) -> Vec<InDoubtTransaction> {
        self.open_transactions()
            .into_iter()
            .filter(|t| t.status() == TxStatus::Prepared)
            .map(|t| InDoubtTransaction::new(t, InDoubtState::InDoubt))
            .collect()
    }

    /// Close the transaction layer; open transactions stay recoverable
    /// through their persisted state.
    pub fn close(&self) -> Result<(), TxError> {
        self.inner.store.commit()?;
        Ok(())
    }
}

impl TxStoreInner {
    fn allocate_slot(&self) -> Result<u32, TxError> {
        let transactions = self.transactions.lock();
        let mut last = self.last_slot.lock();
        for _ in 0..=MAX_TX_ID {
            let candidate = if *last >= MAX_TX_ID { 1 } else { *last + 1 };
            *last = candidate;
            if !transactions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(TxError::internal("transaction id space exhausted"))
    }

    pub(crate) fn tx_status(&self, tx_id: u32) -> Option<TxStatus> {
        self.transactions
            .lock()
            .get(&tx_id)
            .map(|s| s.current_status())
    }

    /// Whether the given transaction still owns its uncommitted writes.
    pub(crate) fn is_active_tx(&self, tx_id: u32) -> bool {
        self.transactions
            .lock()
            .get(&tx_id)
            .is_some_and(|s| s.is_active())
    }

    pub(crate) fn map_applier(&self, map_id: u32) -> Option<Arc<dyn TxMapApply>> {
        self.tx_maps.lock().get(&map_id).cloned()
    }

    pub(crate) fn register_map(&self, applier: Arc<dyn TxMapApply>) {
        self.tx_maps.lock().insert(applier.map_id(), applier);
    }

    /// Leftover records of crashed, unprepared transactions for a map,
    /// newest first, handed out exactly once.
    pub(crate) fn take_zombie_undo(&self, map_id: u32) -> Vec<(u32, UndoRecord)> {
        let mut zombies = self
            .zombie_undo
            .lock()
            .remove(&map_id)
            .unwrap_or_default();
        zombies.sort_by_key(|(slot, record)| (*slot, std::cmp::Reverse(record.log_id)));
        zombies
    }

    /// Record that `waiter` is blocked on `owner` and look for a cycle.
    /// Returns the cycle chain when `waiter` should be the victim.
    pub(crate) fn check_deadlock(&self, waiter: u32, owner: u32) -> Option<Vec<u32>> {
        let mut graph = self.waits_for.lock();
        graph.insert(waiter, owner);

        let mut chain = vec![waiter];
        let mut current = owner;
        while let Some(&next) = graph.get(&current) {
            chain.push(current);
            if current == waiter {
                break;
            }
            current = next;
            if chain.len() > graph.len() + 1 {
                // Walked further than there are edges: a cycle that does
                // not involve the waiter.
                break;
            }
        }
        if current != waiter {
            return None;
        }
        // A cycle exists; the largest id in it yields, which makes the
        // victim deterministic when both ends detect simultaneously.
        let victim = chain.iter().copied().max().unwrap_or(waiter);
        if victim == waiter {
            graph.remove(&waiter);
            Some(chain)
        } else {
            None
        }
    }

    pub(crate) fn clear_wait(&self, waiter: u32) {
        self.waits_for.lock().remove(&waiter);
    }

    /// Wake every writer blocked on a row lock.
    pub(crate) fn notify_lock_waiters(&self) {
        let (lock, condvar) = &self.lock_signal;
        let _guard = lock.lock();
        condvar.notify_all();
    }
}
