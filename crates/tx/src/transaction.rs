use std::sync::Arc;

use tracing::{debug, info};

use kurodb_storage::{BytesType, DataType, LongType};

use crate::error::TxError;
use crate::map::{TransactionMap, TxMapInner};
use crate::store::{TxState, TxStoreInner, UNDO_MAP_PREFIX, UndoRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Open,
    Prepared,
    Committing,
    Closed,
    RolledBack,
}

/// A transaction handle. Lifecycle: begin, any number of reads and
/// writes, then either commit (optionally after prepare) or rollback.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) store: Arc<TxStoreInner>,
    pub(crate) state: Arc<TxState>,
}

impl Transaction {
    pub(crate) fn new(store: Arc<TxStoreInner>, state: Arc<TxState>) -> Self {
        Transaction { store, state }
    }

    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub fn status(&self) -> TxStatus {
        self.state.current_status()
    }

    pub fn begin_version(&self) -> u64 {
        self.state.begin_version
    }

    pub fn name(&self) -> Option<String> {
        self.state.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.state.name.lock() = Some(name.to_string());
    }

    /// Open a transactional map; the map is shared between transactions,
    /// the returned handle scopes operations to this one.
    pub fn open_map<K, V>(
        &self,
        name: &str,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
    ) -> Result<TransactionMap<K, V>, TxError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let inner = TxMapInner::open(&self.store, name, key_type, value_type)?;
        Ok(TransactionMap::new(self.clone(), inner))
    }

    /// Log-sequence marker for a partial rollback.
    pub fn set_savepoint(&self) -> u64 {
        self.state
            .undo
            .lock()
            .last()
            .map(|r| r.log_id)
            .unwrap_or(0)
    }

    /// Undo every write made after the savepoint, newest first.
    pub fn rollback_to_savepoint(&self, savepoint: u64) -> Result<(), TxError> {
        self.expect_active()?;
        let to_undo: Vec<UndoRecord> = {
            let mut undo = self.state.undo.lock();
            let keep = undo
                .iter()
                .position(|r| r.log_id > savepoint)
                .unwrap_or(undo.len());
            undo.split_off(keep)
        };
        for record in to_undo.iter().rev() {
            self.apply_rollback_record(record)?;
            self.remove_persisted_undo(record.log_id)?;
        }
        Ok(())
    }

    /// First phase of a two-phase commit: persist the undo log and the
    /// transaction name so the outcome survives a crash.
    pub fn prepare(&self) -> Result<(), TxError> {
        {
            let mut status = self.state.status.lock();
            if *status != TxStatus::Open {
                return Err(TxError::internal(format!(
                    "prepare on a transaction in state {:?}",
                    *status
                )));
            }
            *status = TxStatus::Prepared;
        }
        let name = self.name().unwrap_or_default();
        self.store
            .registry
            .put(self.state.id as i64, format!("prepared,{name}"))?;
        self.store.store.commit()?;
        info!(tx = self.state.id, "transaction prepared");
        Ok(())
    }

    /// Promote every uncommitted write to committed, walking the undo log
    /// in forward order, then clear the log.
    pub fn commit(&self) -> Result<(), TxError> {
        let was_prepared = {
            let mut status = self.state.status.lock();
            match *status {
                TxStatus::Open => {
                    *status = TxStatus::Committing;
                    false
                }
                TxStatus::Prepared => {
                    *status = TxStatus::Committing;
                    true
                }
                other => {
                    return Err(TxError::internal(format!(
                        "commit on a transaction in state {other:?}"
                    )));
                }
            }
        };

        let undo: Vec<UndoRecord> = self.state.undo.lock().clone();
        for record in &undo {
            let Some(map) = self.store.map_applier(record.map_id) else {
                return Err(TxError::internal(format!(
                    "map {} of the undo log is not open",
                    record.map_id
                )));
            };
            map.apply_commit(self.state.id, &record.key)?;
        }
        self.finish(TxStatus::Closed, was_prepared)?;
        debug!(tx = self.state.id, writes = undo.len(), "transaction committed");
        Ok(())
    }

    /// Restore every previous value, walking the undo log in reverse.
    pub fn rollback(&self) -> Result<(), TxError> {
        let was_prepared = {
            let mut status = self.state.status.lock();
            match *status {
                TxStatus::Open | TxStatus::Prepared => {
                    let prepared = *status == TxStatus::Prepared;
                    *status = TxStatus::Committing;
                    prepared
                }
                other => {
                    return Err(TxError::internal(format!(
                        "rollback on a transaction in state {other:?}"
                    )));
                }
            }
        };

        let undo: Vec<UndoRecord> = self.state.undo.lock().clone();
        for record in undo.iter().rev() {
            self.apply_rollback_record(record)?;
        }
        self.finish(TxStatus::RolledBack, was_prepared)?;
        debug!(tx = self.state.id, "transaction rolled back");
        Ok(())
    }

    fn apply_rollback_record(&self, record: &UndoRecord) -> Result<(), TxError> {
        let Some(map) = self.store.map_applier(record.map_id) else {
            return Err(TxError::internal(format!(
                "map {} of the undo log is not open",
                record.map_id
            )));
        };
        map.apply_rollback(self.state.id, &record.key, &record.prev)
    }

    fn remove_persisted_undo(&self, log_id: u64) -> Result<(), TxError> {
        if let Some(map) = self.state.undo_map.lock().as_ref() {
            map.remove(&(log_id as i64))?;
        }
        Ok(())
    }

    /// Common tail of commit and rollback: drop persisted state, release
    /// the version hold, and wake blocked writers.
    fn finish(&self, final_status: TxStatus, was_prepared: bool) -> Result<(), TxError> {
        self.state.undo.lock().clear();
        let undo_map = self.state.undo_map.lock().take();
        if undo_map.is_some() {
            self.store
                .store
                .remove_map(&format!("{UNDO_MAP_PREFIX}{:x}", self.state.id))?;
        }
        if was_prepared {
            self.store.registry.remove(&(self.state.id as i64))?;
            // Make the resolution durable; an in-doubt transaction must
            // not come back after the next crash.
            self.store.store.commit()?;
        }

        *self.state.status.lock() = final_status;
        self.store.transactions.lock().remove(&self.state.id);
        self.store.clear_wait(self.state.id);
        *self.state.hold.lock() = None;
        self.store.notify_lock_waiters();
        Ok(())
    }

    fn expect_active(&self) -> Result<(), TxError> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(TxError::internal("transaction is no longer active"))
        }
    }

    /// Append an undo record, both in memory and to the persisted log.
    pub(crate) fn append_undo(&self, record: UndoRecord) -> Result<(), TxError> {
        {
            let mut undo_map = self.state.undo_map.lock();
            if undo_map.is_none() {
                let map = self.store.store.open_map(
                    &format!("{UNDO_MAP_PREFIX}{:x}", self.state.id),
                    Arc::new(LongType) as Arc<dyn DataType<i64>>,
                    Arc::new(BytesType) as Arc<dyn DataType<Vec<u8>>>,
                )?;
                *undo_map = Some(map);
            }
            undo_map
                .as_ref()
                .unwrap()
                .put(record.log_id as i64, record.encode())?;
        }
        self.state.undo.lock().push(record);
        Ok(())
    }

    /// Drop the most recent undo record after a failed compare-and-set,
    /// before the write retries.
    pub(crate) fn pop_undo(&self) -> Result<(), TxError> {
        let record = self.state.undo.lock().pop();
        if let Some(record) = record {
            self.remove_persisted_undo(record.log_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InDoubtState {
    InDoubt,
    Commit,
    Rollback,
}

/// A prepared transaction surviving from before a crash, waiting for an
/// external coordinator to decide its outcome.
pub struct InDoubtTransaction {
    transaction: Transaction,
    state: InDoubtState,
}

impl InDoubtTransaction {
    pub(crate) fn new(transaction: Transaction, state: InDoubtState) -> Self {
        InDoubtTransaction { transaction, state }
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction.id()
    }

    pub fn transaction_name(&self) -> Option<String> {
        self.transaction.name()
    }

    pub fn state(&self) -> InDoubtState {
        self.state
    }

    /// Resolve the transaction. The maps it wrote must be open before the
    /// decision is applied.
    pub fn set_state(&mut self, state: InDoubtState) -> Result<(), TxError> {
        match state {
            InDoubtState::Commit => self.transaction.commit()?,
            InDoubtState::Rollback => self.transaction.rollback()?,
            InDoubtState::InDoubt => {
                return Err(TxError::internal("cannot reset a transaction to in-doubt"));
            }
        }
        self.state = state;
        Ok(())
    }
}
