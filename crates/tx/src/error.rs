use kurodb_storage::StoreError;
use thiserror::Error;

/// Errors raised by the transaction layer. Contention and integrity
/// failures are ordinary outcomes callers retry or report; `Internal`
/// indicates a broken invariant.
#[derive(Debug, Clone, Error)]
pub enum TxError {
    /// A row lock was still held by another transaction when the wait
    /// timeout expired.
    #[error("row is locked by transaction {owner}")]
    TxLocked { owner: u32 },

    /// The waits-for graph closed into a cycle; `chain` lists the
    /// transaction ids involved, starting with the victim.
    #[error("deadlock detected, transactions involved: {chain:?}")]
    TxDeadlock { chain: Vec<u32> },

    /// A table-level lock could not be acquired in time.
    #[error("lock wait timed out")]
    LockTimeout,

    /// An uncommitted change by another transaction conflicts with this
    /// operation.
    #[error("concurrent update by transaction {owner}")]
    ConcurrentUpdate { owner: u32 },

    /// Operation on a transaction in the wrong state, or a broken
    /// internal invariant.
    #[error("internal transaction error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TxError {
    pub fn internal(message: impl Into<String>) -> Self {
        TxError::Internal(message.into())
    }
}
