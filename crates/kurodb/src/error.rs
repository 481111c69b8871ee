use kurodb_storage::StoreError;
use kurodb_tx::TxError;
use thiserror::Error;

/// Errors raised by the table and index bindings.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// A unique index already holds a committed entry for the key.
    #[error("duplicate key in index {index}")]
    DuplicateKey { index: String },

    /// Another transaction has an uncommitted entry that would collide;
    /// the caller may retry after that transaction finishes.
    #[error("concurrent update in index {index}")]
    ConcurrentUpdate { index: String },

    /// The row to update or delete does not exist.
    #[error("row {key} not found")]
    RowNotFound { key: i64 },

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
