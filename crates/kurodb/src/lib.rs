//! kurodb: an embedded, transactional key-value storage engine.
//!
//! The workspace splits into the log-structured, copy-on-write page store
//! (`kurodb-storage`), the multi-version transaction layer (`kurodb-tx`),
//! and this facade crate, which re-exports both and adds the table/index
//! bindings: a primary index on the row key, secondary indexes on column
//! values with uniqueness checks, a zero-storage delegate index, and a
//! sorted-run bulk build.

mod bulk;
mod delegate;
mod error;
mod index;
mod primary;
mod row;
mod secondary;
mod table_lock;

pub use bulk::BufferedRows;
pub use delegate::DelegateIndex;
pub use error::IndexError;
pub use index::Index;
pub use primary::PrimaryIndex;
pub use row::{Row, index_key, index_key_max, index_key_min, key_matches_columns, row_key_of};
pub use secondary::SecondaryIndex;
pub use table_lock::{LockMode, TableLock};

pub use kurodb_storage::{
    BytesType, DataType, LongType, MvMap, Store, StoreBuilder, StoreError, StringType, U64Type,
    Value, ValueArrayType, ValueType,
};
pub use kurodb_tx::{
    InDoubtState, InDoubtTransaction, IsolationLevel, LobMeta, LobStorage, Transaction,
    TransactionMap, TransactionStore, TxError, TxStatus, Uncommitted, VersionedType,
    VersionedValue,
};
