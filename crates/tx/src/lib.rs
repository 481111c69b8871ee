//! Multi-version transaction layer above the page store.
//!
//! Transactional maps store versioned value triples (operation id,
//! committed slot, uncommitted slot). Writers install row-level ownership
//! optimistically with compare-and-set, blocked writers run deadlock
//! detection on the waits-for graph, and prepared transactions persist
//! their undo logs so an external coordinator can resolve them after a
//! crash. The large-object subsystem stores refcounted blobs whose
//! physical removal honors MVCC snapshot visibility.

mod error;
mod lob;
mod map;
mod store;
mod transaction;
mod versioned;
mod test;

pub use error::TxError;
pub use lob::{LobMeta, LobStorage};
pub use map::{TransactionMap, TxEntryIter, UncommittedKeyIter};
pub use store::{IsolationLevel, TransactionStore};
pub use transaction::{InDoubtState, InDoubtTransaction, Transaction, TxStatus};
pub use versioned::{
    MAX_TX_ID, Uncommitted, VersionedType, VersionedValue, op_log_id, op_tx_id, pack_op_id,
};
