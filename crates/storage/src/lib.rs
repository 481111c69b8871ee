//! Log-structured, copy-on-write page store.
//!
//! The store persists any number of ordered maps into a single file by
//! appending immutable chunks; every commit writes one chunk holding the
//! dirty pages of all maps plus the layout map that ties roots and chunk
//! metadata together. Old pages stay readable until no open version needs
//! them, then their space is reclaimed and compacted away.

mod background;
mod cache;
mod chunk;
mod data_type;
mod data_util;
mod error;
mod file_store;
mod free_space;
mod mvmap;
mod mvmap_cursor;
mod page;
mod store;
mod store_commit;
mod store_compact;
mod value;
mod write_buffer;

pub use cache::{PageCache, TocCache};
pub use chunk::{Chunk, ChunkFooter};
pub use data_type::{BytesType, DataType, LongType, StringType, U64Type, ValueArrayType, ValueType};
pub use data_util::{
    BLOCK_SIZE, compose_position, decode_length, encode_length, fletcher32, position_chunk_id,
    position_is_leaf, position_max_length, position_offset,
};
pub use error::StoreError;
pub use file_store::FileStore;
pub use free_space::FreeSpaceMap;
pub use mvmap::{MvMap, RangeCursor, RootRef};
pub use mvmap_cursor::Cursor;
pub use page::{ChildRef, Page, PageContent};
pub use store::{
    LAYOUT_MAP_ID, META_MAP_ID, Store, StoreBuilder, VersionHold,
};
pub use value::Value;
pub use write_buffer::{ReadBuffer, WriteBuffer};
