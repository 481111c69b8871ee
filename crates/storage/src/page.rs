use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data_type::DataType;
use crate::data_util::{self, position_check};
use crate::error::StoreError;
use crate::write_buffer::{ReadBuffer, WriteBuffer};

/// Page type bit in the on-disk type byte: set for leaf pages.
const TYPE_LEAF: u8 = 1;
/// Compression flag in the type byte.
const TYPE_COMPRESSED: u8 = 2;

/// Fixed prefix of a serialized page: i32 length, u16 check, u8 type.
const PAGE_HEADER_PREFIX: usize = 7;

/// One B-tree page: an ordered run of keys plus either values (leaf) or
/// child references (internal node; always `keys.len() + 1` children).
///
/// A page is *unsaved* while its position is zero; an unsaved page is
/// owned exclusively by the writer that created it. Once saved the page
/// is immutable and shared through `Arc`, and its position is set exactly
/// once during chunk serialization.
pub struct Page<K, V> {
    pub keys: Vec<K>,
    pub content: PageContent<K, V>,
    position: AtomicU64,
    /// Estimated in-memory size in bytes, maintained by the owning map.
    pub memory: u32,
}

pub enum PageContent<K, V> {
    Leaf(Vec<V>),
    Node(Vec<ChildRef<K, V>>),
}

/// Reference from an internal page to one child subtree. While the child
/// is unsaved it is held in memory; after a save only the position
/// remains and the child is re-read through the page cache.
pub struct ChildRef<K, V> {
    pub pos: u64,
    /// Total number of entries in the child's subtree.
    pub count: u64,
    pub page: Option<Arc<Page<K, V>>>,
}

impl<K, V> Clone for ChildRef<K, V> {
    fn clone(&self) -> Self {
        ChildRef {
            pos: self.pos,
            count: self.count,
            page: self.page.clone(),
        }
    }
}

impl<K, V> ChildRef<K, V> {
    pub fn unsaved(page: Arc<Page<K, V>>) -> Self {
        let count = page.total_count();
        ChildRef {
            pos: 0,
            count,
            page: Some(page),
        }
    }

    pub fn saved(pos: u64, count: u64) -> Self {
        ChildRef {
            pos,
            count,
            page: None,
        }
    }
}

impl<K, V> Page<K, V> {
    pub fn empty_leaf() -> Self {
        Page {
            keys: Vec::new(),
            content: PageContent::Leaf(Vec::new()),
            position: AtomicU64::new(0),
            memory: PAGE_BASE_MEMORY,
        }
    }

    pub fn new_leaf(keys: Vec<K>, values: Vec<V>, memory: u32) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        Page {
            keys,
            content: PageContent::Leaf(values),
            position: AtomicU64::new(0),
            memory,
        }
    }

    pub fn new_node(keys: Vec<K>, children: Vec<ChildRef<K, V>>, memory: u32) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        Page {
            keys,
            content: PageContent::Node(children),
            position: AtomicU64::new(0),
            memory,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf(_))
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn is_saved(&self) -> bool {
        self.position() != 0
    }

    pub fn mark_saved(&self, pos: u64) {
        self.position.store(pos, Ordering::Release);
    }

    pub fn total_count(&self) -> u64 {
        match &self.content {
            PageContent::Leaf(values) => values.len() as u64,
            PageContent::Node(children) => children.iter().map(|c| c.count).sum(),
        }
    }

    pub fn children(&self) -> &[ChildRef<K, V>] {
        match &self.content {
            PageContent::Node(children) => children,
            PageContent::Leaf(_) => &[],
        }
    }

    pub fn values(&self) -> &[V] {
        match &self.content {
            PageContent::Leaf(values) => values,
            PageContent::Node(_) => &[],
        }
    }

    /// Binary search with the map's comparator. `Ok` holds the index of an
    /// exact match, `Err` the insertion point.
    pub fn search(
        &self,
        key: &K,
        compare: &dyn Fn(&K, &K) -> std::cmp::Ordering,
    ) -> Result<usize, usize> {
        self.keys.binary_search_by(|probe| compare(probe, key))
    }

    /// Index of the child to descend into for `key`.
    pub fn child_index(
        &self,
        key: &K,
        compare: &dyn Fn(&K, &K) -> std::cmp::Ordering,
    ) -> usize {
        match self.search(key, compare) {
            Ok(index) => index + 1,
            Err(index) => index,
        }
    }
}

/// Fixed per-page memory overhead estimate.
pub const PAGE_BASE_MEMORY: u32 = 128;
/// Per-entry memory overhead estimate on top of key/value memory.
pub const PAGE_ENTRY_MEMORY: u32 = 24;

/// Serialize a page into the chunk buffer. Children of an internal page
/// must already be saved (their positions patched into the child refs);
/// chunk serialization walks bottom-up. Returns the packed page position.
pub fn write_page<K, V>(
    page: &Page<K, V>,
    map_id: u32,
    chunk_id: u32,
    buf: &mut WriteBuffer,
    key_type: &dyn DataType<K>,
    value_type: &dyn DataType<V>,
    compress: bool,
) -> u64 {
    let offset = buf.position() as u32;
    let leaf = page.is_leaf();
    let mut type_byte = if leaf { TYPE_LEAF } else { 0 };

    // Fixed header prefix, length and check patched afterwards. The map
    // id stays outside the compressible body so compaction can route a
    // page without decoding it.
    buf.put_u32(0);
    buf.put_u16(0);
    buf.put_u8(0);
    buf.put_var_u64(map_id as u64);

    let mut body = WriteBuffer::with_capacity(1024);
    body.put_var_u64(page.keys.len() as u64);
    for key in &page.keys {
        key_type.write(&mut body, key);
    }
    match &page.content {
        PageContent::Leaf(values) => {
            for value in values {
                value_type.write(&mut body, value);
            }
        }
        PageContent::Node(children) => {
            for child in children {
                debug_assert!(child.pos != 0, "child page not saved yet");
                body.put_u64(child.pos);
            }
            for child in children {
                body.put_var_u64(child.count);
            }
        }
    }

    let body_bytes = body.as_slice();
    if compress && body_bytes.len() > 64 {
        let compressed = lz4_flex::compress(body_bytes);
        if compressed.len() < body_bytes.len() {
            type_byte |= TYPE_COMPRESSED;
            buf.put_var_u64(body_bytes.len() as u64);
            buf.put(&compressed);
        } else {
            buf.put(body_bytes);
        }
    } else {
        buf.put(body_bytes);
    }

    let length = buf.position() as u32 - offset;
    buf.put_u32_at(offset as usize, length);
    buf.put_u16_at(
        offset as usize + 4,
        position_check(chunk_id, offset, length),
    );
    buf.put_at(offset as usize + 6, &[type_byte]);

    let pos = data_util::compose_position(chunk_id, offset, length, leaf);
    page.mark_saved(pos);
    pos
}

/// Decode a page previously read from its chunk. `bytes` starts at the
/// page's offset and may extend past its end (reads use the position's
/// length class); the embedded length bounds the record.
pub fn read_page<K, V>(
    bytes: &[u8],
    pos: u64,
    key_type: &dyn DataType<K>,
    value_type: &dyn DataType<V>,
) -> Result<Page<K, V>, StoreError> {
    let mut header = ReadBuffer::new(bytes);
    let length = header.read_u32()? as usize;
    if length < PAGE_HEADER_PREFIX || length > bytes.len() {
        return Err(StoreError::file_corrupt(format!(
            "page length {length} out of range at position {pos:x}"
        )));
    }
    let check = header.read_u16()?;
    let type_byte = header.read_u8()?;

    let chunk_id = data_util::position_chunk_id(pos);
    let offset = data_util::position_offset(pos);
    let expected = position_check(chunk_id, offset, length as u32);
    if check != expected {
        return Err(StoreError::file_corrupt(format!(
            "page check mismatch at position {pos:x}"
        )));
    }
    let leaf = type_byte & TYPE_LEAF != 0;
    if leaf != data_util::position_is_leaf(pos) {
        return Err(StoreError::file_corrupt(format!(
            "page type mismatch at position {pos:x}"
        )));
    }

    let mut prefix = ReadBuffer::new(&bytes[PAGE_HEADER_PREFIX..length]);
    let _map_id = prefix.read_var_u64()? as u32;
    let raw = prefix.read(prefix.remaining())?;
    let decompressed;
    let body_bytes = if type_byte & TYPE_COMPRESSED != 0 {
        let mut cursor = ReadBuffer::new(raw);
        let uncompressed_len = cursor.read_var_u64()? as usize;
        let compressed = cursor.read(cursor.remaining())?;
        decompressed = lz4_flex::decompress(compressed, uncompressed_len)
            .map_err(|_| StoreError::file_corrupt("page decompression failed"))?;
        decompressed.as_slice()
    } else {
        raw
    };

    let mut body = ReadBuffer::new(body_bytes);
    let key_count = body.read_var_u64()? as usize;
    let mut keys = Vec::with_capacity(key_count);
    let mut memory = PAGE_BASE_MEMORY;
    for _ in 0..key_count {
        let key = key_type.read(&mut body)?;
        memory += key_type.memory(&key) + PAGE_ENTRY_MEMORY;
        keys.push(key);
    }

    let page = if leaf {
        let mut values = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let value = value_type.read(&mut body)?;
            memory += value_type.memory(&value);
            values.push(value);
        }
        Page::new_leaf(keys, values, memory)
    } else {
        let child_count = key_count + 1;
        let mut positions = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            positions.push(body.read_u64()?);
        }
        let mut children = Vec::with_capacity(child_count);
        for child_pos in positions {
            let count = body.read_var_u64()?;
            memory += PAGE_ENTRY_MEMORY;
            children.push(ChildRef::saved(child_pos, count));
        }
        Page::new_node(keys, children, memory)
    };
    page.mark_saved(pos);
    Ok(page)
}

/// Map id stored in a serialized page header, without decoding the body.
/// Compaction uses this to route live pages back to their owning map.
pub fn read_page_map_id(bytes: &[u8]) -> Result<u32, StoreError> {
    let mut header = ReadBuffer::new(bytes);
    let _length = header.read_u32()?;
    let _check = header.read_u16()?;
    let _type = header.read_u8()?;
    Ok(header.read_var_u64()? as u32)
}
