use bitvec::prelude::{BitVec, Lsb0};

use crate::data_util::{
    self, BLOCK_SIZE, CHUNK_FOOTER_LEN, CHUNK_HEADER_LEN,
};
use crate::error::StoreError;

/// Metadata for one chunk: a contiguous, immutable run of 4 KiB blocks
/// holding the pages written by a single commit.
///
/// The same key/value text renders three ways: the header sealed into the
/// chunk's first bytes, the footer sealed into its last bytes (just enough
/// to locate and verify the chunk during recovery), and the record stored
/// in the layout map under `chunk.<hexid>`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u32,
    /// First block of the chunk within the file.
    pub block: u64,
    /// Length in blocks.
    pub len: u32,
    /// Pages originally written into the chunk.
    pub page_count: u32,
    /// Pages not yet superseded.
    pub page_count_live: u32,
    /// Sum of the maximum-length classes of all pages.
    pub max_len: u64,
    /// Same sum restricted to live pages; zero means the chunk is dead.
    pub max_len_live: u64,
    /// Version of the commit that produced the chunk.
    pub version: u64,
    /// Milliseconds since store creation when the chunk was written.
    pub time: u64,
    /// Time the chunk became fully dead, zero while live.
    pub unused: u64,
    /// Store version at which the last live page was superseded.
    pub unused_at_version: u64,
    /// Highest map id in use when the chunk was written.
    pub map_id: u32,
    /// Predicted start block of the next chunk.
    pub next: u64,
    /// Position of the layout map's root page as of this commit.
    pub layout_root_pos: u64,
    /// Byte offset of the table of contents within the chunk.
    pub toc_pos: u32,
    /// Bit `k` set means page `k` has been superseded.
    pub occupancy: BitVec<u8, Lsb0>,
    /// Pages that must not be evacuated while pinned.
    pub pin_count: u32,
}

impl Chunk {
    pub fn new(id: u32, version: u64, time: u64) -> Self {
        Chunk {
            id,
            block: 0,
            len: 0,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            version,
            time,
            unused: 0,
            unused_at_version: 0,
            map_id: 0,
            next: 0,
            layout_root_pos: 0,
            toc_pos: 0,
            occupancy: BitVec::new(),
            pin_count: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.max_len_live > 0
    }

    pub fn is_dead(&self) -> bool {
        !self.is_live()
    }

    /// Percentage of the chunk still occupied by live pages.
    pub fn fill_rate(&self) -> u8 {
        if self.max_len == 0 {
            return 0;
        }
        if self.max_len_live >= self.max_len {
            return 100;
        }
        (100 * self.max_len_live / self.max_len) as u8
    }

    pub fn is_rewritable(&self) -> bool {
        self.block != 0
            && self.is_live()
            && self.pin_count == 0
            && self.page_count_live < self.page_count
    }

    /// Number of dead pages recorded in the occupancy bitmap.
    pub fn dead_page_count(&self) -> u32 {
        self.occupancy.count_ones() as u32
    }

    fn render(&self, buf: &mut String, with_occupancy: bool) {
        data_util::append_map_hex(buf, "chunk", self.id as u64);
        data_util::append_map_hex(buf, "block", self.block);
        data_util::append_map_hex(buf, "len", self.len as u64);
        data_util::append_map_hex(buf, "liveMax", self.max_len_live);
        data_util::append_map_hex(buf, "livePages", self.page_count_live as u64);
        data_util::append_map_hex(buf, "map", self.map_id as u64);
        data_util::append_map_hex(buf, "max", self.max_len);
        data_util::append_map_hex(buf, "next", self.next);
        if with_occupancy && self.dead_page_count() > 0 {
            data_util::append_map(buf, "occ", &data_util::to_hex(self.occupancy.as_raw_slice()));
        }
        data_util::append_map_hex(buf, "pages", self.page_count as u64);
        if self.pin_count > 0 {
            data_util::append_map_hex(buf, "pinCount", self.pin_count as u64);
        }
        data_util::append_map_hex(buf, "root", self.layout_root_pos);
        data_util::append_map_hex(buf, "time", self.time);
        data_util::append_map_hex(buf, "toc", self.toc_pos as u64);
        if self.unused > 0 {
            data_util::append_map_hex(buf, "unused", self.unused);
        }
        if self.unused_at_version > 0 {
            data_util::append_map_hex(buf, "unusedVersion", self.unused_at_version);
        }
        data_util::append_map_hex(buf, "version", self.version);
    }

    /// The record stored in the layout map under `chunk.<hexid>`.
    pub fn as_record(&self) -> String {
        let mut buf = String::new();
        self.render(&mut buf, true);
        buf
    }

    pub fn from_record(text: &str) -> Result<Chunk, StoreError> {
        let map = data_util::parse_map(text)?;
        let mut chunk = Chunk::new(
            data_util::map_hex(&map, "chunk")? as u32,
            data_util::map_hex(&map, "version")?,
            data_util::map_hex_or(&map, "time", 0),
        );
        chunk.block = data_util::map_hex(&map, "block")?;
        chunk.len = data_util::map_hex(&map, "len")? as u32;
        chunk.page_count = data_util::map_hex_or(&map, "pages", 0) as u32;
        chunk.page_count_live = data_util::map_hex_or(&map, "livePages", 0) as u32;
        chunk.max_len = data_util::map_hex_or(&map, "max", 0);
        chunk.max_len_live = data_util::map_hex_or(&map, "liveMax", 0);
        chunk.map_id = data_util::map_hex_or(&map, "map", 0) as u32;
        chunk.next = data_util::map_hex_or(&map, "next", 0);
        chunk.layout_root_pos = data_util::map_hex_or(&map, "root", 0);
        chunk.toc_pos = data_util::map_hex_or(&map, "toc", 0) as u32;
        chunk.unused = data_util::map_hex_or(&map, "unused", 0);
        chunk.unused_at_version = data_util::map_hex_or(&map, "unusedVersion", 0);
        chunk.pin_count = data_util::map_hex_or(&map, "pinCount", 0) as u32;
        chunk.occupancy = match map.get("occ") {
            Some(hex) => BitVec::from_vec(data_util::from_hex(hex)?),
            None => BitVec::repeat(false, chunk.page_count as usize),
        };
        if chunk.occupancy.len() < chunk.page_count as usize {
            chunk.occupancy.resize(chunk.page_count as usize, false);
        }
        Ok(chunk)
    }

    /// Sealed header text padded to [`CHUNK_HEADER_LEN`]; pages start right
    /// after it, so page offsets within the chunk never depend on the
    /// header's text length.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut text = String::new();
        self.render(&mut text, false);
        data_util::seal_map(&mut text);
        let mut bytes = text.into_bytes();
        assert!(bytes.len() <= CHUNK_HEADER_LEN, "chunk header overflow");
        bytes.resize(CHUNK_HEADER_LEN, 0);
        bytes
    }

    pub fn parse_header(bytes: &[u8]) -> Option<Chunk> {
        let map = data_util::parse_checked_map(bytes)?;
        let mut text = String::new();
        for (key, value) in &map {
            data_util::append_map(&mut text, key, value);
        }
        Chunk::from_record(&text).ok()
    }

    /// Sealed footer text padded to [`CHUNK_FOOTER_LEN`], written into the
    /// last bytes of the chunk's final block. It duplicates just enough of
    /// the header to locate and validate the chunk during a backward scan.
    pub fn footer_bytes(&self) -> Vec<u8> {
        let mut text = String::new();
        data_util::append_map_hex(&mut text, "chunk", self.id as u64);
        data_util::append_map_hex(&mut text, "block", self.block);
        data_util::append_map_hex(&mut text, "len", self.len as u64);
        data_util::append_map_hex(&mut text, "version", self.version);
        data_util::seal_map(&mut text);
        let mut bytes = text.into_bytes();
        assert!(bytes.len() <= CHUNK_FOOTER_LEN, "chunk footer overflow");
        bytes.resize(CHUNK_FOOTER_LEN, 0);
        bytes
    }

    pub fn parse_footer(bytes: &[u8]) -> Option<ChunkFooter> {
        let map = data_util::parse_checked_map(bytes)?;
        Some(ChunkFooter {
            id: data_util::map_hex(&map, "chunk").ok()? as u32,
            block: data_util::map_hex(&map, "block").ok()?,
            len: data_util::map_hex(&map, "len").ok()? as u32,
            version: data_util::map_hex(&map, "version").ok()?,
        })
    }

    /// Total size of the chunk in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.len as u64 * BLOCK_SIZE as u64
    }

    /// File offset of a byte offset within this chunk.
    pub fn file_offset(&self, offset_in_chunk: u32) -> u64 {
        self.block * BLOCK_SIZE as u64 + offset_in_chunk as u64
    }
}

/// The fields recoverable from a chunk footer alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub id: u32,
    pub block: u64,
    pub len: u32,
    pub version: u64,
}
