use std::collections::BTreeMap;

use crate::error::StoreError;

/// Size of a file block. The store header occupies the first two blocks,
/// every chunk occupies a contiguous run of whole blocks.
pub const BLOCK_SIZE: usize = 4096;

/// Number of blocks reserved at the start of the file for the duplicated
/// store header.
pub const STORE_HEADER_BLOCKS: u64 = 2;

/// Fixed space reserved at the start of a chunk for its text header.
/// Page offsets within a chunk are measured from the chunk start, so the
/// first page always begins at this offset.
pub const CHUNK_HEADER_LEN: usize = 512;

/// Fixed size of the chunk footer, placed at the very end of the chunk's
/// last block.
pub const CHUNK_FOOTER_LEN: usize = 128;

/// Calculate the Fletcher32 checksum.
///
/// # Arguments
/// * `bytes` - The byte slice to calculate checksum for
/// * `offset` - Initial offset into the byte slice
/// * `length` - The message length (if odd, 0 is appended)
///
/// # Panics
/// Panics if offset + length exceeds the bounds of the byte slice
pub fn fletcher32(bytes: &[u8], offset: usize, length: usize) -> u32 {
    let (mut sum1, mut sum2) = (0xffff_u32, 0xffff_u32);
    let (mut i, len) = (offset, offset + (length & !1));

    assert!(len <= bytes.len(), "offset + length exceeds byte slice bounds");

    while i < len {
        // reduce after 360 words (each word is two bytes)
        let end = std::cmp::min(i + 720, len);
        while i < end {
            let x = ((bytes[i] as u32) << 8) | (bytes[i + 1] as u32);
            i += 2;
            sum1 += x;
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    // Handle odd length: append 0
    if (length & 1) != 0 {
        assert!(i < bytes.len(), "odd length handling: index out of bounds");
        let x = (bytes[i] as u32) << 8;
        sum1 += x;
        sum2 += sum1;
    }

    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);

    (sum2 << 16) | sum1
}

// ---------------------------------------------------------------------------
// Page positions
//
// A page position packs, from most to least significant bit:
//   chunk id (26 bits) | offset within chunk (32 bits) | length code (5 bits)
//   | type (1 bit, 1 = leaf)
// Position 0 means the page has not been saved yet.
// ---------------------------------------------------------------------------

/// Maximum encodable chunk id (26 bits).
pub const MAX_CHUNK_ID: u32 = (1 << 26) - 1;

/// Marker for leaf pages in the position type bit.
pub const PAGE_TYPE_LEAF: u64 = 1;

pub fn compose_position(chunk_id: u32, offset: u32, length: u32, leaf: bool) -> u64 {
    debug_assert!(chunk_id <= MAX_CHUNK_ID);
    let code = encode_length(length) as u64;
    ((chunk_id as u64) << 38)
        | ((offset as u64) << 6)
        | (code << 1)
        | if leaf { PAGE_TYPE_LEAF } else { 0 }
}

pub fn position_chunk_id(pos: u64) -> u32 {
    (pos >> 38) as u32
}

pub fn position_offset(pos: u64) -> u32 {
    (pos >> 6) as u32
}

pub fn position_length_code(pos: u64) -> u8 {
    ((pos >> 1) & 0x1f) as u8
}

pub fn position_is_leaf(pos: u64) -> bool {
    (pos & 1) == PAGE_TYPE_LEAF
}

/// The upper bound of the length class a position's code stands for.
/// Codes alternate between 2^n and 3 * 2^(n-1): 32, 48, 64, 96, 128, ...
pub fn position_max_length(pos: u64) -> u32 {
    decode_length(position_length_code(pos))
}

pub fn encode_length(length: u32) -> u8 {
    let mut code = 0u8;
    while code < 31 && decode_length(code) < length {
        code += 1;
    }
    code
}

pub fn decode_length(code: u8) -> u32 {
    (2 + (code as u32 & 1)) << ((code >> 1) + 4)
}

/// Check value embedded in each saved page header: the XOR of three 16-bit
/// folds of the chunk id, the offset, and the stored page length.
pub fn position_check(chunk_id: u32, offset: u32, length: u32) -> u16 {
    fold16(chunk_id) ^ fold16(offset) ^ fold16(length)
}

fn fold16(x: u32) -> u16 {
    (x ^ (x >> 16)) as u16
}

// ---------------------------------------------------------------------------
// Text-encoded metadata maps
//
// The store header, chunk headers and footers, and chunk records in the
// layout map all share one representation: `key:value` pairs joined by
// commas, numbers rendered as lowercase hex without prefix, terminated by
// a `fletcher` pair checksumming everything before it.
// ---------------------------------------------------------------------------

pub fn append_map(buf: &mut String, key: &str, value: &str) {
    if !buf.is_empty() {
        buf.push(',');
    }
    buf.push_str(key);
    buf.push(':');
    buf.push_str(value);
}

pub fn append_map_hex(buf: &mut String, key: &str, value: u64) {
    append_map(buf, key, &format!("{value:x}"));
}

/// Append the trailing `fletcher` pair over everything written so far.
pub fn seal_map(buf: &mut String) {
    let check = fletcher32(buf.as_bytes(), 0, buf.len());
    buf.push_str(&format!(",fletcher:{check:08x}"));
    buf.push('\n');
}

/// Parse a `key:value,...` map without validating a checksum.
pub fn parse_map(text: &str) -> Result<BTreeMap<String, String>, StoreError> {
    let mut map = BTreeMap::new();
    for pair in text.trim_end_matches(['\n', '\0', ' ']).split(',') {
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once(':') else {
            return Err(StoreError::file_corrupt(format!(
                "malformed metadata entry {pair:?}"
            )));
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Parse a sealed map, verifying its trailing `fletcher` pair. Returns
/// `None` when the bytes are not a valid sealed map (callers scanning for
/// candidates treat that as "keep looking", not as corruption).
pub fn parse_checked_map(bytes: &[u8]) -> Option<BTreeMap<String, String>> {
    let end = bytes.iter().position(|&b| b == b'\n')?;
    let text = std::str::from_utf8(&bytes[..end]).ok()?;
    let tail = text.rfind(",fletcher:")?;
    let expected = u32::from_str_radix(&text[tail + ",fletcher:".len()..], 16).ok()?;
    if fletcher32(text.as_bytes(), 0, tail) != expected {
        return None;
    }
    parse_map(&text[..tail]).ok()
}

pub fn map_hex(map: &BTreeMap<String, String>, key: &str) -> Result<u64, StoreError> {
    let value = map
        .get(key)
        .ok_or_else(|| StoreError::file_corrupt(format!("missing metadata key {key:?}")))?;
    u64::from_str_radix(value, 16)
        .map_err(|_| StoreError::file_corrupt(format!("invalid hex value for {key:?}")))
}

pub fn map_hex_or(map: &BTreeMap<String, String>, key: &str, default: u64) -> u64 {
    map.get(key)
        .and_then(|v| u64::from_str_radix(v, 16).ok())
        .unwrap_or(default)
}

/// Render a byte slice as lowercase hex, used for occupancy bitmaps in
/// chunk records.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn from_hex(text: &str) -> Result<Vec<u8>, StoreError> {
    if text.len() % 2 != 0 {
        return Err(StoreError::file_corrupt("odd hex string length"));
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    for i in (0..text.len()).step_by(2) {
        let byte = u8::from_str_radix(&text[i..i + 2], 16)
            .map_err(|_| StoreError::file_corrupt("invalid hex string"))?;
        out.push(byte);
    }
    Ok(out)
}
