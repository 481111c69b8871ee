use crate::chunk::Chunk;

fn sample_chunk() -> Chunk {
    let mut chunk = Chunk::new(123, 789, 1234567890);
    chunk.block = 456;
    chunk.len = 3;
    chunk.page_count = 10;
    chunk.page_count_live = 8;
    chunk.max_len = 9999;
    chunk.max_len_live = 7777;
    chunk.map_id = 42;
    chunk.next = 300;
    chunk.layout_root_pos = 0xdeadbeef;
    chunk.toc_pos = 2048;
    chunk.occupancy = bitvec::vec::BitVec::repeat(false, 10);
    chunk.occupancy.set(1, true);
    chunk.occupancy.set(7, true);
    chunk
}

#[test]
fn test_header_roundtrip() {
    let original = sample_chunk();
    let bytes = original.header_bytes();
    assert_eq!(bytes.len(), crate::data_util::CHUNK_HEADER_LEN);

    let parsed = Chunk::parse_header(&bytes).expect("valid header");
    assert_eq!(parsed.id, original.id);
    assert_eq!(parsed.block, original.block);
    assert_eq!(parsed.len, original.len);
    assert_eq!(parsed.version, original.version);
    assert_eq!(parsed.page_count, original.page_count);
    assert_eq!(parsed.max_len, original.max_len);
    assert_eq!(parsed.max_len_live, original.max_len_live);
    assert_eq!(parsed.map_id, original.map_id);
    assert_eq!(parsed.next, original.next);
    assert_eq!(parsed.layout_root_pos, original.layout_root_pos);
    assert_eq!(parsed.toc_pos, original.toc_pos);
}

#[test]
fn test_footer_roundtrip() {
    let original = sample_chunk();
    let bytes = original.footer_bytes();
    assert_eq!(bytes.len(), crate::data_util::CHUNK_FOOTER_LEN);

    let footer = Chunk::parse_footer(&bytes).expect("valid footer");
    assert_eq!(footer.id, original.id);
    assert_eq!(footer.block, original.block);
    assert_eq!(footer.len, original.len);
    assert_eq!(footer.version, original.version);
}

#[test]
fn test_header_rejects_corruption() {
    let mut bytes = sample_chunk().header_bytes();
    bytes[10] ^= 0x01;
    assert!(Chunk::parse_header(&bytes).is_none());
}

#[test]
fn test_record_roundtrip_keeps_occupancy() {
    let original = sample_chunk();
    let record = original.as_record();
    let parsed = Chunk::from_record(&record).expect("valid record");
    assert_eq!(parsed.dead_page_count(), 2);
    assert!(parsed.occupancy[1]);
    assert!(parsed.occupancy[7]);
    assert!(!parsed.occupancy[0]);
    assert_eq!(parsed.max_len_live, original.max_len_live);
}

#[test]
fn test_fill_rate_and_lifecycle() {
    let mut chunk = sample_chunk();
    assert_eq!(chunk.fill_rate(), (100 * 7777 / 9999) as u8);
    assert!(chunk.is_live());
    assert!(chunk.is_rewritable());

    chunk.max_len_live = 0;
    assert!(chunk.is_dead());
    assert!(!chunk.is_rewritable());
}
