use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use kurodb_storage::{
    BytesType, DataType, LongType, MvMap, ReadBuffer, Store, StoreError, WriteBuffer,
};

use crate::error::TxError;

/// Size of the content blocks the stream store splits large objects into.
const STREAM_BLOCK_SIZE: usize = 256 * 1024;

/// How often the cleanup worker checks the pending-removal queue.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(50);

/// Large-object metadata: where the bytes live plus bookkeeping for the
/// owning table.
#[derive(Debug, Clone, PartialEq)]
pub struct LobMeta {
    /// Stream-store id: an encoded list of content block ids.
    pub stream_id: Vec<u8>,
    pub table_id: i32,
    pub byte_count: u64,
    pub hash: u64,
}

impl LobMeta {
    fn encode(&self) -> Vec<u8> {
        let mut buf = WriteBuffer::with_capacity(self.stream_id.len() + 24);
        buf.put_var_u64(self.stream_id.len() as u64);
        buf.put(&self.stream_id);
        buf.put_var_int(self.table_id);
        buf.put_var_u64(self.byte_count);
        buf.put_var_u64(self.hash);
        buf.as_slice().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<LobMeta, StoreError> {
        let mut buf = ReadBuffer::new(bytes);
        let stream_len = buf.read_var_u64()? as usize;
        let stream_id = buf.read(stream_len)?.to_vec();
        let table_id = buf.read_var_int()?;
        let byte_count = buf.read_var_u64()?;
        let hash = buf.read_var_u64()?;
        Ok(LobMeta {
            stream_id,
            table_id,
            byte_count,
            hash,
        })
    }
}

struct PendingRemoval {
    /// Store version current when the blob was unlinked; the blocks stay
    /// until every snapshot that could still see the blob has ended.
    version: u64,
    blocks: Vec<i64>,
}

/// Refcounted blob storage above the page store: a stream store chunks
/// content into fixed-size blocks, metadata maps tie blob ids to streams,
/// and removal is deferred until the MVCC oldest-kept version has moved
/// past the unlink.
pub struct LobStorage {
    inner: Arc<LobInner>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

struct LobInner {
    store: Store,
    /// lob id -> encoded [`LobMeta`].
    meta: Arc<MvMap<i64, Vec<u8>>>,
    /// lob id -> stream id, for blobs not yet bound to a table.
    temp: Arc<MvMap<i64, Vec<u8>>>,
    /// (stream id, lob id) -> lob id; existence is what matters.
    refs: Arc<MvMap<Vec<u8>, i64>>,
    /// block id -> content bytes.
    data: Arc<MvMap<i64, Vec<u8>>>,
    next_lob_id: AtomicI64,
    next_block_id: AtomicI64,
    pending: Mutex<Vec<PendingRemoval>>,
    stop: AtomicBool,
}

impl LobStorage {
    pub fn open(store: Store) -> Result<LobStorage, TxError> {
        let meta = store.open_map(
            "lob.meta",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(BytesType) as Arc<dyn DataType<Vec<u8>>>,
        )?;
        let temp = store.open_map(
            "lob.temp",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(BytesType) as Arc<dyn DataType<Vec<u8>>>,
        )?;
        let refs = store.open_map(
            "lob.refs",
            Arc::new(BytesType) as Arc<dyn DataType<Vec<u8>>>,
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
        )?;
        let data = store.open_map(
            "lob.data",
            Arc::new(LongType) as Arc<dyn DataType<i64>>,
            Arc::new(BytesType) as Arc<dyn DataType<Vec<u8>>>,
        )?;

        let next_lob_id = meta.last_key()?.unwrap_or(0) + 1;
        let next_block_id = data.last_key()?.unwrap_or(0) + 1;

        let inner = Arc::new(LobInner {
            store,
            meta,
            temp,
            refs,
            data,
            next_lob_id: AtomicI64::new(next_lob_id),
            next_block_id: AtomicI64::new(next_block_id),
            pending: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let cleaner = Self::start_cleaner(&inner);
        Ok(LobStorage {
            inner,
            cleaner: Mutex::new(Some(cleaner)),
        })
    }

    /// Single-threaded cleanup executor honoring the store's oldest kept
    /// version.
    fn start_cleaner(inner: &Arc<LobInner>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        std::thread::Builder::new()
            .name("kurodb-lob-gc".to_string())
            .spawn(move || {
                loop {
                    std::thread::sleep(CLEANUP_INTERVAL);
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let _ = inner.drain_pending();
                }
            })
            .expect("spawn lob cleanup worker")
    }

    pub fn close(&self) {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.cleaner.lock().take() {
            let _ = handle.join();
        }
    }

    /// Store a new blob; returns its freshly allocated id.
    pub fn create_blob(&self, content: &[u8], table_id: i32) -> Result<i64, TxError> {
        let inner = &self.inner;
        let mut blocks = Vec::new();
        for chunk in content.chunks(STREAM_BLOCK_SIZE) {
            let block_id = inner.next_block_id.fetch_add(1, Ordering::AcqRel);
            inner.data.put(block_id, chunk.to_vec())?;
            blocks.push(block_id);
        }
        let stream_id = encode_stream_id(&blocks, content.len() as u64);

        let lob_id = inner.next_lob_id.fetch_add(1, Ordering::AcqRel);
        let meta = LobMeta {
            stream_id: stream_id.clone(),
            table_id,
            byte_count: content.len() as u64,
            hash: content_hash(content),
        };
        inner.meta.put(lob_id, meta.encode())?;
        inner.refs.put(ref_key(&stream_id, lob_id), lob_id)?;
        debug!(lob = lob_id, bytes = content.len(), "blob created");
        Ok(lob_id)
    }

    /// Register a blob id in the temporary map; temporary blobs belong to
    /// no table yet and are swept like ordinary removals when dropped.
    pub fn create_temp_blob(&self, content: &[u8]) -> Result<i64, TxError> {
        let lob_id = self.create_blob(content, -1)?;
        let meta = self.meta(lob_id)?;
        self.inner.temp.put(lob_id, meta.stream_id)?;
        Ok(lob_id)
    }

    pub fn meta(&self, lob_id: i64) -> Result<LobMeta, TxError> {
        let bytes = self
            .inner
            .meta
            .get(&lob_id)?
            .ok_or_else(|| TxError::internal(format!("blob {lob_id} does not exist")))?;
        Ok(LobMeta::decode(&bytes)?)
    }

    /// Read the full content of a blob.
    pub fn open_blob(&self, lob_id: i64) -> Result<Vec<u8>, TxError> {
        let meta = self.meta(lob_id)?;
        let (blocks, total) = decode_stream_id(&meta.stream_id)?;
        let mut content = Vec::with_capacity(total as usize);
        for block_id in blocks {
            let block = self
                .inner
                .data
                .get(&block_id)?
                .ok_or_else(|| TxError::internal(format!("missing blob block {block_id}")))?;
            content.extend_from_slice(&block);
        }
        Ok(content)
    }

    /// Copy a blob without touching its content: clone the metadata and
    /// add a reference to the same stream.
    pub fn copy_blob(&self, lob_id: i64, table_id: i32) -> Result<i64, TxError> {
        let mut meta = self.meta(lob_id)?;
        meta.table_id = table_id;
        let new_id = self.inner.next_lob_id.fetch_add(1, Ordering::AcqRel);
        self.inner.meta.put(new_id, meta.encode())?;
        self.inner
            .refs
            .put(ref_key(&meta.stream_id, new_id), new_id)?;
        debug!(from = lob_id, to = new_id, "blob copied");
        Ok(new_id)
    }

    /// Unlink a blob. When the last reference to its stream goes, the
    /// content blocks are queued for removal tied to the current version.
    pub fn remove_blob(&self, lob_id: i64) -> Result<(), TxError> {
        let inner = &self.inner;
        let Some(bytes) = inner.meta.get(&lob_id)? else {
            return Ok(());
        };
        let meta = LobMeta::decode(&bytes)?;
        inner.meta.remove(&lob_id)?;
        inner.temp.remove(&lob_id)?;
        inner.refs.remove(&ref_key(&meta.stream_id, lob_id))?;

        // Ceiling probe: any other key with the same stream prefix means
        // the stream is still referenced.
        let probe = stream_prefix(&meta.stream_id);
        let still_referenced = match inner.refs.ceiling_key(&probe)? {
            Some(key) => key.starts_with(&probe),
            None => false,
        };
        if !still_referenced {
            let (blocks, _) = decode_stream_id(&meta.stream_id)?;
            let version = inner.store.current_version();
            inner.pending.lock().push(PendingRemoval { version, blocks });
            trace!(lob = lob_id, "stream queued for removal");
        }
        Ok(())
    }

    /// Drop content blocks whose removal version is older than every open
    /// snapshot. The background worker calls this continuously; tests may
    /// call it directly.
    pub fn cleanup_now(&self) -> Result<usize, TxError> {
        self.inner.drain_pending()
    }

    pub fn pending_removals(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl LobInner {
    fn drain_pending(&self) -> Result<usize, TxError> {
        let oldest = self.store.oldest_version_in_use();
        let ready: Vec<PendingRemoval> = {
            let mut pending = self.pending.lock();
            let (ready, keep): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.version < oldest);
            *pending = keep;
            ready
        };
        let mut freed = 0;
        for removal in ready {
            for block_id in removal.blocks {
                self.data.remove(&block_id)?;
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(blocks = freed, "lob blocks freed");
        }
        Ok(freed)
    }
}

impl Drop for LobStorage {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
    }
}

fn encode_stream_id(blocks: &[i64], total_len: u64) -> Vec<u8> {
    let mut buf = WriteBuffer::with_capacity(blocks.len() * 4 + 16);
    buf.put_var_u64(blocks.len() as u64);
    for block in blocks {
        buf.put_var_long(*block);
    }
    buf.put_var_u64(total_len);
    buf.as_slice().to_vec()
}

fn decode_stream_id(stream_id: &[u8]) -> Result<(Vec<i64>, u64), StoreError> {
    let mut buf = ReadBuffer::new(stream_id);
    let count = buf.read_var_u64()? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(buf.read_var_long()?);
    }
    let total = buf.read_var_u64()?;
    Ok((blocks, total))
}

/// Reference-map key: length-prefixed stream id, then the lob id. The
/// length prefix keeps distinct streams from prefix-colliding.
fn ref_key(stream_id: &[u8], lob_id: i64) -> Vec<u8> {
    let mut key = stream_prefix(stream_id);
    key.extend_from_slice(&(lob_id as u64).to_be_bytes());
    key
}

fn stream_prefix(stream_id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(stream_id.len() + 4);
    key.extend_from_slice(&(stream_id.len() as u32).to_be_bytes());
    key.extend_from_slice(stream_id);
    key
}

/// FNV-1a, good enough to detect accidental content divergence.
fn content_hash(content: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &byte in content {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
