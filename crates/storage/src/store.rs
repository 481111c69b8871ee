use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{PageCache, TocCache};
use crate::chunk::Chunk;
use crate::data_type::{DataType, StringType};
use crate::data_util::{
    self, BLOCK_SIZE, CHUNK_FOOTER_LEN, STORE_HEADER_BLOCKS,
};
use crate::error::StoreError;
use crate::file_store::FileStore;
use crate::free_space::FreeSpaceMap;
use crate::mvmap::{MapFlush, MvMap};
use crate::page::{self, Page};
use crate::write_buffer::WriteBuffer;

/// Map id of the layout map (chunk records and map root positions).
pub const LAYOUT_MAP_ID: u32 = 0;
/// Map id of the meta map (map names and settings).
pub const META_MAP_ID: u32 = 1;

/// On-disk format written by this version, and the range it can read.
pub const FORMAT_WRITE: u64 = 2;
pub const FORMAT_READ_MIN: u64 = 2;
pub const FORMAT_READ_MAX: u64 = 2;

/// Bound on in-flight commits between the serialization step and the
/// buffer-save step.
pub const PIPE_LENGTH: usize = 3;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;
const STATE_PANICKED: u8 = 3;

/// Configuration for [`Store::open`]; see the builder methods for the
/// recognized options and their defaults.
#[derive(Clone)]
pub struct StoreBuilder {
    pub(crate) path: PathBuf,
    pub(crate) cache_size_mb: u64,
    pub(crate) cache_concurrency: usize,
    pub(crate) auto_commit_delay_ms: u64,
    pub(crate) auto_compact_fill_rate: u8,
    pub(crate) page_split_size: u32,
    pub(crate) compress: bool,
    pub(crate) encryption_key: Option<Vec<u8>>,
    pub(crate) read_only: bool,
    pub(crate) recovery_mode: bool,
    pub(crate) retention_time_ms: u64,
    pub(crate) reuse_space: bool,
}

impl StoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreBuilder {
            path: path.into(),
            cache_size_mb: 16,
            cache_concurrency: 16,
            auto_commit_delay_ms: 1000,
            auto_compact_fill_rate: 90,
            page_split_size: 16 * 1024,
            compress: false,
            encryption_key: None,
            read_only: false,
            recovery_mode: false,
            retention_time_ms: 45_000,
            reuse_space: true,
        }
    }

    /// Page cache size in MiB (default 16).
    pub fn cache_size(mut self, mib: u64) -> Self {
        self.cache_size_mb = mib;
        self
    }

    /// Cache lock sharding factor (default 16 segments).
    pub fn cache_concurrency(mut self, segments: usize) -> Self {
        self.cache_concurrency = segments;
        self
    }

    /// Background commit interval in milliseconds; 0 disables the
    /// background writer (default 1000).
    pub fn auto_commit_delay(mut self, millis: u64) -> Self {
        self.auto_commit_delay_ms = millis;
        self
    }

    /// Fill-rate threshold (percent) below which the background writer
    /// compacts idle chunks (default 90).
    pub fn auto_compact_fill_rate(mut self, rate: u8) -> Self {
        self.auto_compact_fill_rate = rate.min(100);
        self
    }

    /// Page split threshold in bytes (default 16 KiB; compression forces
    /// 64 KiB).
    pub fn page_split_size(mut self, bytes: u32) -> Self {
        self.page_split_size = bytes;
        self
    }

    /// Compress page bodies with lz4.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        if compress {
            self.page_split_size = 64 * 1024;
        }
        self
    }

    /// Encrypt the file with an AES transform keyed by `key`.
    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Tolerate and skip unreadable chunks while opening.
    pub fn recovery_mode(mut self, recovery: bool) -> Self {
        self.recovery_mode = recovery;
        self
    }

    /// Minimum age in milliseconds before a dead chunk's space may be
    /// overwritten (default 45000).
    pub fn retention_time(mut self, millis: u64) -> Self {
        self.retention_time_ms = millis;
        self
    }

    /// Reuse freed space inside the file (default true); disabling makes
    /// every chunk append at the end.
    pub fn reuse_space(mut self, reuse: bool) -> Self {
        self.reuse_space = reuse;
        self
    }

    pub fn open(self) -> Result<Store, StoreError> {
        Store::open_with(self)
    }
}

/// The parsed store header kept in blocks 0 and 1 of the file.
#[derive(Debug, Clone)]
pub(crate) struct StoreHeader {
    pub format: u64,
    pub created: u64,
    pub chunk_id: u32,
    pub block: u64,
    pub version: u64,
    pub clean: bool,
}

impl StoreHeader {
    fn new(created: u64) -> Self {
        StoreHeader {
            format: FORMAT_WRITE,
            created,
            chunk_id: 0,
            block: 0,
            version: 0,
            clean: true,
        }
    }

    pub(crate) fn render(&self) -> Vec<u8> {
        let mut text = String::new();
        data_util::append_map_hex(&mut text, "H", 2);
        data_util::append_map_hex(&mut text, "block", self.block);
        data_util::append_map_hex(&mut text, "blockSize", BLOCK_SIZE as u64);
        data_util::append_map_hex(&mut text, "chunk", self.chunk_id as u64);
        if self.clean {
            data_util::append_map_hex(&mut text, "clean", 1);
        }
        data_util::append_map_hex(&mut text, "created", self.created);
        data_util::append_map_hex(&mut text, "format", self.format);
        data_util::append_map_hex(&mut text, "formatRead", self.format);
        data_util::append_map_hex(&mut text, "version", self.version);
        data_util::seal_map(&mut text);
        let mut bytes = text.into_bytes();
        bytes.resize(BLOCK_SIZE, 0);
        bytes
    }

    pub(crate) fn parse(bytes: &[u8]) -> Option<StoreHeader> {
        let map = data_util::parse_checked_map(bytes)?;
        Some(StoreHeader {
            format: data_util::map_hex_or(&map, "format", 0),
            created: data_util::map_hex_or(&map, "created", 0),
            chunk_id: data_util::map_hex_or(&map, "chunk", 0) as u32,
            block: data_util::map_hex_or(&map, "block", 0),
            version: data_util::map_hex_or(&map, "version", 0),
            clean: map.contains_key("clean"),
        })
    }
}

/// A saved page superseded by a newer version, queued until the oldest
/// in-use version has moved past it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemovedPage {
    pub pos: u64,
    /// Version of the commit that superseded the page.
    pub version: u64,
}

pub(crate) struct SaveJob {
    pub chunk: Chunk,
    pub buffer: WriteBuffer,
    pub ack: std::sync::mpsc::SyncSender<Result<u64, StoreError>>,
}

/// Context handed to each map while its dirty root is serialized into the
/// chunk under construction.
pub(crate) struct FlushContext<'a> {
    pub chunk: &'a mut Chunk,
    pub buf: &'a mut WriteBuffer,
    pub toc: &'a mut Vec<u64>,
    pub version: u64,
    pub compress: bool,
}

impl FlushContext<'_> {
    pub fn write_page<K, V>(
        &mut self,
        page: &Arc<Page<K, V>>,
        map_id: u32,
        key_type: &dyn DataType<K>,
        value_type: &dyn DataType<V>,
    ) -> u64 {
        let pos = page::write_page(
            page,
            map_id,
            self.chunk.id,
            self.buf,
            key_type,
            value_type,
            self.compress,
        );
        self.toc.push(pos);
        self.chunk.page_count += 1;
        self.chunk.page_count_live += 1;
        let max = data_util::position_max_length(pos) as u64;
        self.chunk.max_len += max;
        self.chunk.max_len_live += max;
        pos
    }
}

/// The store coordinator: owns the file, the chunk table, the layout and
/// meta maps, the caches, and the background machinery. Cloneable handle;
/// the last handle dropping closes the store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub cfg: StoreBuilder,
    pub file: FileStore,
    state: AtomicU8,
    /// Lifecycle lock: open/close/rollback/map add-remove. Never held
    /// during I/O.
    pub store_lock: Mutex<()>,
    /// Guards building a chunk buffer; only the serialization path takes
    /// it.
    pub serialization_lock: Mutex<()>,
    /// Guards chunk-space allocation, the chunk table mutations done at
    /// save time, and the removed-page drain.
    pub save_lock: Mutex<()>,
    pub header: Mutex<StoreHeader>,
    pub chunks: Mutex<HashMap<u32, Chunk>>,
    pub free_space: Mutex<FreeSpaceMap>,
    pub maps: Mutex<HashMap<u32, Arc<dyn MapFlush>>>,
    layout: OnceLock<Arc<MvMap<String, String>>>,
    meta: OnceLock<Arc<MvMap<String, String>>>,
    pub page_cache: PageCache,
    pub toc_cache: TocCache,
    pub removed_pages: Mutex<Vec<RemovedPage>>,
    /// Chunk ids whose layout record must be rewritten at the next commit
    /// (metadata changed, chunk freed, or the chunk is new).
    pub dirty_chunk_records: Mutex<HashSet<u32>>,
    /// Versions held open by readers (transactions, LOB snapshots), with
    /// hold counts.
    version_holds: Mutex<BTreeMap<u64, usize>>,
    pub current_version: AtomicU64,
    pub last_chunk_id: AtomicU32,
    pub last_map_id: AtomicU32,
    pub changed: AtomicBool,
    /// Block the previous save predicted for the next chunk; a miss
    /// forces a store-header rewrite.
    pub predicted_next: AtomicU64,
    started: Instant,
    pub save_tx: Mutex<Option<SyncSender<SaveJob>>>,
    pub save_thread: Mutex<Option<JoinHandle<()>>>,
    pub background: Mutex<Option<JoinHandle<()>>>,
    pub background_alive: Arc<AtomicBool>,
    pub background_signal: Arc<(Mutex<bool>, Condvar)>,
}

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<StoreInner>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<StoreInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn unregister_path(path: &Path) {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    registry().lock().remove(&canonical);
}

impl Store {
    /// Open a store with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        StoreBuilder::new(path.as_ref()).open()
    }

    pub fn builder(path: impl AsRef<Path>) -> StoreBuilder {
        StoreBuilder::new(path.as_ref())
    }

    fn open_with(cfg: StoreBuilder) -> Result<Store, StoreError> {
        let canonical = cfg
            .path
            .canonicalize()
            .unwrap_or_else(|_| cfg.path.clone());
        {
            let mut reg = registry().lock();
            reg.retain(|_, weak| weak.strong_count() > 0);
            if reg.contains_key(&canonical) {
                return Err(StoreError::FileLocked(format!(
                    "{} is already open in this process",
                    canonical.display()
                )));
            }
        }

        let store = Self::open_unregistered(cfg)?;
        registry()
            .lock()
            .insert(canonical, Arc::downgrade(&store.inner));
        Ok(store)
    }

    /// Open without consulting the in-process registry; tests use this to
    /// construct coordinators directly.
    pub(crate) fn open_unregistered(cfg: StoreBuilder) -> Result<Store, StoreError> {
        let file = FileStore::open(&cfg.path, cfg.read_only, cfg.encryption_key.as_deref())?;
        let cache_bytes = cfg.cache_size_mb.max(1) * 1024 * 1024;

        let inner = Arc::new(StoreInner {
            file,
            state: AtomicU8::new(STATE_OPEN),
            store_lock: Mutex::new(()),
            serialization_lock: Mutex::new(()),
            save_lock: Mutex::new(()),
            header: Mutex::new(StoreHeader::new(now_millis())),
            chunks: Mutex::new(HashMap::new()),
            free_space: Mutex::new(FreeSpaceMap::new()),
            maps: Mutex::new(HashMap::new()),
            layout: OnceLock::new(),
            meta: OnceLock::new(),
            page_cache: PageCache::new(cache_bytes - cache_bytes / 16, cfg.cache_concurrency),
            toc_cache: TocCache::new(cache_bytes / 16),
            removed_pages: Mutex::new(Vec::new()),
            dirty_chunk_records: Mutex::new(HashSet::new()),
            version_holds: Mutex::new(BTreeMap::new()),
            current_version: AtomicU64::new(0),
            last_chunk_id: AtomicU32::new(0),
            last_map_id: AtomicU32::new(META_MAP_ID),
            changed: AtomicBool::new(false),
            predicted_next: AtomicU64::new(0),
            started: Instant::now(),
            save_tx: Mutex::new(None),
            save_thread: Mutex::new(None),
            background: Mutex::new(None),
            background_alive: Arc::new(AtomicBool::new(false)),
            background_signal: Arc::new((Mutex::new(false), Condvar::new())),
            cfg,
        });

        // The system maps hold a parent handle; construct them once the
        // inner is behind its Arc.
        let layout = Arc::new(MvMap::new(
            LAYOUT_MAP_ID,
            "layout".to_string(),
            Arc::new(StringType),
            Arc::new(StringType),
            Arc::downgrade(&inner),
            false,
        ));
        let meta = Arc::new(MvMap::new(
            META_MAP_ID,
            "meta".to_string(),
            Arc::new(StringType),
            Arc::new(StringType),
            Arc::downgrade(&inner),
            false,
        ));
        let _ = inner.layout.set(layout);
        let _ = inner.meta.set(meta);

        inner.load_from_file()?;
        StoreInner::start_save_executor(&inner);
        if !inner.cfg.read_only && inner.cfg.auto_commit_delay_ms > 0 {
            StoreInner::start_background_writer(&inner);
        }

        info!(
            path = %inner.cfg.path.display(),
            version = inner.current_version.load(Ordering::Acquire),
            "store opened"
        );
        Ok(Store { inner })
    }

    /// Open a map with the given name and key/value encodings, creating
    /// it when absent.
    pub fn open_map<K, V>(
        &self,
        name: &str,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
    ) -> Result<Arc<MvMap<K, V>>, StoreError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.open_map_with(name, key_type, value_type, false)
    }

    /// Open a map flagged single-writer, enabling the append fast path.
    pub fn open_map_single_writer<K, V>(
        &self,
        name: &str,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
    ) -> Result<Arc<MvMap<K, V>>, StoreError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.open_map_with(name, key_type, value_type, true)
    }

    fn open_map_with<K, V>(
        &self,
        name: &str,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
        single_writer: bool,
    ) -> Result<Arc<MvMap<K, V>>, StoreError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.check_open()?;
        let _guard = inner.store_lock.lock();
        let meta = inner.meta();

        let (id, existing) = match meta.get(&format!("name.{name}"))? {
            Some(hex) => {
                let id = u64::from_str_radix(&hex, 16)
                    .map_err(|_| StoreError::file_corrupt("invalid map id in meta map"))?
                    as u32;
                (id, true)
            }
            None => {
                let id = inner.last_map_id.fetch_add(1, Ordering::AcqRel) + 1;
                meta.put(format!("name.{name}"), format!("{id:x}"))?;
                meta.put(format!("map.{id:x}"), name.to_string())?;
                (id, false)
            }
        };

        if let Some(open) = inner.maps.lock().get(&id) {
            return open
                .clone()
                .as_any_arc()
                .downcast::<MvMap<K, V>>()
                .map_err(|_| {
                    StoreError::internal(format!(
                        "map {name} already open with different key/value types"
                    ))
                });
        }

        let map = Arc::new(MvMap::new(
            id,
            name.to_string(),
            key_type,
            value_type,
            Arc::downgrade(inner),
            single_writer,
        ));
        if existing {
            let root_pos = inner.map_root_pos(id)?;
            let version = inner.current_version.load(Ordering::Acquire);
            map.reset_to(root_pos, version)?;
        }
        inner.maps.lock().insert(id, map.clone());
        Ok(map)
    }

    /// Remove a map and queue all of its pages for reclamation.
    pub fn remove_map(&self, name: &str) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.check_open()?;
        let _guard = inner.store_lock.lock();
        let meta = inner.meta();
        let Some(hex) = meta.get(&format!("name.{name}"))? else {
            return Ok(());
        };
        let id = u64::from_str_radix(&hex, 16)
            .map_err(|_| StoreError::file_corrupt("invalid map id in meta map"))?
            as u32;

        let map = inner.maps.lock().remove(&id);
        if let Some(map) = map {
            let positions = map.all_page_positions()?;
            let version = inner.current_version.load(Ordering::Acquire) + 1;
            inner.enqueue_removed_pages(&positions, version);
        }
        meta.remove(&format!("name.{name}"))?;
        meta.remove(&format!("map.{id:x}"))?;
        inner.layout().remove(&format!("root.{id:x}"))?;
        Ok(())
    }

    pub fn has_map(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.meta().get(&format!("name.{name}"))?.is_some())
    }

    pub fn map_names(&self) -> Result<Vec<String>, StoreError> {
        let meta = self.inner.meta();
        let mut names = Vec::new();
        let mut cursor = meta.cursor(Some(&"name.".to_string()))?;
        while let Some((key, _)) = cursor.next_entry()? {
            match key.strip_prefix("name.") {
                Some(name) => names.push(name.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    pub fn map_name(&self, id: u32) -> Result<Option<String>, StoreError> {
        self.inner.meta().get(&format!("map.{id:x}"))
    }

    /// The store header as key/value text pairs.
    pub fn store_header(&self) -> BTreeMap<String, String> {
        let header = self.inner.header.lock().render();
        let end = header.iter().position(|&b| b == b'\n').unwrap_or(header.len());
        let text = String::from_utf8_lossy(&header[..end]);
        data_util::parse_map(&text).unwrap_or_default()
    }

    pub fn current_version(&self) -> u64 {
        self.inner.current_version.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != STATE_OPEN
    }

    pub fn file_size(&self) -> u64 {
        self.inner.file.size()
    }

    /// The file backend, for telemetry (read/write counters, size).
    pub fn file_store(&self) -> &FileStore {
        &self.inner.file
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.check_open()?;
        self.inner.file.sync()
    }

    /// Register a reader of `version`; the returned guard keeps chunks and
    /// map roots of that version alive until dropped.
    pub fn acquire_version(&self, version: u64) -> VersionHold {
        StoreInner::acquire_version(&self.inner, version)
    }

    pub fn oldest_version_in_use(&self) -> u64 {
        self.inner.oldest_version_in_use()
    }
}

/// Guard for a version held open by a reader.
pub struct VersionHold {
    store: Weak<StoreInner>,
    version: u64,
}

impl Drop for VersionHold {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release_version(self.version);
        }
    }
}

impl StoreInner {
    pub(crate) fn check_open(&self) -> Result<(), StoreError> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    pub(crate) fn set_closing(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn set_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// First I/O failure marks the store panicked: every later operation
    /// fails fast with `Closed`, and background threads exit on their next
    /// iteration.
    pub(crate) fn panic_store(&self, error: &StoreError) {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            warn!(%error, "store panicked, failing fast from now on");
            self.state.store(STATE_PANICKED, Ordering::Release);
        }
    }

    pub(crate) fn layout(&self) -> &Arc<MvMap<String, String>> {
        self.layout.get().expect("layout map initialized at open")
    }

    pub(crate) fn meta(&self) -> &Arc<MvMap<String, String>> {
        self.meta.get().expect("meta map initialized at open")
    }

    pub(crate) fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::Acquire)
    }

    pub(crate) fn elapsed_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub(crate) fn page_split_size(&self) -> u32 {
        self.cfg.page_split_size
    }

    pub(crate) fn register_map_change(&self, _map_id: u32) {
        self.changed.store(true, Ordering::Release);
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub(crate) fn cache_page(&self, pos: u64, page: Arc<dyn std::any::Any + Send + Sync>, weight: u32) {
        self.page_cache.put(pos, page, weight);
    }

    pub(crate) fn enqueue_removed_pages(&self, positions: &[u64], version: u64) {
        if positions.is_empty() {
            return;
        }
        let mut queue = self.removed_pages.lock();
        queue.extend(
            positions
                .iter()
                .map(|&pos| RemovedPage { pos, version }),
        );
    }

    pub(crate) fn acquire_version(this: &Arc<StoreInner>, version: u64) -> VersionHold {
        *this.version_holds.lock().entry(version).or_insert(0) += 1;
        VersionHold {
            store: Arc::downgrade(this),
            version,
        }
    }

    pub(crate) fn release_version(&self, version: u64) {
        let mut holds = self.version_holds.lock();
        if let Some(count) = holds.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                holds.remove(&version);
            }
        }
    }

    /// The oldest version any reader still needs; chunk reclamation and
    /// root-history pruning both gate on this.
    pub(crate) fn oldest_version_in_use(&self) -> u64 {
        let current = self.current_version();
        self.version_holds
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(current)
            .min(current)
    }

    pub(crate) fn map_root_pos(&self, map_id: u32) -> Result<u64, StoreError> {
        match self.layout().get(&format!("root.{map_id:x}"))? {
            Some(hex) => u64::from_str_radix(&hex, 16)
                .map_err(|_| StoreError::file_corrupt("invalid root position in layout map")),
            None => Ok(0),
        }
    }

    // -- page and ToC reads -------------------------------------------------

    pub(crate) fn read_page<K, V>(
        &self,
        map: &MvMap<K, V>,
        pos: u64,
    ) -> Result<Arc<Page<K, V>>, StoreError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        if let Some(cached) = self.page_cache.get(pos) {
            if let Ok(page) = cached.downcast::<Page<K, V>>() {
                return Ok(page);
            }
        }

        let chunk_id = data_util::position_chunk_id(pos);
        let (block, chunk_len) = {
            let chunks = self.chunks.lock();
            let chunk = chunks
                .get(&chunk_id)
                .ok_or(StoreError::ChunkNotFound(chunk_id))?;
            (chunk.block, chunk.len)
        };

        let offset = data_util::position_offset(pos) as u64;
        let chunk_bytes = chunk_len as u64 * BLOCK_SIZE as u64;
        if offset >= chunk_bytes {
            return Err(StoreError::file_corrupt(format!(
                "page offset {offset} beyond chunk {chunk_id}"
            )));
        }
        let max_len = data_util::position_max_length(pos) as u64;
        let read_len = max_len.min(chunk_bytes - CHUNK_FOOTER_LEN as u64 - offset);
        let bytes = self
            .file
            .read_fully(block * BLOCK_SIZE as u64 + offset, read_len as usize)
            .inspect_err(|e| {
                if e.is_fatal() {
                    self.panic_store(e);
                }
            })?;

        let page = Arc::new(page::read_page(
            &bytes,
            pos,
            map.key_type().as_ref(),
            map.value_type().as_ref(),
        )?);
        self.page_cache.put(pos, page.clone(), page.memory);
        Ok(page)
    }

    /// Read a chunk's table of contents, through the ToC cache.
    pub(crate) fn read_toc(&self, chunk: &Chunk) -> Result<Arc<Vec<u64>>, StoreError> {
        if let Some(toc) = self.toc_cache.get(chunk.id) {
            return Ok(toc);
        }
        let len = chunk.page_count as usize * 8;
        let bytes = self
            .file
            .read_fully(chunk.file_offset(chunk.toc_pos), len)
            .inspect_err(|e| {
                if e.is_fatal() {
                    self.panic_store(e);
                }
            })?;
        let mut toc = Vec::with_capacity(chunk.page_count as usize);
        for i in 0..chunk.page_count as usize {
            toc.push(u64::from_be_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap()));
        }
        let toc = Arc::new(toc);
        self.toc_cache.put(chunk.id, toc.clone());
        Ok(toc)
    }

    // -- open & recovery ----------------------------------------------------

    fn load_from_file(&self) -> Result<(), StoreError> {
        if self.file.size() < STORE_HEADER_BLOCKS * BLOCK_SIZE as u64 {
            if self.cfg.read_only {
                return Err(StoreError::file_corrupt("empty file opened read-only"));
            }
            // Brand-new store: write the initial header pair.
            debug!("initializing new store file");
            self.write_store_header()?;
            return Ok(());
        }

        let block0 = self.file.read_fully(0, BLOCK_SIZE)?;
        let block1 = self.file.read_fully(BLOCK_SIZE as u64, BLOCK_SIZE)?;
        let header = match (StoreHeader::parse(&block0), StoreHeader::parse(&block1)) {
            (Some(a), Some(b)) => {
                if a.version >= b.version {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(StoreError::file_corrupt("both store header copies invalid"));
            }
        };
        if header.format < FORMAT_READ_MIN || header.format > FORMAT_READ_MAX {
            return Err(StoreError::UnsupportedFormat {
                format: header.format,
                min: FORMAT_READ_MIN,
                max: FORMAT_READ_MAX,
            });
        }

        let last_chunk = self.locate_newest_chunk(&header)?;
        *self.header.lock() = StoreHeader {
            created: header.created,
            ..header.clone()
        };

        if let Some(chunk) = last_chunk {
            self.load_chunk_table(chunk)?;
        }

        if !self.cfg.read_only {
            // Mark the file in use; the clean flag comes back at close.
            let mut h = self.header.lock();
            h.clean = false;
            let rendered0 = h.render();
            drop(h);
            self.file.write_fully(0, &rendered0)?;
        }
        Ok(())
    }

    /// Locate the newest complete chunk: trust the header pointer when the
    /// file was closed cleanly, otherwise scan backward from the end of
    /// the file for valid header/footer pairs.
    fn locate_newest_chunk(&self, header: &StoreHeader) -> Result<Option<Chunk>, StoreError> {
        if header.version == 0 && header.block == 0 {
            return Ok(None);
        }
        if header.clean {
            if let Some(chunk) = self.read_chunk_at(header.block)? {
                if chunk.id == header.chunk_id {
                    return Ok(Some(chunk));
                }
            }
            if !self.cfg.recovery_mode {
                return Err(StoreError::file_corrupt(
                    "clean store header points at an invalid chunk",
                ));
            }
        }

        info!("store was not closed cleanly, scanning for the newest chunk");
        let blocks = self.file.size() / BLOCK_SIZE as u64;
        let mut newest: Option<Chunk> = None;
        let mut block = blocks;
        while block > STORE_HEADER_BLOCKS {
            block -= 1;
            let footer_pos = (block + 1) * BLOCK_SIZE as u64 - CHUNK_FOOTER_LEN as u64;
            let Ok(bytes) = self.file.read_fully(footer_pos, CHUNK_FOOTER_LEN) else {
                continue;
            };
            let Some(footer) = Chunk::parse_footer(&bytes) else {
                continue;
            };
            if footer.block + footer.len as u64 != block + 1 {
                continue;
            }
            let Some(chunk) = self.read_chunk_at(footer.block)? else {
                continue;
            };
            if chunk.id != footer.id || chunk.version != footer.version {
                continue;
            }
            if newest.as_ref().is_none_or(|n| chunk.version > n.version) {
                newest = Some(chunk);
            }
        }
        Ok(newest)
    }

    /// Read and validate the chunk whose header starts at `block`; footer
    /// must agree with the header.
    pub(crate) fn read_chunk_at(&self, block: u64) -> Result<Option<Chunk>, StoreError> {
        let header_pos = block * BLOCK_SIZE as u64;
        if header_pos + BLOCK_SIZE as u64 > self.file.size() {
            return Ok(None);
        }
        let Ok(bytes) = self
            .file
            .read_fully(header_pos, data_util::CHUNK_HEADER_LEN)
        else {
            return Ok(None);
        };
        let Some(mut chunk) = Chunk::parse_header(&bytes) else {
            return Ok(None);
        };
        chunk.block = block;
        let footer_pos =
            (block + chunk.len as u64) * BLOCK_SIZE as u64 - CHUNK_FOOTER_LEN as u64;
        if footer_pos + CHUNK_FOOTER_LEN as u64 > self.file.size() {
            return Ok(None);
        }
        let Ok(footer_bytes) = self.file.read_fully(footer_pos, CHUNK_FOOTER_LEN) else {
            return Ok(None);
        };
        let Some(footer) = Chunk::parse_footer(&footer_bytes) else {
            return Ok(None);
        };
        if footer.id != chunk.id || footer.version != chunk.version {
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    /// Populate the chunk table and system maps from the newest chunk's
    /// layout root, verifying every referenced chunk.
    fn load_chunk_table(&self, last: Chunk) -> Result<(), StoreError> {
        let version = last.version;
        let layout_root = last.layout_root_pos;
        self.last_chunk_id.store(last.id, Ordering::Release);
        self.last_map_id.store(last.map_id.max(META_MAP_ID), Ordering::Release);
        self.current_version.store(version, Ordering::Release);
        self.chunks.lock().insert(last.id, last.clone());
        self.free_space.lock().mark_used(last.block, last.len);

        self.layout().reset_to(layout_root, version)?;

        // Collect chunk records referenced by the winning layout root.
        let mut records = Vec::new();
        {
            let mut cursor = self.layout().cursor(Some(&"chunk.".to_string()))?;
            while let Some((key, value)) = cursor.next_entry()? {
                if !key.starts_with("chunk.") {
                    break;
                }
                records.push(value);
            }
        }
        for record in records {
            let chunk = Chunk::from_record(&record)?;
            if chunk.id == last.id {
                continue;
            }
            match self.read_chunk_at(chunk.block)? {
                Some(on_disk) if on_disk.id == chunk.id => {}
                _ if self.cfg.recovery_mode => {
                    warn!(chunk = chunk.id, "skipping unreadable chunk in recovery mode");
                    continue;
                }
                _ => {
                    return Err(StoreError::file_corrupt(format!(
                        "chunk {} referenced by the layout map is invalid",
                        chunk.id
                    )));
                }
            }
            self.free_space.lock().mark_used(chunk.block, chunk.len);
            self.chunks.lock().insert(chunk.id, chunk);
        }

        let meta_root = self.map_root_pos(META_MAP_ID)?;
        self.meta().reset_to(meta_root, version)?;
        debug!(version, chunks = self.chunks.lock().len(), "store state loaded");
        Ok(())
    }

    /// Write both store header copies.
    pub(crate) fn write_store_header(&self) -> Result<(), StoreError> {
        let rendered = self.header.lock().render();
        self.file
            .write_fully(0, &rendered)
            .and_then(|_| self.file.write_fully(BLOCK_SIZE as u64, &rendered))
            .inspect_err(|e| self.panic_store(e))
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
