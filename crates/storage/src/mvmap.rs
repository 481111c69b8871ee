use std::any::Any;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::data_type::DataType;
use crate::error::StoreError;
use crate::mvmap_cursor::Cursor;
use crate::page::{ChildRef, Page, PageContent, PAGE_BASE_MEMORY, PAGE_ENTRY_MEMORY};
use crate::store::{FlushContext, StoreInner};

/// A root page together with the version it belongs to.
pub struct RootRef<K, V> {
    pub root: Arc<Page<K, V>>,
    pub version: u64,
}

impl<K, V> Clone for RootRef<K, V> {
    fn clone(&self) -> Self {
        RootRef {
            root: self.root.clone(),
            version: self.version,
        }
    }
}

/// Copy-on-write ordered map.
///
/// Every write clones the pages along the root-to-leaf path into new
/// unsaved pages and swaps the root; concurrent readers keep the previous
/// root and never observe a partial update. Saved pages are immutable and
/// shared; a ring of recent roots keeps older versions readable for
/// snapshot readers until the store's oldest-in-use version passes them.
pub struct MvMap<K, V> {
    id: u32,
    name: String,
    key_type: Arc<dyn DataType<K>>,
    value_type: Arc<dyn DataType<V>>,
    store: Weak<StoreInner>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    root: RwLock<RootRef<K, V>>,
    /// Recent committed roots, newest last.
    history: Mutex<VecDeque<RootRef<K, V>>>,
    /// Positions of saved pages superseded since the last flush.
    removed: Mutex<Vec<u64>>,
    dirty: AtomicBool,
    single_writer: bool,
}

impl<K, V> MvMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: u32,
        name: String,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
        store: Weak<StoreInner>,
        single_writer: bool,
    ) -> Self {
        MvMap {
            id,
            name,
            key_type,
            value_type,
            store,
            write_lock: Mutex::new(()),
            root: RwLock::new(RootRef {
                root: Arc::new(Page::empty_leaf()),
                version: 0,
            }),
            history: Mutex::new(VecDeque::new()),
            removed: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            single_writer,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> &Arc<dyn DataType<K>> {
        &self.key_type
    }

    pub fn value_type(&self) -> &Arc<dyn DataType<V>> {
        &self.value_type
    }

    fn store(&self) -> Result<Arc<StoreInner>, StoreError> {
        self.store.upgrade().ok_or(StoreError::Closed)
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        self.key_type.compare(a, b)
    }

    /// Current root; the snapshot all read operations run against.
    pub fn current_root(&self) -> RootRef<K, V> {
        self.root.read().clone()
    }

    /// Newest root with a version at or below `version`.
    pub fn root_at(&self, version: u64) -> Result<Arc<Page<K, V>>, StoreError> {
        {
            let current = self.root.read();
            if current.version <= version {
                return Ok(current.root.clone());
            }
        }
        let history = self.history.lock();
        for entry in history.iter().rev() {
            if entry.version <= version {
                return Ok(entry.root.clone());
            }
        }
        Err(StoreError::internal(format!(
            "version {version} of map {} is no longer available",
            self.name
        )))
    }

    pub(crate) fn resolve(&self, child: &ChildRef<K, V>) -> Result<Arc<Page<K, V>>, StoreError> {
        if let Some(page) = &child.page {
            return Ok(page.clone());
        }
        let pos = child.pos;
        debug_assert!(pos != 0);
        self.store()?.read_page(self, pos)
    }

    // -- reads --------------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let root = self.current_root().root;
        self.get_from_root(&root, key)
    }

    pub fn get_from_root(
        &self,
        root: &Arc<Page<K, V>>,
        key: &K,
    ) -> Result<Option<V>, StoreError> {
        let mut page = root.clone();
        loop {
            match &page.content {
                PageContent::Leaf(values) => {
                    return Ok(match page.search(key, &|a, b| self.compare(a, b)) {
                        Ok(index) => Some(values[index].clone()),
                        Err(_) => None,
                    });
                }
                PageContent::Node(children) => {
                    let index = page.child_index(key, &|a, b| self.compare(a, b));
                    let child = &children[index];
                    page = self.resolve(child)?;
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn size(&self) -> u64 {
        self.current_root().root.total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn first_key(&self) -> Result<Option<K>, StoreError> {
        self.edge_key(false)
    }

    pub fn last_key(&self) -> Result<Option<K>, StoreError> {
        self.edge_key(true)
    }

    fn edge_key(&self, last: bool) -> Result<Option<K>, StoreError> {
        let mut page = self.current_root().root;
        loop {
            if page.key_count() == 0 && page.is_leaf() {
                return Ok(None);
            }
            match &page.content {
                PageContent::Leaf(_) => {
                    let index = if last { page.key_count() - 1 } else { 0 };
                    return Ok(Some(page.keys[index].clone()));
                }
                PageContent::Node(children) => {
                    let index = if last { children.len() - 1 } else { 0 };
                    page = self.resolve(&children[index])?;
                }
            }
        }
    }

    /// Smallest key `>= key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>, StoreError> {
        self.bound_key(key, true, true)
    }

    /// Smallest key `> key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>, StoreError> {
        self.bound_key(key, true, false)
    }

    /// Largest key `<= key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>, StoreError> {
        self.bound_key(key, false, true)
    }

    /// Largest key `< key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>, StoreError> {
        self.bound_key(key, false, false)
    }

    fn bound_key(
        &self,
        key: &K,
        forward: bool,
        inclusive: bool,
    ) -> Result<Option<K>, StoreError> {
        let mut cursor = if forward {
            Cursor::new(self, self.current_root().root, Some(key), false)?
        } else {
            Cursor::new(self, self.current_root().root, Some(key), true)?
        };
        while let Some(entry) = cursor.next_entry()? {
            let (k, _) = entry;
            match self.compare(&k, key) {
                Ordering::Equal if inclusive => return Ok(Some(k)),
                Ordering::Equal => continue,
                _ => return Ok(Some(k)),
            }
        }
        Ok(None)
    }

    /// Snapshot cursor over `[from, ..]` (or all keys), bound to the root
    /// current at construction time.
    pub fn cursor(&self, from: Option<&K>) -> Result<Cursor<'_, K, V>, StoreError> {
        Cursor::new(self, self.current_root().root, from, false)
    }

    /// Entries in `[from, to]`, both bounds optional and inclusive.
    pub fn range(
        &self,
        from: Option<&K>,
        to: Option<K>,
    ) -> Result<RangeCursor<'_, K, V>, StoreError> {
        Ok(RangeCursor {
            cursor: self.cursor(from)?,
            to,
            key_type: self.key_type.clone(),
            done: false,
        })
    }

    /// Tag the in-memory root with the version its changes will commit
    /// as.
    pub fn set_write_version(&self, version: u64) {
        self.root.write().version = version;
    }

    pub fn cursor_at(
        &self,
        root: Arc<Page<K, V>>,
        from: Option<&K>,
        reverse: bool,
    ) -> Result<Cursor<'_, K, V>, StoreError> {
        Cursor::new(self, root, from, reverse)
    }

    // -- writes -------------------------------------------------------------

    pub fn put(&self, key: K, value: V) -> Result<Option<V>, StoreError> {
        self.write(key, Some(value))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.write(key.clone(), None)
    }

    /// Single-writer append optimization: the key must sort above the
    /// current last key, which lets the write skip the binary searches on
    /// the way down the rightmost path.
    pub fn append(&self, key: K, value: V) -> Result<(), StoreError> {
        debug_assert!(self.single_writer);
        if let Some(last) = self.last_key()? {
            if self.compare(&key, &last) != Ordering::Greater {
                return Err(StoreError::internal(
                    "append requires strictly increasing keys",
                ));
            }
        }
        self.write(key, Some(value))?;
        Ok(())
    }

    /// Atomically replace the entry for `key` when `check` accepts the
    /// current value. Returns false when the check rejected. This is the
    /// primitive the transaction layer builds its compare-and-set on.
    pub fn cas<F>(&self, key: &K, check: F, new: Option<V>) -> Result<bool, StoreError>
    where
        F: FnOnce(Option<&V>) -> bool,
    {
        let store = self.store()?;
        store.check_open()?;
        let guard = self.write_lock.lock();
        let root = self.root.read().root.clone();
        let current = self.get_from_root(&root, key)?;
        if !check(current.as_ref()) {
            return Ok(false);
        }
        self.apply_write(&store, guard, key.clone(), new)?;
        Ok(true)
    }

    fn write(&self, key: K, value: Option<V>) -> Result<Option<V>, StoreError> {
        let store = self.store()?;
        store.check_open()?;
        let guard = self.write_lock.lock();
        let root = self.root.read().root.clone();
        let old = self.get_from_root(&root, &key)?;
        self.apply_write(&store, guard, key, value)?;
        Ok(old)
    }

    fn apply_write(
        &self,
        store: &Arc<StoreInner>,
        _guard: parking_lot::MutexGuard<'_, ()>,
        key: K,
        value: Option<V>,
    ) -> Result<(), StoreError> {
        let write_version = store.current_version() + 1;
        let root = self.root.read().root.clone();

        let new_root = match value {
            Some(value) => {
                let outcome = self.put_rec(&root, key, value)?;
                self.finish_put(outcome)?
            }
            None => match self.remove_rec(&root, &key)? {
                Some(page) => page,
                None => {
                    // Key absent, nothing changed.
                    return Ok(());
                }
            },
        };

        let mut slot = self.root.write();
        *slot = RootRef {
            root: new_root,
            version: write_version,
        };
        drop(slot);

        self.dirty.store(true, AtomicOrdering::Release);
        store.register_map_change(self.id);
        Ok(())
    }

    fn finish_put(&self, outcome: PutOutcome<K, V>) -> Result<Arc<Page<K, V>>, StoreError> {
        match outcome {
            PutOutcome::Replaced(page) => Ok(page),
            PutOutcome::Split {
                left,
                separator,
                right,
            } => {
                // The root itself split: grow the tree by one level.
                let children = vec![
                    ChildRef::unsaved(left),
                    ChildRef::unsaved(right),
                ];
                let memory = self.node_memory(std::slice::from_ref(&separator), &children);
                Ok(Arc::new(Page::new_node(vec![separator], children, memory)))
            }
        }
    }

    fn put_rec(
        &self,
        page: &Arc<Page<K, V>>,
        key: K,
        value: V,
    ) -> Result<PutOutcome<K, V>, StoreError> {
        self.record_superseded(page);
        match &page.content {
            PageContent::Leaf(values) => {
                let mut keys = page.keys.clone();
                let mut new_values = values.clone();
                match page.search(&key, &|a, b| self.compare(a, b)) {
                    Ok(index) => new_values[index] = value,
                    Err(index) => {
                        keys.insert(index, key);
                        new_values.insert(index, value);
                    }
                }
                let memory = self.leaf_memory(&keys, &new_values);
                let leaf = Page::new_leaf(keys, new_values, memory);
                Ok(self.maybe_split_leaf(leaf))
            }
            PageContent::Node(children) => {
                let index = page.child_index(&key, &|a, b| self.compare(a, b));
                let child = self.resolve(&children[index])?;
                let outcome = self.put_rec(&child, key, value)?;

                let mut keys = page.keys.clone();
                let mut new_children = children.clone();
                match outcome {
                    PutOutcome::Replaced(new_child) => {
                        new_children[index] = ChildRef::unsaved(new_child);
                    }
                    PutOutcome::Split {
                        left,
                        separator,
                        right,
                    } => {
                        new_children[index] = ChildRef::unsaved(left);
                        keys.insert(index, separator);
                        new_children.insert(index + 1, ChildRef::unsaved(right));
                    }
                }
                let memory = self.node_memory(&keys, &new_children);
                let node = Page::new_node(keys, new_children, memory);
                Ok(self.maybe_split_node(node))
            }
        }
    }

    fn maybe_split_leaf(&self, leaf: Page<K, V>) -> PutOutcome<K, V> {
        if leaf.memory <= self.split_size() || leaf.key_count() < 2 {
            return PutOutcome::Replaced(Arc::new(leaf));
        }
        let middle = leaf.key_count() / 2;
        let Page { mut keys, content, .. } = leaf;
        let PageContent::Leaf(mut values) = content else {
            unreachable!();
        };
        let right_keys = keys.split_off(middle);
        let right_values = values.split_off(middle);
        let separator = right_keys[0].clone();
        let left_memory = self.leaf_memory(&keys, &values);
        let right_memory = self.leaf_memory(&right_keys, &right_values);
        PutOutcome::Split {
            left: Arc::new(Page::new_leaf(keys, values, left_memory)),
            separator,
            right: Arc::new(Page::new_leaf(right_keys, right_values, right_memory)),
        }
    }

    fn maybe_split_node(&self, node: Page<K, V>) -> PutOutcome<K, V> {
        if node.memory <= self.split_size() || node.key_count() < 2 {
            return PutOutcome::Replaced(Arc::new(node));
        }
        let middle = node.key_count() / 2;
        let Page { mut keys, content, .. } = node;
        let PageContent::Node(mut children) = content else {
            unreachable!();
        };
        // keys[middle] moves up as the separator.
        let mut right_keys = keys.split_off(middle);
        let separator = right_keys.remove(0);
        let right_children = children.split_off(middle + 1);
        let left_memory = self.node_memory(&keys, &children);
        let right_memory = self.node_memory(&right_keys, &right_children);
        PutOutcome::Split {
            left: Arc::new(Page::new_node(keys, children, left_memory)),
            separator,
            right: Arc::new(Page::new_node(right_keys, right_children, right_memory)),
        }
    }

    /// Returns the replacement page, or `None` when the key was absent.
    fn remove_rec(
        &self,
        page: &Arc<Page<K, V>>,
        key: &K,
    ) -> Result<Option<Arc<Page<K, V>>>, StoreError> {
        match &page.content {
            PageContent::Leaf(values) => {
                let Ok(index) = page.search(key, &|a, b| self.compare(a, b)) else {
                    return Ok(None);
                };
                self.record_superseded(page);
                let mut keys = page.keys.clone();
                let mut new_values = values.clone();
                keys.remove(index);
                new_values.remove(index);
                let memory = self.leaf_memory(&keys, &new_values);
                Ok(Some(Arc::new(Page::new_leaf(keys, new_values, memory))))
            }
            PageContent::Node(children) => {
                let index = page.child_index(key, &|a, b| self.compare(a, b));
                let child = self.resolve(&children[index])?;
                let Some(new_child) = self.remove_rec(&child, key)? else {
                    return Ok(None);
                };
                self.record_superseded(page);

                let mut keys = page.keys.clone();
                let mut new_children = children.clone();

                if new_child.total_count() == 0 {
                    // Child emptied out: drop it and its separator.
                    new_children.remove(index);
                    if index > 0 {
                        keys.remove(index - 1);
                    } else if !keys.is_empty() {
                        keys.remove(0);
                    }
                    if new_children.len() == 1 {
                        // Collapse a single-child root path.
                        return Ok(Some(self.resolve(&new_children[0])?));
                    }
                } else {
                    new_children[index] = ChildRef::unsaved(new_child.clone());
                    // Coalesce with a neighbor when the pair has shrunk
                    // below half a split size.
                    if let Some(merged) =
                        self.try_merge(&mut keys, &mut new_children, index, &new_child)?
                    {
                        let _ = merged;
                    }
                    if new_children.len() == 1 {
                        return Ok(Some(self.resolve(&new_children[0])?));
                    }
                }

                let memory = self.node_memory(&keys, &new_children);
                Ok(Some(Arc::new(Page::new_node(keys, new_children, memory))))
            }
        }
    }

    /// Merge `children[index]` with its left neighbor when both are leaves
    /// and the combined estimate stays under half the split threshold.
    fn try_merge(
        &self,
        keys: &mut Vec<K>,
        children: &mut Vec<ChildRef<K, V>>,
        index: usize,
        updated: &Arc<Page<K, V>>,
    ) -> Result<Option<()>, StoreError> {
        if index == 0 || !updated.is_leaf() {
            return Ok(None);
        }
        let neighbor = self.resolve(&children[index - 1])?;
        if !neighbor.is_leaf() {
            return Ok(None);
        }
        let combined = neighbor.memory + updated.memory;
        if combined as u64 >= self.split_size() as u64 / 2 {
            return Ok(None);
        }
        self.record_superseded(&neighbor);

        let mut merged_keys = neighbor.keys.clone();
        merged_keys.extend(updated.keys.iter().cloned());
        let mut merged_values = neighbor.values().to_vec();
        merged_values.extend(updated.values().iter().cloned());
        let memory = self.leaf_memory(&merged_keys, &merged_values);
        let merged = Arc::new(Page::new_leaf(merged_keys, merged_values, memory));

        children[index - 1] = ChildRef::unsaved(merged);
        children.remove(index);
        keys.remove(index - 1);
        Ok(Some(()))
    }

    fn record_superseded(&self, page: &Arc<Page<K, V>>) {
        let pos = page.position();
        if pos != 0 {
            self.removed.lock().push(pos);
        }
    }

    fn split_size(&self) -> u32 {
        self.store
            .upgrade()
            .map(|s| s.page_split_size())
            .unwrap_or(16 * 1024)
    }

    pub(crate) fn leaf_memory(&self, keys: &[K], values: &[V]) -> u32 {
        let mut memory = PAGE_BASE_MEMORY;
        for key in keys {
            memory += self.key_type.memory(key) + PAGE_ENTRY_MEMORY;
        }
        for value in values {
            memory += self.value_type.memory(value);
        }
        memory
    }

    pub(crate) fn node_memory(&self, keys: &[K], children: &[ChildRef<K, V>]) -> u32 {
        let mut memory = PAGE_BASE_MEMORY;
        for key in keys {
            memory += self.key_type.memory(key) + PAGE_ENTRY_MEMORY;
        }
        memory += children.len() as u32 * PAGE_ENTRY_MEMORY;
        memory
    }

    // -- store integration --------------------------------------------------

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.load(AtomicOrdering::Acquire)
    }

    pub fn root_pos(&self) -> u64 {
        self.current_root().root.position()
    }

    /// Serialize the current root (bottom-up) into the chunk being built.
    /// Called from the serialization executor with no other map locks
    /// held. Returns the new root position.
    pub(crate) fn flush(&self, ctx: &mut FlushContext<'_>) -> Result<u64, StoreError> {
        let captured = self.root.read().clone();
        self.dirty.store(false, AtomicOrdering::Release);

        let (pos, cleaned) = self.save_page(&captured.root, ctx)?;

        // Swap in the cleaned tree unless a concurrent writer has already
        // moved the root on; its pages were marked saved either way.
        {
            let mut slot = self.root.write();
            if Arc::ptr_eq(&slot.root, &captured.root) {
                *slot = RootRef {
                    root: cleaned.clone(),
                    version: ctx.version,
                };
            }
        }
        self.history.lock().push_back(RootRef {
            root: cleaned,
            version: ctx.version,
        });

        // Hand superseded positions to the store, tagged with the version
        // that supersedes them.
        let removed: Vec<u64> = std::mem::take(&mut *self.removed.lock());
        if let Ok(store) = self.store() {
            store.enqueue_removed_pages(&removed, ctx.version);
        }
        Ok(pos)
    }

    fn save_page(
        &self,
        page: &Arc<Page<K, V>>,
        ctx: &mut FlushContext<'_>,
    ) -> Result<(u64, Arc<Page<K, V>>), StoreError> {
        if page.is_saved() {
            return Ok((page.position(), page.clone()));
        }
        let result = match &page.content {
            PageContent::Leaf(_) => {
                let pos = ctx.write_page(
                    page,
                    self.id,
                    self.key_type.as_ref(),
                    self.value_type.as_ref(),
                );
                (pos, page.clone())
            }
            PageContent::Node(children) => {
                let mut cleaned_children = Vec::with_capacity(children.len());
                for child in children {
                    let (child_pos, _cleaned) = match &child.page {
                        Some(p) if !p.is_saved() => self.save_page(p, ctx)?,
                        Some(p) => (p.position(), p.clone()),
                        None => {
                            cleaned_children.push(ChildRef::saved(child.pos, child.count));
                            continue;
                        }
                    };
                    cleaned_children.push(ChildRef::saved(child_pos, child.count));
                }
                let cleaned = Arc::new(Page::new_node(
                    page.keys.clone(),
                    cleaned_children,
                    page.memory,
                ));
                let pos = ctx.write_page(
                    &cleaned,
                    self.id,
                    self.key_type.as_ref(),
                    self.value_type.as_ref(),
                );
                page.mark_saved(pos);
                (pos, cleaned)
            }
        };
        // Write-through: later readers resolve the fresh position from
        // the cache instead of the file.
        if let Ok(store) = self.store() {
            store.cache_page(result.0, result.1.clone(), result.1.memory);
        }
        Ok(result)
    }

    /// Replace the in-memory state with the root saved at `pos`; used on
    /// open, rollback to a version, and map reload.
    pub(crate) fn reset_to(&self, pos: u64, version: u64) -> Result<(), StoreError> {
        let root = if pos == 0 {
            Arc::new(Page::empty_leaf())
        } else {
            self.store()?.read_page(self, pos)?
        };
        *self.root.write() = RootRef { root, version };
        self.history.lock().clear();
        self.removed.lock().clear();
        self.dirty.store(false, AtomicOrdering::Release);
        Ok(())
    }

    /// Discard uncommitted in-memory changes, restoring the last flushed
    /// root (or the empty page when nothing was ever flushed).
    pub(crate) fn rollback_in_memory(&self) {
        if !self.has_unsaved_changes() {
            return;
        }
        let last = self.history.lock().back().cloned();
        let restored = last.unwrap_or_else(|| RootRef {
            root: Arc::new(Page::empty_leaf()),
            version: 0,
        });
        *self.root.write() = restored;
        self.removed.lock().clear();
        self.dirty.store(false, AtomicOrdering::Release);
    }

    pub(crate) fn prune_history(&self, oldest_in_use: u64) {
        let mut history = self.history.lock();
        while history.len() > 1 {
            // Keep the newest entry at or below the oldest version still
            // in use; everything older is unreachable.
            if history[1].version <= oldest_in_use {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// All saved page positions reachable from the current root; used when
    /// the map is removed so its pages can be reclaimed.
    pub(crate) fn all_page_positions(&self) -> Result<Vec<u64>, StoreError> {
        let mut positions = Vec::new();
        let root = self.current_root().root;
        self.collect_positions(&root, &mut positions)?;
        Ok(positions)
    }

    fn collect_positions(
        &self,
        page: &Arc<Page<K, V>>,
        positions: &mut Vec<u64>,
    ) -> Result<(), StoreError> {
        if page.is_saved() {
            positions.push(page.position());
        }
        if let PageContent::Node(children) = &page.content {
            for child in children {
                let child_page = self.resolve(child)?;
                self.collect_positions(&child_page, positions)?;
            }
        }
        Ok(())
    }

    /// Compaction support: copy the live content of the page at `pos` so
    /// the next commit writes it into a fresh chunk. A page the current
    /// tree no longer references is left alone; its space comes back
    /// through the removed-page queue.
    pub(crate) fn rewrite_page(&self, pos: u64) -> Result<(), StoreError> {
        let store = self.store()?;
        let page: Arc<Page<K, V>> = store.read_page(self, pos)?;
        let key = {
            let mut page = page;
            loop {
                if page.key_count() == 0 {
                    return Ok(());
                }
                match &page.content {
                    PageContent::Leaf(_) => break page.keys[0].clone(),
                    PageContent::Node(children) => {
                        page = self.resolve(&children[0])?;
                    }
                }
            }
        };
        if !self.path_contains(&key, pos)? {
            return Ok(());
        }
        // Re-put the value so the copy-on-write path supersedes the page.
        if let Some(value) = self.get(&key)? {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Whether the root-to-leaf path for `key` passes through the page
    /// saved at `pos`.
    fn path_contains(&self, key: &K, pos: u64) -> Result<bool, StoreError> {
        let mut page = self.current_root().root;
        loop {
            if page.position() == pos {
                return Ok(true);
            }
            match &page.content {
                PageContent::Leaf(_) => return Ok(false),
                PageContent::Node(children) => {
                    let index = page.child_index(key, &|a, b| self.compare(a, b));
                    let child = &children[index];
                    if child.pos == pos {
                        return Ok(true);
                    }
                    page = self.resolve(child)?;
                }
            }
        }
    }
}

enum PutOutcome<K, V> {
    Replaced(Arc<Page<K, V>>),
    Split {
        left: Arc<Page<K, V>>,
        separator: K,
        right: Arc<Page<K, V>>,
    },
}

/// Cursor bounded by an inclusive upper key.
pub struct RangeCursor<'a, K, V> {
    cursor: crate::mvmap_cursor::Cursor<'a, K, V>,
    to: Option<K>,
    key_type: Arc<dyn DataType<K>>,
    done: bool,
}

impl<K, V> RangeCursor<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>, StoreError> {
        if self.done {
            return Ok(None);
        }
        let Some((key, value)) = self.cursor.next_entry()? else {
            self.done = true;
            return Ok(None);
        };
        if let Some(to) = &self.to {
            if self.key_type.compare(&key, to) == Ordering::Greater {
                self.done = true;
                return Ok(None);
            }
        }
        Ok(Some((key, value)))
    }
}

/// Store-facing, type-erased view of a map, so the coordinator can flush
/// and manage maps of any key/value type.
pub(crate) trait MapFlush: Send + Sync {
    fn map_id(&self) -> u32;
    fn map_name(&self) -> &str;
    fn is_dirty(&self) -> bool;
    fn flush(&self, ctx: &mut FlushContext<'_>) -> Result<u64, StoreError>;
    fn reset_to(&self, pos: u64, version: u64) -> Result<(), StoreError>;
    fn rollback_in_memory(&self);
    fn prune_history(&self, oldest_in_use: u64);
    fn rewrite_page(&self, pos: u64) -> Result<(), StoreError>;
    fn all_page_positions(&self) -> Result<Vec<u64>, StoreError>;
    fn root_pos(&self) -> u64;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K, V> MapFlush for MvMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn map_id(&self) -> u32 {
        self.id
    }

    fn map_name(&self) -> &str {
        &self.name
    }

    fn is_dirty(&self) -> bool {
        self.has_unsaved_changes()
    }

    fn flush(&self, ctx: &mut FlushContext<'_>) -> Result<u64, StoreError> {
        MvMap::flush(self, ctx)
    }

    fn reset_to(&self, pos: u64, version: u64) -> Result<(), StoreError> {
        MvMap::reset_to(self, pos, version)
    }

    fn rollback_in_memory(&self) {
        MvMap::rollback_in_memory(self)
    }

    fn prune_history(&self, oldest_in_use: u64) {
        MvMap::prune_history(self, oldest_in_use)
    }

    fn rewrite_page(&self, pos: u64) -> Result<(), StoreError> {
        MvMap::rewrite_page(self, pos)
    }

    fn all_page_positions(&self) -> Result<Vec<u64>, StoreError> {
        MvMap::all_page_positions(self)
    }

    fn root_pos(&self) -> u64 {
        MvMap::root_pos(self)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
