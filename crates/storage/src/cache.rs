use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Type-erased cached page; the store downcasts back to the concrete
/// `Page<K, V>` of the owning map.
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Bounded page cache keyed by page position.
///
/// The cache is split into independently locked segments (position hash
/// picks the segment). Each segment runs a LIRS-style policy: entries are
/// either hot (low inter-reference recency), resident cold, or
/// non-resident cold (key retained, value dropped). A cold entry re-hit
/// while still tracked promotes to hot; eviction removes resident cold
/// entries first and only demotes hot entries when the hot set itself
/// outgrows its share of the byte budget.
pub struct PageCache {
    segments: Vec<Mutex<Segment>>,
}

impl PageCache {
    /// `max_bytes` is the total byte budget, `segment_count` the lock
    /// sharding factor (rounded up to a power of two).
    pub fn new(max_bytes: u64, segment_count: usize) -> Self {
        let count = segment_count.max(1).next_power_of_two();
        let per_segment = (max_bytes / count as u64).max(64 * 1024);
        let segments = (0..count)
            .map(|_| Mutex::new(Segment::new(per_segment)))
            .collect();
        PageCache { segments }
    }

    fn segment(&self, pos: u64) -> &Mutex<Segment> {
        // Spread positions across segments; the low bits of a position
        // carry the length code and type, so hash the whole word.
        let mut h = pos;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51afd7ed558ccd);
        h ^= h >> 33;
        &self.segments[(h as usize) & (self.segments.len() - 1)]
    }

    pub fn get(&self, pos: u64) -> Option<CachedObject> {
        self.segment(pos).lock().get(pos)
    }

    pub fn put(&self, pos: u64, value: CachedObject, weight: u32) {
        self.segment(pos).lock().put(pos, value, weight);
    }

    pub fn remove(&self, pos: u64) {
        self.segment(pos).lock().remove(pos);
    }

    pub fn clear(&self) {
        for segment in &self.segments {
            segment.lock().clear();
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.lock().resident_weight).sum()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum EntryState {
    Hot,
    Cold,
    NonResident,
}

struct Entry {
    value: Option<CachedObject>,
    weight: u64,
    state: EntryState,
}

struct Segment {
    max_weight: u64,
    /// Byte budget for the hot set; the rest of the segment budget is the
    /// resident cold queue.
    max_hot_weight: u64,
    resident_weight: u64,
    hot_weight: u64,
    entries: HashMap<u64, Entry>,
    /// Recency stack over hot and recently seen cold/non-resident keys.
    stack: VecDeque<u64>,
    /// FIFO of resident cold keys, the first eviction victims.
    queue: VecDeque<u64>,
}

impl Segment {
    fn new(max_weight: u64) -> Self {
        Segment {
            max_weight,
            max_hot_weight: max_weight - max_weight / 16,
            resident_weight: 0,
            hot_weight: 0,
            entries: HashMap::new(),
            stack: VecDeque::new(),
            queue: VecDeque::new(),
        }
    }

    fn get(&mut self, pos: u64) -> Option<CachedObject> {
        let state = self.entries.get(&pos).map(|e| e.state)?;
        match state {
            EntryState::Hot => {
                self.touch_stack(pos);
                self.entries.get(&pos).and_then(|e| e.value.clone())
            }
            EntryState::Cold => {
                let value = self.entries.get(&pos).and_then(|e| e.value.clone());
                if self.stack.contains(&pos) {
                    // Re-referenced within the tracked window: this is the
                    // LIRS promotion.
                    self.promote(pos);
                } else {
                    self.stack.push_front(pos);
                }
                value
            }
            EntryState::NonResident => None,
        }
    }

    fn put(&mut self, pos: u64, value: CachedObject, weight: u32) {
        let weight = weight.max(16) as u64;
        let was_tracked = match self.entries.get(&pos) {
            Some(entry) => {
                let state = entry.state;
                self.forget(pos);
                state == EntryState::NonResident
            }
            None => false,
        };

        // A key seen again after its value was evicted has a short
        // inter-reference recency, so it comes back hot.
        let state = if was_tracked && self.stack.contains(&pos) {
            EntryState::Hot
        } else {
            EntryState::Cold
        };
        self.entries.insert(
            pos,
            Entry {
                value: Some(value),
                weight,
                state,
            },
        );
        self.resident_weight += weight;
        self.stack.push_front(pos);
        match state {
            EntryState::Hot => self.hot_weight += weight,
            _ => self.queue.push_back(pos),
        }
        self.rebalance();
    }

    fn remove(&mut self, pos: u64) {
        self.forget(pos);
        self.stack.retain(|&p| p != pos);
        self.queue.retain(|&p| p != pos);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.stack.clear();
        self.queue.clear();
        self.resident_weight = 0;
        self.hot_weight = 0;
    }

    /// Drop the entry's resident value and accounting, keeping nothing.
    fn forget(&mut self, pos: u64) {
        if let Some(entry) = self.entries.remove(&pos) {
            if entry.value.is_some() {
                self.resident_weight -= entry.weight;
                if entry.state == EntryState::Hot {
                    self.hot_weight -= entry.weight;
                }
            }
        }
    }

    fn touch_stack(&mut self, pos: u64) {
        if self.stack.front() == Some(&pos) {
            return;
        }
        if let Some(index) = self.stack.iter().position(|&p| p == pos) {
            self.stack.remove(index);
        }
        self.stack.push_front(pos);
        self.prune_stack();
    }

    fn promote(&mut self, pos: u64) {
        if let Some(index) = self.queue.iter().position(|&p| p == pos) {
            self.queue.remove(index);
        }
        if let Some(entry) = self.entries.get_mut(&pos) {
            entry.state = EntryState::Hot;
            self.hot_weight += entry.weight;
        }
        self.touch_stack(pos);
        self.rebalance();
    }

    fn rebalance(&mut self) {
        // Hot set over budget: demote from the stack bottom into the
        // cold queue.
        while self.hot_weight > self.max_hot_weight {
            let Some(pos) = self.stack.pop_back() else {
                break;
            };
            match self.entries.get_mut(&pos) {
                Some(entry) if entry.state == EntryState::Hot => {
                    entry.state = EntryState::Cold;
                    self.hot_weight -= entry.weight;
                    self.queue.push_back(pos);
                }
                _ => {}
            }
        }
        // Resident bytes over budget: evict resident cold entries, keep
        // the key as non-resident while the stack still remembers it.
        while self.resident_weight > self.max_weight {
            let Some(pos) = self.queue.pop_front() else {
                // No cold entries left; shed hot entries outright.
                let Some(pos) = self.stack.pop_back() else {
                    break;
                };
                self.forget(pos);
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&pos) {
                if entry.value.take().is_some() {
                    self.resident_weight -= entry.weight;
                }
                if self.stack.contains(&pos) {
                    entry.state = EntryState::NonResident;
                } else {
                    self.entries.remove(&pos);
                }
            }
        }
        self.prune_stack();
    }

    /// Keep the recency stack bounded and drop untracked tails.
    fn prune_stack(&mut self) {
        let cap = (self.entries.len() * 2).max(32);
        while self.stack.len() > cap {
            if let Some(pos) = self.stack.pop_back() {
                if let Some(entry) = self.entries.get(&pos) {
                    if entry.state == EntryState::NonResident {
                        self.entries.remove(&pos);
                    }
                }
            }
        }
    }
}

/// Small LRU cache over chunk tables-of-content, keyed by chunk id. A ToC
/// is an array mapping page ordinal to the packed position of that page
/// within its chunk.
pub struct TocCache {
    inner: Mutex<LruCache<u32, Arc<Vec<u64>>>>,
}

impl TocCache {
    pub fn new(max_bytes: u64) -> Self {
        // Assume a few KiB per ToC; entry-count bound is close enough for
        // this sub-cache.
        let capacity = NonZeroUsize::new(((max_bytes / 4096) as usize).max(16)).unwrap();
        TocCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, chunk_id: u32) -> Option<Arc<Vec<u64>>> {
        self.inner.lock().get(&chunk_id).cloned()
    }

    pub fn put(&self, chunk_id: u32, toc: Arc<Vec<u64>>) {
        self.inner.lock().put(chunk_id, toc);
    }

    pub fn remove(&self, chunk_id: u32) {
        self.inner.lock().pop(&chunk_id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
