use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::data_util::{self, BLOCK_SIZE, CHUNK_FOOTER_LEN, STORE_HEADER_BLOCKS};
use crate::error::StoreError;
use crate::page::read_page_map_id;
use crate::store::{Store, StoreInner};

impl Store {
    /// Roll the store back to the newest version at or below `version`.
    /// Newer chunks are freed, every open map is reset to its root at that
    /// version, and the caches are dropped.
    pub fn rollback_to(&self, version: u64) -> Result<(), StoreError> {
        self.inner.rollback_to(version)
    }

    /// Compact the file: rewrite under-filled chunks so their live pages
    /// move into fresh chunks, slide remaining chunks toward the start of
    /// the file, and truncate the tail. Runs until there is nothing left
    /// to do or `max_millis` has elapsed (0 means unlimited).
    pub fn compact_file(&self, max_millis: u64) -> Result<(), StoreError> {
        self.inner.check_open()?;
        let deadline = if max_millis == 0 {
            None
        } else {
            Some(Instant::now() + std::time::Duration::from_millis(max_millis))
        };
        let before = self.inner.file.size();

        // Settle pending removals first so fill rates reflect reality.
        self.inner.reclaim_for_compaction();

        // Pass 1: rewrite until every chunk is either well filled or
        // unreferenced. Each round commits, which drains the removals
        // the rewrites produced.
        loop {
            let worked = self.inner.compact_rewrite(95, u64::MAX)?;
            self.inner.commit()?;
            if !worked {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }

        // Pass 2: drop retention so dead chunks free immediately, then
        // move the survivors down and cut the tail.
        self.inner.reclaim_for_compaction();
        self.inner.compact_move_chunks(deadline)?;
        self.inner.commit()?;
        self.inner.truncate_tail()?;

        info!(
            before,
            after = self.inner.file.size(),
            "file compaction finished"
        );
        Ok(())
    }
}

impl StoreInner {
    /// Apply queued page removals whose superseding version is no longer
    /// visible to any reader: flip occupancy bits, shrink live counters,
    /// and mark chunks dead when their last live page goes. Runs under the
    /// save lock.
    pub(crate) fn drain_removed_pages(&self) {
        let oldest = self.oldest_version_in_use();
        let now = self.elapsed_millis();

        // A page superseded by version v is needed only by readers of
        // versions before v, so it can be accounted dead once the oldest
        // version in use has reached v.
        let drained: Vec<_> = {
            let mut queue = self.removed_pages.lock();
            let (ready, keep): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|e| e.version <= oldest);
            *queue = keep;
            ready
        };

        for entry in drained {
            let chunk_id = data_util::position_chunk_id(entry.pos);
            let snapshot = self.chunks.lock().get(&chunk_id).cloned();
            let Some(snapshot) = snapshot else {
                continue;
            };
            // Recompute the page ordinal from the ToC; removed pages carry
            // no ordinal of their own.
            let Ok(toc) = self.read_toc(&snapshot) else {
                continue;
            };
            let offset = data_util::position_offset(entry.pos);
            let Ok(ordinal) =
                toc.binary_search_by_key(&offset, |p| data_util::position_offset(*p))
            else {
                continue;
            };

            let mut chunks = self.chunks.lock();
            let Some(chunk) = chunks.get_mut(&chunk_id) else {
                continue;
            };
            if chunk.occupancy.len() <= ordinal {
                chunk.occupancy.resize(chunk.page_count as usize, false);
            }
            if chunk.occupancy[ordinal] {
                continue;
            }
            chunk.occupancy.set(ordinal, true);
            let max = data_util::position_max_length(entry.pos) as u64;
            chunk.max_len_live = chunk.max_len_live.saturating_sub(max);
            chunk.page_count_live = chunk.page_count_live.saturating_sub(1);
            if chunk.is_dead() {
                // Clamp away from zero, which means "still live".
                chunk.unused = now.max(1);
                // The last version that could still reference the chunk
                // is the one before the commit that superseded its final
                // live page.
                chunk.unused_at_version = entry.version.saturating_sub(1);
                trace!(chunk = chunk_id, "chunk fully dead");
            }
            drop(chunks);
            self.dirty_chunk_records.lock().insert(chunk_id);
        }
    }

    /// Free dead chunks once both gates pass: the retention deadline (old
    /// readers holding a stale root) and the oldest in-use version (live
    /// snapshot readers). Runs under the save lock.
    pub(crate) fn reclaim_dead_chunks(&self) {
        if !self.cfg.reuse_space {
            return;
        }
        self.reclaim_with_retention(self.cfg.retention_time_ms);
    }

    /// Compaction ignores the retention clock; the version gate still
    /// protects live readers.
    pub(crate) fn reclaim_for_compaction(&self) {
        let _save = self.save_lock.lock();
        self.drain_removed_pages();
        self.reclaim_with_retention(0);
    }

    fn reclaim_with_retention(&self, retention_ms: u64) {
        let now = self.elapsed_millis();
        let oldest = self.oldest_version_in_use();
        let last_chunk = self.last_chunk_id.load(Ordering::Acquire);

        let victims: Vec<u32> = {
            let chunks = self.chunks.lock();
            chunks
                .values()
                .filter(|c| {
                    c.id != last_chunk
                        && c.is_dead()
                        && c.unused > 0
                        && now.saturating_sub(c.unused) >= retention_ms
                        && oldest > c.unused_at_version
                })
                .map(|c| c.id)
                .collect()
        };
        for id in victims {
            let removed = self.chunks.lock().remove(&id);
            if let Some(chunk) = removed {
                self.free_space.lock().free(chunk.block, chunk.len);
                self.toc_cache.remove(id);
                self.dirty_chunk_records.lock().insert(id);
                debug!(chunk = id, "chunk reclaimed");
            }
        }
    }

    /// One compaction slice: pick chunks below the target fill rate and
    /// ask the owning maps to rewrite their live pages (leaves first, then
    /// internal pages). Returns whether any page was rewritten.
    pub(crate) fn compact_rewrite(
        &self,
        target_fill: u8,
        budget_bytes: u64,
    ) -> Result<bool, StoreError> {
        let last_chunk = self.last_chunk_id.load(Ordering::Acquire);
        let mut candidates: Vec<_> = {
            let chunks = self.chunks.lock();
            chunks
                .values()
                .filter(|c| c.id != last_chunk && c.is_rewritable() && c.fill_rate() < target_fill)
                .cloned()
                .collect()
        };
        candidates.sort_by_key(|c| c.fill_rate());
        let mut spent = 0u64;
        candidates.retain(|c| {
            spent += c.size_bytes();
            spent <= budget_bytes
        });
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut rewritten = false;
        for leaves_pass in [true, false] {
            for chunk in &candidates {
                let toc = self.read_toc(chunk)?;
                for (ordinal, &pos) in toc.iter().enumerate() {
                    if chunk
                        .occupancy
                        .get(ordinal)
                        .map(|b| *b)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if data_util::position_is_leaf(pos) != leaves_pass {
                        continue;
                    }
                    if self.rewrite_one_page(chunk.block, pos)? {
                        rewritten = true;
                    }
                }
            }
        }
        Ok(rewritten)
    }

    fn rewrite_one_page(&self, chunk_block: u64, pos: u64) -> Result<bool, StoreError> {
        let offset = data_util::position_offset(pos) as u64;
        let header = self
            .file
            .read_fully(chunk_block * BLOCK_SIZE as u64 + offset, 16)?;
        let map_id = read_page_map_id(&header)?;

        let map = if map_id == crate::store::LAYOUT_MAP_ID {
            // The layout root is rewritten with every commit anyway.
            return Ok(false);
        } else if map_id == crate::store::META_MAP_ID {
            self.meta().clone() as Arc<dyn crate::mvmap::MapFlush>
        } else {
            match self.maps.lock().get(&map_id) {
                Some(map) => map.clone(),
                // A map that is not open cannot rewrite its pages; its
                // chunks compact once it is opened again.
                None => return Ok(false),
            }
        };
        map.rewrite_page(pos)?;
        Ok(true)
    }

    /// Slide chunks into the lowest free runs so the tail can be cut.
    fn compact_move_chunks(
        &self,
        deadline: Option<Instant>,
    ) -> Result<(), StoreError> {
        let _save = self.save_lock.lock();
        let mut by_block: Vec<_> = {
            let chunks = self.chunks.lock();
            chunks.values().map(|c| (c.block, c.id, c.len)).collect()
        };
        by_block.sort_by_key(|&(block, _, _)| std::cmp::Reverse(block));

        for (old_block, id, len) in by_block {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let new_block = {
                let mut free = self.free_space.lock();
                let candidate = free.allocate(len, true);
                if candidate >= old_block {
                    // No lower placement available; undo.
                    free.free(candidate, len);
                    continue;
                }
                candidate
            };

            let mut chunk = match self.chunks.lock().get(&id) {
                Some(c) => c.clone(),
                None => continue,
            };
            let mut bytes = self
                .file
                .read_fully(old_block * BLOCK_SIZE as u64, len as usize * BLOCK_SIZE)
                .inspect_err(|e| self.panic_store(e))?;

            chunk.block = new_block;
            let header = chunk.header_bytes();
            bytes[..header.len()].copy_from_slice(&header);
            let footer = chunk.footer_bytes();
            let footer_offset = bytes.len() - CHUNK_FOOTER_LEN;
            bytes[footer_offset..].copy_from_slice(&footer);

            self.file
                .write_fully(new_block * BLOCK_SIZE as u64, &bytes)
                .inspect_err(|e| self.panic_store(e))?;
            self.chunks.lock().insert(id, chunk);
            self.free_space.lock().free(old_block, len);
            self.dirty_chunk_records.lock().insert(id);

            if self.last_chunk_id.load(Ordering::Acquire) == id {
                let mut header = self.header.lock();
                header.block = new_block;
                drop(header);
                self.write_store_header()?;
            }
            debug!(chunk = id, from = old_block, to = new_block, "chunk moved");
        }
        Ok(())
    }

    fn truncate_tail(&self) -> Result<(), StoreError> {
        let _save = self.save_lock.lock();
        let end = self.free_space.lock().end_of_used().max(STORE_HEADER_BLOCKS);
        let target = end * BLOCK_SIZE as u64;
        if target < self.file.size() {
            self.file.truncate(target)?;
        }
        Ok(())
    }

    pub(crate) fn rollback_to(&self, version: u64) -> Result<(), StoreError> {
        self.check_open()?;
        let _guard = self.store_lock.lock();
        let _serialization = self.serialization_lock.lock();
        let _save = self.save_lock.lock();

        if version >= self.current_version() {
            for map in self.maps.lock().values() {
                map.rollback_in_memory();
            }
            self.meta().rollback_in_memory();
            self.layout().rollback_in_memory();
            self.changed.store(false, Ordering::Release);
            return Ok(());
        }

        self.page_cache.clear();
        self.toc_cache.clear();
        self.removed_pages.lock().clear();
        self.dirty_chunk_records.lock().clear();

        if version == 0 {
            self.chunks.lock().clear();
            self.free_space.lock().clear();
            self.layout().reset_to(0, 0)?;
            self.meta().reset_to(0, 0)?;
            for map in self.maps.lock().values() {
                map.reset_to(0, 0)?;
            }
            self.current_version.store(0, Ordering::Release);
            self.last_chunk_id.store(0, Ordering::Release);
            self.changed.store(false, Ordering::Release);
            self.predicted_next.store(0, Ordering::Release);
            self.file
                .truncate(STORE_HEADER_BLOCKS * BLOCK_SIZE as u64)?;
            {
                let mut header = self.header.lock();
                header.chunk_id = 0;
                header.block = 0;
                header.version = 0;
                header.clean = true;
            }
            self.write_store_header()?;
            info!("store rolled back to version 0");
            return Ok(());
        }

        let target = {
            let chunks = self.chunks.lock();
            chunks
                .values()
                .filter(|c| c.version <= version)
                .max_by_key(|c| c.version)
                .cloned()
        };
        let Some(target) = target else {
            return Err(StoreError::internal(format!(
                "no chunk at or below version {version}"
            )));
        };

        // Drop everything newer than the target.
        let newer: Vec<u32> = {
            let chunks = self.chunks.lock();
            chunks
                .values()
                .filter(|c| c.version > target.version)
                .map(|c| c.id)
                .collect()
        };
        for id in newer {
            if let Some(chunk) = self.chunks.lock().remove(&id) {
                self.free_space.lock().free(chunk.block, chunk.len);
                self.toc_cache.remove(id);
            }
        }

        self.current_version.store(target.version, Ordering::Release);
        self.last_chunk_id.store(target.id, Ordering::Release);
        self.layout().reset_to(target.layout_root_pos, target.version)?;
        let meta_root = self.map_root_pos(crate::store::META_MAP_ID)?;
        self.meta().reset_to(meta_root, target.version)?;
        let maps: Vec<_> = self.maps.lock().values().cloned().collect();
        for map in maps {
            let root = self.map_root_pos(map.map_id())?;
            map.reset_to(root, target.version)?;
        }
        self.changed.store(false, Ordering::Release);
        self.predicted_next.store(0, Ordering::Release);

        {
            let mut header = self.header.lock();
            header.chunk_id = target.id;
            header.block = target.block;
            header.version = target.version;
            header.clean = true;
        }
        self.write_store_header()?;
        let end = self.free_space.lock().end_of_used();
        let _ = self.file.truncate(end * BLOCK_SIZE as u64);
        info!(version = target.version, "store rolled back");
        Ok(())
    }
}
