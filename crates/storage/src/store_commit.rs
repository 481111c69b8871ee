use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, SyncSender};

use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::data_util::{self, BLOCK_SIZE, CHUNK_FOOTER_LEN, CHUNK_HEADER_LEN, STORE_HEADER_BLOCKS};
use crate::error::StoreError;
use crate::mvmap::MapFlush;
use crate::store::{FlushContext, PIPE_LENGTH, SaveJob, Store, StoreInner};
use crate::write_buffer::WriteBuffer;

impl Store {
    /// Persist all unsaved changes as one new chunk. Returns the new
    /// version, or the current one when there was nothing to write.
    pub fn commit(&self) -> Result<u64, StoreError> {
        self.inner.commit()
    }

    /// Discard uncommitted in-memory changes in every map.
    pub fn rollback(&self) -> Result<(), StoreError> {
        self.inner.check_open()?;
        let _guard = self.inner.store_lock.lock();
        for map in self.inner.maps.lock().values() {
            map.rollback_in_memory();
        }
        self.inner.meta().rollback_in_memory();
        self.inner.layout().rollback_in_memory();
        self.inner.changed.store(false, Ordering::Release);
        self.inner.page_cache.clear();
        self.inner.toc_cache.clear();
        Ok(())
    }

    /// Commit pending changes, stop the background machinery, seal the
    /// header with the clean flag, and release the file.
    pub fn close(&self) -> Result<(), StoreError> {
        self.inner.close_store(true)
    }

    /// Close without a final commit; used on the panic path.
    pub fn close_immediately(&self) -> Result<(), StoreError> {
        self.inner.close_store(false)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.close_store(true);
        }
    }
}

impl StoreInner {
    pub(crate) fn start_save_executor(this: &Arc<StoreInner>) {
        let (tx, rx) = mpsc::sync_channel::<SaveJob>(PIPE_LENGTH);
        *this.save_tx.lock() = Some(tx);
        let weak = Arc::downgrade(this);
        let handle = std::thread::Builder::new()
            .name("kurodb-save".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let Some(store) = weak.upgrade() else {
                        break;
                    };
                    let result = store.save_chunk(job.chunk, job.buffer);
                    let _ = job.ack.send(result);
                }
            })
            .expect("spawn save executor");
        *this.save_thread.lock() = Some(handle);
    }

    pub(crate) fn commit(&self) -> Result<u64, StoreError> {
        self.check_open()?;
        if self.cfg.read_only {
            return Err(StoreError::internal("commit on a read-only store"));
        }

        let Some((chunk, buffer)) = self.serialize_commit()? else {
            return Ok(self.current_version());
        };

        let sender: SyncSender<SaveJob> =
            self.save_tx.lock().clone().ok_or(StoreError::Closed)?;
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        sender
            .send(SaveJob {
                chunk,
                buffer,
                ack: ack_tx,
            })
            .map_err(|_| StoreError::Closed)?;
        match ack_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(StoreError::Closed),
        }
    }

    /// Build the chunk buffer for the next version under the serialization
    /// lock: every dirty map root, the rewritten chunk records, the layout
    /// root, and the table of contents, with header space reserved up
    /// front and footer space at the end.
    fn serialize_commit(
        &self,
    ) -> Result<Option<(Chunk, WriteBuffer)>, StoreError> {
        let _serialization = self.serialization_lock.lock();

        let dirty_maps: Vec<Arc<dyn MapFlush>> = {
            let maps = self.maps.lock();
            maps.values()
                .filter(|m| m.is_dirty())
                .cloned()
                .collect()
        };
        let meta_dirty = self.meta().has_unsaved_changes();
        let records_dirty = !self.dirty_chunk_records.lock().is_empty();
        if dirty_maps.is_empty()
            && !meta_dirty
            && !records_dirty
            && !self.layout().has_unsaved_changes()
        {
            self.changed.store(false, Ordering::Release);
            return Ok(None);
        }

        let version = self.current_version() + 1;
        let chunk_id = self.last_chunk_id.load(Ordering::Acquire) + 1;
        if chunk_id > data_util::MAX_CHUNK_ID {
            return Err(StoreError::internal("chunk id space exhausted"));
        }

        let mut chunk = Chunk::new(chunk_id, version, self.elapsed_millis());
        let mut buf = WriteBuffer::new();
        buf.pad_to(CHUNK_HEADER_LEN);
        let mut toc = Vec::new();

        {
            let mut ctx = FlushContext {
                chunk: &mut chunk,
                buf: &mut buf,
                toc: &mut toc,
                version,
                compress: self.cfg.compress,
            };

            for map in &dirty_maps {
                let root_pos = map.flush(&mut ctx)?;
                self.layout()
                    .put(format!("root.{:x}", map.map_id()), format!("{root_pos:x}"))?;
            }
            if meta_dirty {
                let root_pos = MapFlush::flush(self.meta().as_ref(), &mut ctx)?;
                self.layout()
                    .put(format!("root.{:x}", crate::store::META_MAP_ID), format!("{root_pos:x}"))?;
            }

            // Re-record chunks whose metadata moved since the last commit,
            // and drop records of freed chunks.
            let record_ids: Vec<u32> = self.dirty_chunk_records.lock().drain().collect();
            for id in record_ids {
                let record = self.chunks.lock().get(&id).map(|c| c.as_record());
                match record {
                    Some(record) => {
                        self.layout().put(format!("chunk.{id:x}"), record)?;
                    }
                    None => {
                        self.layout().remove(&format!("chunk.{id:x}"))?;
                    }
                }
            }

            let layout_root = MapFlush::flush(self.layout().as_ref(), &mut ctx)?;
            ctx.chunk.layout_root_pos = layout_root;
        }

        chunk.toc_pos = buf.position() as u32;
        for pos in &toc {
            buf.put_u64(*pos);
        }
        chunk.map_id = self.last_map_id.load(Ordering::Acquire);
        chunk.occupancy = bitvec::vec::BitVec::repeat(false, chunk.page_count as usize);

        let total = buf.position() + CHUNK_FOOTER_LEN;
        chunk.len = total.div_ceil(BLOCK_SIZE) as u32;
        buf.pad_to(chunk.len as usize * BLOCK_SIZE);

        self.current_version.store(version, Ordering::Release);
        self.changed.store(false, Ordering::Release);
        trace!(version, chunk = chunk.id, pages = chunk.page_count, "chunk serialized");
        Ok(Some((chunk, buf)))
    }

    /// The buffer-save step, run on the save executor: allocate space,
    /// patch header and footer, write, and publish the chunk.
    fn save_chunk(
        &self,
        mut chunk: Chunk,
        mut buffer: WriteBuffer,
    ) -> Result<u64, StoreError> {
        let _save = self.save_lock.lock();

        self.drain_removed_pages();
        self.reclaim_dead_chunks();

        let predicted = self.predicted_next.load(Ordering::Acquire);
        let block = {
            let mut free = self.free_space.lock();
            if predicted >= STORE_HEADER_BLOCKS && free.allocate_at(predicted, chunk.len) {
                predicted
            } else {
                free.allocate(chunk.len, self.cfg.reuse_space)
            }
        };
        let prediction_missed = block != predicted;
        let next = self.free_space.lock().end_of_used();
        self.predicted_next.store(next, Ordering::Release);

        chunk.block = block;
        chunk.next = next;

        buffer.put_at(0, &chunk.header_bytes());
        let footer_offset = chunk.len as usize * BLOCK_SIZE - CHUNK_FOOTER_LEN;
        buffer.put_at(footer_offset, &chunk.footer_bytes());

        self.file
            .write_fully(block * BLOCK_SIZE as u64, buffer.as_slice())
            .inspect_err(|e| self.panic_store(e))?;

        let version = chunk.version;
        self.last_chunk_id.store(chunk.id, Ordering::Release);
        self.dirty_chunk_records.lock().insert(chunk.id);
        self.chunks.lock().insert(chunk.id, chunk.clone());

        {
            let mut header = self.header.lock();
            header.chunk_id = chunk.id;
            header.block = block;
            header.version = version;
            header.clean = false;
        }
        // Rewrite the header only when the placement prediction missed or
        // periodically, so steady appends stay one write per commit.
        if prediction_missed || version % 20 == 0 {
            self.write_store_header()?;
        }

        let oldest = self.oldest_version_in_use();
        for map in self.maps.lock().values() {
            map.prune_history(oldest);
        }
        self.meta().prune_history(oldest);
        self.layout().prune_history(oldest);

        debug!(version, chunk = chunk.id, block, len = chunk.len, "chunk saved");
        Ok(version)
    }

    pub(crate) fn close_store(&self, commit_pending: bool) -> Result<(), StoreError> {
        if !self.is_open() {
            return Ok(());
        }

        self.stop_background_writer(true);

        if commit_pending && !self.cfg.read_only {
            // Best effort: a panicked store skips straight to teardown.
            let _ = self.commit();
        }

        self.set_closing();
        // Dropping the sender lets the save executor drain and exit.
        *self.save_tx.lock() = None;
        if let Some(handle) = self.save_thread.lock().take() {
            let _ = handle.join();
        }

        if !self.cfg.read_only {
            {
                let mut header = self.header.lock();
                header.version = self.current_version();
                header.clean = true;
            }
            let _ = self.write_store_header();
            let _ = self.file.sync();
        }

        self.set_closed();
        crate::store::unregister_path(&self.cfg.path);
        tracing::info!(path = %self.cfg.path.display(), "store closed");
        Ok(())
    }
}
