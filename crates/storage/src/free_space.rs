use bitvec::prelude::{BitVec, Lsb0};

use crate::data_util::STORE_HEADER_BLOCKS;

/// Free-space accounting over the file's 4 KiB blocks. Bit set = in use.
/// The first two blocks stay permanently reserved for the duplicated store
/// header. Mutated only under the save-chunk lock.
pub struct FreeSpaceMap {
    used: BitVec<u8, Lsb0>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        let mut used = BitVec::repeat(false, STORE_HEADER_BLOCKS as usize);
        used.fill(true);
        FreeSpaceMap { used }
    }

    fn grow_to(&mut self, blocks: usize) {
        if self.used.len() < blocks {
            self.used.resize(blocks, false);
        }
    }

    pub fn mark_used(&mut self, block: u64, len: u32) {
        let end = block as usize + len as usize;
        self.grow_to(end);
        self.used[block as usize..end].fill(true);
    }

    pub fn free(&mut self, block: u64, len: u32) {
        let end = (block as usize + len as usize).min(self.used.len());
        if (block as usize) < end {
            self.used[block as usize..end].fill(false);
        }
    }

    pub fn is_free(&self, block: u64, len: u32) -> bool {
        let start = block as usize;
        let end = start + len as usize;
        if end > self.used.len() {
            // Beyond the tracked range everything is free.
            return start >= self.used.len()
                || self.used[start..].not_any();
        }
        self.used[start..end].not_any()
    }

    /// Find and reserve the lowest free run of `len` blocks. With reuse
    /// disabled the run is always placed at the end of the tracked range.
    pub fn allocate(&mut self, len: u32, reuse: bool) -> u64 {
        let block = if reuse {
            self.find_lowest_run(len)
        } else {
            self.end_of_used()
        };
        self.mark_used(block, len);
        block
    }

    /// Reserve a specific run if it is still free; used when the previous
    /// commit predicted the next chunk's placement.
    pub fn allocate_at(&mut self, block: u64, len: u32) -> bool {
        if block < STORE_HEADER_BLOCKS || !self.is_free(block, len) {
            return false;
        }
        self.mark_used(block, len);
        true
    }

    fn find_lowest_run(&self, len: u32) -> u64 {
        let len = len as usize;
        let mut run_start = None;
        let mut run_len = 0usize;
        for block in STORE_HEADER_BLOCKS as usize..self.used.len() {
            if self.used[block] {
                run_start = None;
                run_len = 0;
            } else {
                if run_start.is_none() {
                    run_start = Some(block);
                }
                run_len += 1;
                if run_len >= len {
                    return run_start.unwrap() as u64;
                }
            }
        }
        // No interior run fits; append, continuing a trailing free run if
        // one exists.
        match run_start {
            Some(start) => start as u64,
            None => self.used.len() as u64,
        }
    }

    /// First block after the last used one.
    pub fn end_of_used(&self) -> u64 {
        match self.used.last_one() {
            Some(last) => last as u64 + 1,
            None => STORE_HEADER_BLOCKS,
        }
    }

    /// Fraction of the tracked range in use, in percent.
    pub fn occupancy_rate(&self) -> u8 {
        if self.used.is_empty() {
            return 0;
        }
        (100 * self.used.count_ones() / self.used.len()) as u8
    }

    pub fn clear(&mut self) {
        self.used.clear();
        self.used.resize(STORE_HEADER_BLOCKS as usize, true);
    }
}

impl Default for FreeSpaceMap {
    fn default() -> Self {
        FreeSpaceMap::new()
    }
}
