use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use fs4::fs_std::FileExt;

use crate::data_util::BLOCK_SIZE;
use crate::error::StoreError;

/// Positional file backend. Owns the single store file, holds the advisory
/// lock for the lifetime of the store, and optionally runs every block
/// through an AES transform. Read and write counters are kept for
/// telemetry.
pub struct FileStore {
    file: File,
    file_name: PathBuf,
    read_only: bool,
    cipher: Option<BlockCipher>,
    size: AtomicU64,
    read_count: AtomicU64,
    read_bytes: AtomicU64,
    write_count: AtomicU64,
    write_bytes: AtomicU64,
}

impl FileStore {
    /// Open the backing file and acquire the advisory lock: exclusive for
    /// writers, shared when read-only. An already-held lock refuses the
    /// open instead of blocking.
    pub fn open(
        path: &Path,
        read_only: bool,
        encryption_key: Option<&[u8]>,
    ) -> Result<Self, StoreError> {
        let file = File::options()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(|e| StoreError::reading(0, e))?;

        let locked = if read_only {
            FileExt::try_lock_shared(&file)
        } else {
            FileExt::try_lock_exclusive(&file)
        }
        .map_err(|e| StoreError::FileLocked(format!("{}: {e}", path.display())))?;
        if !locked {
            return Err(StoreError::FileLocked(format!(
                "{} is locked by another process",
                path.display()
            )));
        }

        let size = file
            .metadata()
            .map_err(|e| StoreError::reading(0, e))?
            .len();

        Ok(FileStore {
            file,
            file_name: path.to_path_buf(),
            read_only,
            cipher: encryption_key.map(BlockCipher::new),
            size: AtomicU64::new(size),
            read_count: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        })
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn read_fully(&self, position: u64, length: usize) -> Result<Vec<u8>, StoreError> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(length as u64, Ordering::Relaxed);

        match &self.cipher {
            None => {
                let mut data = vec![0u8; length];
                self.read_at(&mut data, position)?;
                Ok(data)
            }
            Some(cipher) => {
                // Expand the request to block boundaries, decrypt whole
                // blocks, then slice out the requested range.
                let start = position / BLOCK_SIZE as u64 * BLOCK_SIZE as u64;
                let end = (position + length as u64).div_ceil(BLOCK_SIZE as u64)
                    * BLOCK_SIZE as u64;
                let mut data = vec![0u8; (end - start) as usize];
                self.read_at(&mut data, start)?;
                cipher.decrypt(start / BLOCK_SIZE as u64, &mut data);
                let offset = (position - start) as usize;
                Ok(data[offset..offset + length].to_vec())
            }
        }
    }

    /// Write at a position. With encryption enabled the position and length
    /// must be block-aligned; the store only ever writes whole blocks.
    pub fn write_fully(&self, position: u64, data: &[u8]) -> Result<(), StoreError> {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        match &self.cipher {
            None => self.write_at(data, position)?,
            Some(cipher) => {
                debug_assert!(position % BLOCK_SIZE as u64 == 0);
                debug_assert!(data.len() % BLOCK_SIZE == 0);
                let mut encrypted = data.to_vec();
                cipher.encrypt(position / BLOCK_SIZE as u64, &mut encrypted);
                self.write_at(&encrypted, position)?;
            }
        }

        let end = position + data.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    pub fn truncate(&self, length: u64) -> Result<(), StoreError> {
        self.file
            .set_len(length)
            .map_err(|e| StoreError::writing(length, e))?;
        self.size.store(length, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.file
            .sync_all()
            .map_err(|e| StoreError::writing(0, e))
    }

    #[cfg(unix)]
    fn read_at(&self, data: &mut [u8], position: u64) -> Result<(), StoreError> {
        use std::os::unix::fs::FileExt as _;
        self.file
            .read_exact_at(data, position)
            .map_err(|e| StoreError::reading(position, e))
    }

    #[cfg(unix)]
    fn write_at(&self, data: &[u8], position: u64) -> Result<(), StoreError> {
        use std::os::unix::fs::FileExt as _;
        self.file
            .write_all_at(data, position)
            .map_err(|e| StoreError::writing(position, e))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}

/// AES-256 in an XEX block mode: each 4 KiB file block is encrypted under
/// a tweak derived from its block number, so positional reads and writes
/// keep their offsets and lengths.
struct BlockCipher {
    data: Aes256,
    tweak: Aes256,
}

impl BlockCipher {
    fn new(key: &[u8]) -> Self {
        // Stretch or fold the user key into two 32-byte subkeys.
        let mut k1 = [0u8; 32];
        for (i, byte) in key.iter().enumerate() {
            k1[i % 32] ^= byte.rotate_left((i / 32) as u32);
        }
        let mut k2 = k1;
        for byte in k2.iter_mut() {
            *byte ^= 0x5c;
        }
        BlockCipher {
            data: Aes256::new(GenericArray::from_slice(&k1)),
            tweak: Aes256::new(GenericArray::from_slice(&k2)),
        }
    }

    fn block_tweak(&self, block: u64) -> [u8; 16] {
        let mut tweak = [0u8; 16];
        tweak[..8].copy_from_slice(&block.to_le_bytes());
        let mut ga = GenericArray::from(tweak);
        self.tweak.encrypt_block(&mut ga);
        ga.into()
    }

    fn encrypt(&self, first_block: u64, data: &mut [u8]) {
        self.apply(first_block, data, true);
    }

    fn decrypt(&self, first_block: u64, data: &mut [u8]) {
        self.apply(first_block, data, false);
    }

    fn apply(&self, first_block: u64, data: &mut [u8], encrypt: bool) {
        for (i, block) in data.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            let mut tweak = self.block_tweak(first_block + i as u64);
            for cell in block.chunks_exact_mut(16) {
                xor16(cell, &tweak);
                let mut ga = GenericArray::clone_from_slice(cell);
                if encrypt {
                    self.data.encrypt_block(&mut ga);
                } else {
                    self.data.decrypt_block(&mut ga);
                }
                cell.copy_from_slice(&ga);
                xor16(cell, &tweak);
                gf_double(&mut tweak);
            }
        }
    }
}

fn xor16(cell: &mut [u8], tweak: &[u8; 16]) {
    for (c, t) in cell.iter_mut().zip(tweak.iter()) {
        *c ^= t;
    }
}

/// Multiply the tweak by alpha in GF(2^128), little-endian convention.
fn gf_double(tweak: &mut [u8; 16]) {
    let mut carry = 0u8;
    for byte in tweak.iter_mut() {
        let next_carry = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = next_carry;
    }
    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}
