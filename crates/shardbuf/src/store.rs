//! Device adapters: synchronous whole-block load/store.
//!
//! The cache treats the device as an external collaborator that can fill
//! or persist one block at a time. [`MemoryBlockStore`] backs tests and
//! benchmarks; [`FileBlockStore`] maps a single device onto a file using
//! `pread`/`pwrite` style positional I/O.

use parking_lot::Mutex;
use shardbuf_error::{CacheError, Result};
use shardbuf_types::{BlockKey, BlockSize, DeviceId};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Block-addressed backing store.
///
/// Both operations are blocking from the cache's perspective; any internal
/// queueing or interrupt-driven completion is the implementor's concern.
/// `buf.len()` always equals `block_size()` for both calls.
pub trait BlockStore: Send + Sync {
    /// Device block size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Fill `buf` with the contents of `key`'s block.
    fn load(&self, key: BlockKey, buf: &mut [u8]) -> Result<()>;

    /// Persist `buf` as `key`'s block.
    fn store(&self, key: BlockKey, buf: &[u8]) -> Result<()>;
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn load(&self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        (**self).load(key, buf)
    }

    fn store(&self, key: BlockKey, buf: &[u8]) -> Result<()> {
        (**self).store(key, buf)
    }
}

// ── In-memory store ────────────────────────────────────────────────────

/// Sparse in-memory store; blocks never written read back as zeroes.
#[derive(Debug)]
pub struct MemoryBlockStore {
    block_size: BlockSize,
    blocks: Mutex<HashMap<BlockKey, Vec<u8>>>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks ever stored.
    #[must_use]
    pub fn stored_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn load(&self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        match blocks.get(&key) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
        drop(blocks);
        Ok(())
    }

    fn store(&self, key: BlockKey, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size.as_usize());
        self.blocks.lock().insert(key, buf.to_vec());
        Ok(())
    }
}

// ── File-backed store ──────────────────────────────────────────────────

/// Single-device store over a file, using positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position, so concurrent loads and stores do not contend here.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    file: Arc<File>,
    device: DeviceId,
    block_size: BlockSize,
    block_count: u64,
    writable: bool,
}

impl FileBlockStore {
    /// Open an image file as the backing store for `device`.
    ///
    /// Opens read-write if possible, read-only otherwise. The file length
    /// must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, device: DeviceId, block_size: BlockSize) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_size_u64 = u64::from(block_size.get());
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(CacheError::Config(format!(
                "image length is not block-aligned: len_bytes={len} block_size={} remainder={remainder}",
                block_size.get()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            device,
            block_size,
            block_count: len / block_size_u64,
            writable,
        })
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn offset_of(&self, key: BlockKey) -> Result<u64> {
        if key.device != self.device {
            return Err(CacheError::UnknownDevice {
                device: key.device.0,
            });
        }
        if key.block.0 >= self.block_count {
            return Err(CacheError::OutOfRange {
                block: key.block.0,
                block_count: self.block_count,
            });
        }
        self.block_size
            .block_to_byte(key.block)
            .ok_or(CacheError::OutOfRange {
                block: key.block.0,
                block_count: self.block_count,
            })
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn load(&self, key: BlockKey, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size.as_usize());
        let offset = self.offset_of(key)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn store(&self, key: BlockKey, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size.as_usize());
        if !self.writable {
            return Err(CacheError::ReadOnly);
        }
        let offset = self.offset_of(key)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardbuf_types::BlockNumber;

    fn bs() -> BlockSize {
        BlockSize::new(512).expect("block size")
    }

    fn key(device: u32, block: u64) -> BlockKey {
        BlockKey::new(DeviceId(device), BlockNumber(block))
    }

    #[test]
    fn memory_store_round_trips_and_zero_fills() {
        let store = MemoryBlockStore::new(bs());
        let mut buf = vec![0xFF_u8; 512];

        store.load(key(0, 3), &mut buf).expect("absent block");
        assert!(buf.iter().all(|&b| b == 0), "absent blocks read as zeroes");

        buf.fill(0x42);
        store.store(key(0, 3), &buf).expect("store");
        assert_eq!(store.stored_blocks(), 1);

        let mut back = vec![0_u8; 512];
        store.load(key(0, 3), &mut back).expect("load");
        assert_eq!(back, buf);
    }

    #[test]
    fn file_store_round_trips() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(512 * 8).expect("set_len");

        let store = FileBlockStore::open(file.path(), DeviceId(1), bs()).expect("open");
        assert_eq!(store.block_count(), 8);

        let data = vec![0x7E_u8; 512];
        store.store(key(1, 5), &data).expect("store");

        let mut back = vec![0_u8; 512];
        store.load(key(1, 5), &mut back).expect("load");
        assert_eq!(back, data);
    }

    #[test]
    fn file_store_rejects_wrong_device_and_out_of_range() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(512 * 4).expect("set_len");

        let store = FileBlockStore::open(file.path(), DeviceId(1), bs()).expect("open");
        let mut buf = vec![0_u8; 512];

        let err = store.load(key(2, 0), &mut buf).expect_err("wrong device");
        assert!(matches!(err, CacheError::UnknownDevice { device: 2 }));

        let err = store.load(key(1, 4), &mut buf).expect_err("past the end");
        assert!(matches!(
            err,
            CacheError::OutOfRange {
                block: 4,
                block_count: 4
            }
        ));
    }

    #[test]
    fn file_store_rejects_unaligned_image() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(512 * 4 + 100).expect("set_len");

        let err = FileBlockStore::open(file.path(), DeviceId(0), bs()).expect_err("unaligned");
        assert!(matches!(err, CacheError::Config(_)));
    }
}
