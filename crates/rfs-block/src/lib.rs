#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait, file-backed and in-memory devices,
//! and the buffered meta page cache recovery reads node and summary
//! blocks through, with conditional read-ahead and range truncation.

use parking_lot::Mutex;
use rfs_error::{RfsError, Result};
use rfs_types::{BLOCK_SIZE, BlkAddr};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned buffer holding exactly one block.
#[derive(Debug, Clone)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    /// Wrap a byte vector; it must be exactly one block long.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), BLOCK_SIZE);
        Self { bytes }
    }

    /// A zero-filled block.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

/// Random-access block device.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, addr: BlkAddr) -> Result<BlockBuf>;
    fn write_block(&self, addr: BlkAddr, data: &[u8]) -> Result<()>;
    fn block_count(&self) -> u32;
    fn sync(&self) -> Result<()>;
}

fn check_range(addr: BlkAddr, count: u32) -> Result<()> {
    if addr.0 >= count {
        return Err(RfsError::Format(format!(
            "block {addr} out of range (device has {count} blocks)"
        )));
    }
    Ok(())
}

fn check_len(data: &[u8]) -> Result<()> {
    if data.len() != BLOCK_SIZE {
        return Err(RfsError::Format(format!(
            "write size mismatch: got={} expected={BLOCK_SIZE}",
            data.len()
        )));
    }
    Ok(())
}

/// Block device backed by a regular file (pread/pwrite semantics).
pub struct FileBlockDevice {
    file: File,
    block_count: u32,
}

impl FileBlockDevice {
    /// Open an existing image file read-write.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let block_count = u32::try_from(len / BLOCK_SIZE as u64)
            .map_err(|_| RfsError::Format("image too large".to_owned()))?;
        Ok(Self { file, block_count })
    }

    /// Create (or truncate) an image file sized to `block_count` blocks.
    pub fn create(path: &Path, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(u64::from(block_count) * BLOCK_SIZE as u64)?;
        Ok(Self { file, block_count })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, addr: BlkAddr) -> Result<BlockBuf> {
        check_range(addr, self.block_count)?;
        let mut buf = vec![0_u8; BLOCK_SIZE];
        self.file.read_exact_at(&mut buf, addr.byte_offset())?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, addr: BlkAddr, data: &[u8]) -> Result<()> {
        check_range(addr, self.block_count)?;
        check_len(data)?;
        self.file.write_all_at(data, addr.byte_offset())?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory block device. Unwritten blocks read back as zeroes.
pub struct MemBlockDevice {
    blocks: Mutex<HashMap<u32, Vec<u8>>>,
    block_count: u32,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, addr: BlkAddr) -> Result<BlockBuf> {
        check_range(addr, self.block_count)?;
        let bytes = self
            .blocks
            .lock()
            .get(&addr.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; BLOCK_SIZE]);
        Ok(BlockBuf::new(bytes))
    }

    fn write_block(&self, addr: BlkAddr, data: &[u8]) -> Result<()> {
        check_range(addr, self.block_count)?;
        check_len(data)?;
        self.blocks.lock().insert(addr.0, data.to_vec());
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Buffered page cache for node/meta reads.
///
/// Writes go through to the device immediately; the cache exists so the
/// two recovery walks and the summary lookups hit memory, and so scratch
/// pages can be dropped wholesale once recovery finishes.
pub struct MetaCache {
    dev: Arc<dyn BlockDevice>,
    pages: Mutex<HashMap<u32, Arc<Vec<u8>>>>,
    dirty: Mutex<BTreeSet<u32>>,
}

impl MetaCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            pages: Mutex::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Read a page through the cache.
    pub fn get_page(&self, addr: BlkAddr) -> Result<BlockBuf> {
        if let Some(bytes) = self.pages.lock().get(&addr.0) {
            return Ok(BlockBuf::new(bytes.as_ref().clone()));
        }
        let buf = self.dev.read_block(addr)?;
        self.pages
            .lock()
            .insert(addr.0, Arc::new(buf.as_slice().to_vec()));
        Ok(buf)
    }

    /// Read a scratch page for recovery. Same as `get_page`; the distinct
    /// name marks call sites whose pages are dropped by the final
    /// truncation pass.
    pub fn get_tmp_page(&self, addr: BlkAddr) -> Result<BlockBuf> {
        self.get_page(addr)
    }

    /// Write a page through the cache to the device.
    pub fn write_page(&self, addr: BlkAddr, data: &[u8]) -> Result<()> {
        self.dev.write_block(addr, data)?;
        self.pages.lock().insert(addr.0, Arc::new(data.to_vec()));
        self.dirty.lock().insert(addr.0);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, addr: BlkAddr) -> bool {
        self.pages.lock().contains_key(&addr.0)
    }

    /// Conditional read-ahead: prefetch up to `count` pages starting at
    /// `addr`, skipping entirely when the first page is already cached.
    /// `accept` bounds the prefetch to valid addresses.
    pub fn ra_pages_cond(&self, addr: BlkAddr, count: u32, accept: impl Fn(BlkAddr) -> bool) {
        if self.contains(addr) {
            return;
        }
        let mut fetched = 0_u32;
        for i in 0..count {
            let Some(a) = addr.checked_add(i) else { break };
            if !accept(a) {
                break;
            }
            if self.contains(a) {
                continue;
            }
            let Ok(buf) = self.dev.read_block(a) else {
                break;
            };
            self.pages.lock().insert(a.0, Arc::new(buf.into_vec()));
            fetched += 1;
        }
        trace!(target: "rfs::block", event = "readahead", start = addr.0, count, fetched);
    }

    /// Drop all cached pages at or past `from`.
    pub fn truncate_from(&self, from: BlkAddr) {
        let mut pages = self.pages.lock();
        pages.retain(|&a, _| a < from.0);
        self.dirty.lock().retain(|&a| a < from.0);
    }

    /// Drop every cached page.
    pub fn truncate_all(&self) {
        self.pages.lock().clear();
        self.dirty.lock().clear();
    }

    /// Number of pages written through this cache since the last sync.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Flush device state; the cache is write-through so this only
    /// forwards the sync and clears the dirty set.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()?;
        self.dirty.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemBlockDevice::new(16);
        let mut data = vec![0_u8; BLOCK_SIZE];
        data[0] = 0xAB;
        dev.write_block(BlkAddr(3), &data).expect("write");
        let back = dev.read_block(BlkAddr(3)).expect("read");
        assert_eq!(back.as_slice()[0], 0xAB);
        // Unwritten blocks read as zeroes.
        assert_eq!(dev.read_block(BlkAddr(4)).expect("read").as_slice()[0], 0);
        // Out of range is an error.
        assert!(dev.read_block(BlkAddr(16)).is_err());
        assert!(dev.write_block(BlkAddr(99), &data).is_err());
    }

    #[test]
    fn short_write_rejected() {
        let dev = MemBlockDevice::new(4);
        assert!(dev.write_block(BlkAddr(0), &[1, 2, 3]).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.rfs");
        let dev = FileBlockDevice::create(&path, 8).expect("create");
        let mut data = vec![0_u8; BLOCK_SIZE];
        data[100] = 0x5A;
        dev.write_block(BlkAddr(5), &data).expect("write");
        dev.sync().expect("sync");
        drop(dev);

        let dev = FileBlockDevice::open(&path).expect("open");
        assert_eq!(dev.block_count(), 8);
        let back = dev.read_block(BlkAddr(5)).expect("read");
        assert_eq!(back.as_slice()[100], 0x5A);
    }

    #[test]
    fn cache_serves_and_truncates() {
        let dev = Arc::new(MemBlockDevice::new(32));
        let mut data = vec![0_u8; BLOCK_SIZE];
        data[7] = 7;
        dev.write_block(BlkAddr(10), &data).expect("seed");

        let cache = MetaCache::new(dev.clone());
        assert!(!cache.contains(BlkAddr(10)));
        assert_eq!(cache.get_tmp_page(BlkAddr(10)).expect("get").as_slice()[7], 7);
        assert!(cache.contains(BlkAddr(10)));

        cache.truncate_from(BlkAddr(10));
        assert!(!cache.contains(BlkAddr(10)));

        cache.get_page(BlkAddr(2)).expect("get");
        cache.get_page(BlkAddr(11)).expect("get");
        cache.truncate_from(BlkAddr(8));
        assert!(cache.contains(BlkAddr(2)));
        assert!(!cache.contains(BlkAddr(11)));

        cache.truncate_all();
        assert!(!cache.contains(BlkAddr(2)));
    }

    #[test]
    fn cache_write_through() {
        let dev = Arc::new(MemBlockDevice::new(8));
        let cache = MetaCache::new(dev.clone());
        let mut data = vec![0_u8; BLOCK_SIZE];
        data[0] = 0xEE;
        cache.write_page(BlkAddr(1), &data).expect("write");
        assert_eq!(cache.dirty_count(), 1);
        // Visible on the device without a flush.
        assert_eq!(dev.read_block(BlkAddr(1)).expect("read").as_slice()[0], 0xEE);
        cache.sync().expect("sync");
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn readahead_respects_bounds_and_skips_cached() {
        let dev = Arc::new(MemBlockDevice::new(16));
        let cache = MetaCache::new(dev);

        cache.ra_pages_cond(BlkAddr(4), 4, |a| a.0 < 6);
        assert!(cache.contains(BlkAddr(4)));
        assert!(cache.contains(BlkAddr(5)));
        assert!(!cache.contains(BlkAddr(6)));

        // First page cached: the whole window is skipped.
        cache.ra_pages_cond(BlkAddr(4), 8, |a| a.0 < 16);
        assert!(!cache.contains(BlkAddr(7)));
    }
}
