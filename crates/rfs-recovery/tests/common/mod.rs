//! Shared image-building helpers for the recovery integration suites.
//!
//! Tests format an in-memory image, build pre-checkpoint state through
//! the normal node/dir layers, write an unclean checkpoint, then append
//! a simulated fsync chain directly to the device, exactly the bytes an
//! interrupted run would have left behind.

#![allow(dead_code)]

use rfs_block::{BlockDevice, MemBlockDevice};
use rfs_error::Result;
use rfs_meta::{CpReason, CursegType, FormatOptions, MountOptions, SbInfo};
use rfs_node::{Inode, InodeCache, QuotaLedger, write_new_inode};
use rfs_ondisk::{NodeFooter, RawInode, write_addr};
use rfs_recovery::{FsyncEntryPool, RecoverOutcome, create_recovery_cache, recover_fsync_data};
use rfs_types::{BLOCK_SIZE, BlkAddr, CpVer, Ino, Nid, S_IFDIR, S_IFREG};
use std::sync::Arc;

pub struct TestFs {
    pub dev: Arc<MemBlockDevice>,
    pub sbi: SbInfo,
    pub icache: InodeCache,
    pub quota: QuotaLedger,
    pub pool: FsyncEntryPool,
}

pub fn opts(main_segs: u32) -> FormatOptions {
    FormatOptions {
        blocks_per_seg: 8,
        main_segs,
        max_orphans: 8,
        zoned: false,
        segs_per_zone: 0,
    }
}

pub fn format_dev(o: &FormatOptions) -> Arc<MemBlockDevice> {
    let dev = Arc::new(MemBlockDevice::new(SbInfo::image_blocks(o)));
    SbInfo::format(dev.clone(), o).expect("format");
    dev
}

pub fn mount(dev: &Arc<MemBlockDevice>) -> TestFs {
    let sbi = SbInfo::mount(dev.clone(), MountOptions::default()).expect("mount");
    TestFs {
        dev: Arc::clone(dev),
        sbi,
        icache: InodeCache::new(),
        quota: QuotaLedger::new(),
        pool: create_recovery_cache(),
    }
}

impl TestFs {
    pub fn recover(&self, check_only: bool) -> Result<RecoverOutcome> {
        recover_fsync_data(&self.sbi, &self.icache, &self.quota, &self.pool, check_only)
    }

    /// Where the post-checkpoint chain begins.
    pub fn chain_start(&self) -> BlkAddr {
        self.sbi.next_free_blkaddr(CursegType::WarmNode)
    }

    /// Write the "crash point" checkpoint: persistent but not clean.
    pub fn checkpoint(&self) {
        self.sbi
            .write_checkpoint(CpReason::Regular)
            .expect("checkpoint");
    }

    pub fn seed_file(&self, ino: Ino, raw: &RawInode) -> Arc<Inode> {
        write_new_inode(&self.sbi, ino, raw).expect("seed inode");
        self.icache.iget_retry(&self.sbi, ino).expect("iget")
    }
}

pub fn reg_raw(name: &str) -> RawInode {
    RawInode {
        mode: S_IFREG | 0o644,
        links: 1,
        namelen: name.len() as u32,
        name: name.as_bytes().to_vec(),
        ..RawInode::default()
    }
}

pub fn dir_raw(name: &str) -> RawInode {
    RawInode {
        mode: S_IFDIR | 0o755,
        links: 2,
        namelen: name.len() as u32,
        name: name.as_bytes().to_vec(),
        ..RawInode::default()
    }
}

/// Build a node page: footer first, optionally an inode body.
pub fn node_page(
    nid: u32,
    ino: u32,
    ofs: u32,
    flag: u32,
    cp_ver: CpVer,
    next: u32,
    raw: Option<&RawInode>,
) -> Vec<u8> {
    let mut page = vec![0_u8; BLOCK_SIZE];
    if let Some(raw) = raw {
        raw.write_to(&mut page);
    }
    NodeFooter {
        nid: Nid(nid),
        ino: Ino(ino),
        flag,
        ofs,
        cp_ver,
        next_blkaddr: BlkAddr(next),
    }
    .write_to(&mut page);
    page
}

/// Set a data-index slot; the footer must already be in place so the
/// slot base resolves correctly.
pub fn set_index(page: &mut [u8], idx: usize, addr: BlkAddr) {
    write_addr(page, idx, addr);
}

/// Write `pages` consecutively from `start`, rewriting each footer's
/// `next_blkaddr` to the following block. The last page keeps whatever
/// terminal `next` it was built with.
pub fn write_chain(dev: &dyn BlockDevice, start: BlkAddr, pages: &mut [Vec<u8>]) {
    let n = pages.len();
    for (i, page) in pages.iter_mut().enumerate() {
        if i + 1 < n {
            let mut footer = NodeFooter::parse(page).expect("footer");
            footer.next_blkaddr = BlkAddr(start.0 + i as u32 + 1);
            footer.write_to(page);
        }
        dev.write_block(BlkAddr(start.0 + i as u32), page)
            .expect("chain write");
    }
}

pub fn fill_data_block(dev: &dyn BlockDevice, addr: BlkAddr, byte: u8) {
    dev.write_block(addr, &vec![byte; BLOCK_SIZE])
        .expect("data write");
}
