//! Fsync-inode table and its per-mount entry pool.
//!
//! Discovery gathers one entry per fsynced ino; each entry owns an inode
//! handle and records the first and last node block seen for that ino,
//! plus the last dentry-bearing block. Entries come from a per-mount
//! pool whose lifetime matches the mount and which checks that every
//! entry comes back.

use rfs_error::{RfsError, Result};
use rfs_meta::SbInfo;
use rfs_node::{Inode, InodeCache, QuotaLedger};
use rfs_types::{BlkAddr, Ino};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// One fsynced inode awaiting data repair.
#[derive(Debug)]
pub struct FsyncInodeEntry {
    pub inode: Arc<Inode>,
    pub ino: Ino,
    /// First node block of this ino on the chain.
    pub first_blkaddr: BlkAddr,
    /// Latest node block of this ino seen so far; repair retires the
    /// entry when it reaches this block.
    pub last_blkaddr: BlkAddr,
    /// Latest inode page that carried a new dentry.
    pub last_dentry_blkaddr: Option<BlkAddr>,
}

/// Per-mount allocator for fsync entries.
///
/// Tracks outstanding entries so teardown can assert that recovery
/// returned every one of them.
#[derive(Debug, Default)]
pub struct FsyncEntryPool {
    outstanding: AtomicUsize,
}

impl FsyncEntryPool {
    fn take(&self, inode: Arc<Inode>, ino: Ino, blkaddr: BlkAddr) -> FsyncInodeEntry {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        FsyncInodeEntry {
            inode,
            ino,
            first_blkaddr: blkaddr,
            last_blkaddr: blkaddr,
            last_dentry_blkaddr: None,
        }
    }

    fn put(&self, entry: FsyncInodeEntry) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        drop(entry);
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Create the per-mount entry pool.
#[must_use]
pub fn create_recovery_cache() -> FsyncEntryPool {
    FsyncEntryPool::default()
}

/// Tear the pool down; every entry must have been returned.
pub fn destroy_recovery_cache(pool: FsyncEntryPool) {
    let leaked = pool.outstanding();
    debug_assert_eq!(leaked, 0, "fsync entries leaked past recovery");
    if leaked != 0 {
        warn!(target: "rfs::recovery", event = "entry_pool_leak", leaked);
    }
}

/// Ordered set of fsync entries with O(n) lookup by ino; n is bounded by
/// the number of files fsynced since the last checkpoint.
#[derive(Debug, Default)]
pub struct FsyncInodeTable {
    entries: Vec<FsyncInodeEntry>,
}

impl FsyncInodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&mut self, ino: Ino) -> Option<&mut FsyncInodeEntry> {
        self.entries.iter_mut().find(|e| e.ino == ino)
    }

    #[must_use]
    pub fn contains(&self, ino: Ino) -> bool {
        self.entries.iter().any(|e| e.ino == ino)
    }

    /// Open the inode and append an entry for it, backing off and
    /// retrying while memory pressure lasts.
    ///
    /// `quota_inode` charges a fresh inode allocation (the inode page was
    /// materialized during discovery). `NotFound` means the ino is not in
    /// the NAT; the caller decides whether that is fatal.
    pub fn add(
        &mut self,
        sbi: &SbInfo,
        icache: &InodeCache,
        quota: &QuotaLedger,
        pool: &FsyncEntryPool,
        ino: Ino,
        blkaddr: BlkAddr,
        quota_inode: bool,
    ) -> Result<&mut FsyncInodeEntry> {
        let inode = loop {
            match self.try_open(sbi, icache, quota, ino, quota_inode) {
                Ok(inode) => break inode,
                Err(err) if err.is_retryable() => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(err) => return Err(err),
            }
        };
        self.entries.push(pool.take(inode, ino, blkaddr));
        Ok(self.entries.last_mut().expect("entry just pushed"))
    }

    fn try_open(
        &self,
        sbi: &SbInfo,
        icache: &InodeCache,
        quota: &QuotaLedger,
        ino: Ino,
        quota_inode: bool,
    ) -> Result<Arc<Inode>> {
        let inode = icache.iget_retry(sbi, ino)?;
        if let Err(err) = quota.dquot_initialize(sbi, &inode) {
            icache.iput(inode);
            return Err(err);
        }
        if quota_inode {
            if let Err(err) = quota.dquot_alloc_inode(sbi, &inode) {
                icache.iput(inode);
                return Err(err);
            }
        }
        Ok(inode)
    }

    /// Detach the entry for `ino` and append it to `other`.
    pub fn move_to(&mut self, ino: Ino, other: &mut Self) {
        if let Some(idx) = self.entries.iter().position(|e| e.ino == ino) {
            other.entries.push(self.entries.remove(idx));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn inos(&self) -> impl Iterator<Item = Ino> + '_ {
        self.entries.iter().map(|e| e.ino)
    }

    /// Destroy every entry. With `drop_dirty`, inodes are marked synced
    /// first so their unrecovered state is not flushed into the next
    /// checkpoint.
    pub fn destroy(
        &mut self,
        icache: &InodeCache,
        pool: &FsyncEntryPool,
        drop_dirty: bool,
    ) {
        for entry in self.entries.drain(..) {
            if drop_dirty {
                icache.mark_synced(&entry.inode);
            }
            icache.iput(Arc::clone(&entry.inode));
            pool.put(entry);
        }
    }
}

/// Map an `iget` miss during dentry recovery: a stale colliding entry
/// whose inode vanished means the directory holds a duplicate.
pub fn missing_as_exists(err: RfsError) -> RfsError {
    match err {
        RfsError::NotFound(_) => RfsError::Exists,
        other => other,
    }
}
