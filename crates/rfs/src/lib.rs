#![forbid(unsafe_code)]
//! RollFS public API facade.
//!
//! Assembles the per-mount pieces (mount state, inode cache, quota
//! ledger, recovery entry pool) behind one `Mount` handle and re-exports
//! the types downstream consumers (CLI, tests) need.

pub use rfs_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use rfs_error::{RfsError, Result};
pub use rfs_meta::{FormatOptions, MountOptions, SbInfo, SbiFlag};
pub use rfs_recovery::{RecoverOutcome, RecoverySummary};
pub use rfs_types::{BlkAddr, CpVer, Ino, Nid};

use rfs_node::{InodeCache, QuotaLedger};
use rfs_recovery::{FsyncEntryPool, create_recovery_cache, destroy_recovery_cache};
use std::path::Path;
use std::sync::Arc;

/// A mounted filesystem.
pub struct Mount {
    pub sbi: SbInfo,
    pub icache: InodeCache,
    pub quota: QuotaLedger,
    pool: FsyncEntryPool,
}

impl Mount {
    /// Mount from any block device.
    pub fn open(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let sbi = SbInfo::mount(dev, options)?;
        Ok(Self {
            sbi,
            icache: InodeCache::new(),
            quota: QuotaLedger::new(),
            pool: create_recovery_cache(),
        })
    }

    /// Mount an image file.
    pub fn open_path(path: &Path, options: MountOptions) -> Result<Self> {
        let dev = Arc::new(FileBlockDevice::open(path)?);
        Self::open(dev, options)
    }

    /// Format an image file and leave it cleanly checkpointed.
    pub fn format_path(path: &Path, opts: &FormatOptions) -> Result<()> {
        let blocks = SbInfo::image_blocks(opts);
        let dev = Arc::new(FileBlockDevice::create(path, blocks)?);
        SbInfo::format(dev, opts)
    }

    /// Whether the last checkpoint was unclean and roll-forward recovery
    /// is pending.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.sbi.test_flag(SbiFlag::PorDoing)
    }

    /// Run roll-forward fsync recovery.
    pub fn recover_fsync_data(&self, check_only: bool) -> Result<RecoverOutcome> {
        rfs_recovery::recover_fsync_data(
            &self.sbi,
            &self.icache,
            &self.quota,
            &self.pool,
            check_only,
        )
    }

    /// Release the mount: inode cache and the recovery entry pool are
    /// torn down with it.
    pub fn close(self) {
        self.icache.evict_all();
        destroy_recovery_cache(self.pool);
    }
}
