//! In-memory inodes and the inode cache.

use parking_lot::{Mutex, MutexGuard};
use rfs_error::{RfsError, Result};
use rfs_meta::SbInfo;
use rfs_ondisk::RawInode;
use rfs_types::{
    ADVISE_ENCRYPT_NAME, CASEFOLD_FL, DATA_EXIST_BIT, INLINE_DATA_BIT, INLINE_XATTR_BIT, Ino,
    PIN_FILE_BIT, S_IFDIR, S_IFMT,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

// In-memory inode flags.
pub const FI_PIN_FILE: u32 = 0x01;
pub const FI_DATA_EXIST: u32 = 0x02;
pub const FI_INLINE_DATA: u32 = 0x04;
pub const FI_INLINE_XATTR: u32 = 0x08;
/// Do not grow i_size while recovering data indices.
pub const FI_KEEP_ISIZE: u32 = 0x10;
/// The inode has unflushed metadata updates.
pub const FI_DIRTY: u32 = 0x20;

/// Mutable inode fields, guarded by the inode's lock.
#[derive(Debug, Clone, Default)]
pub struct InodeState {
    pub mode: u16,
    pub advise: u8,
    pub inline: u8,
    pub uid: u32,
    pub gid: u32,
    pub links: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub atime_nsec: u32,
    pub ctime_nsec: u32,
    pub mtime_nsec: u32,
    pub generation: u32,
    pub flags: u32,
    pub pino: u32,
    pub projid: u32,
    pub gc_failures: u16,
    pub fi: u32,
    pub quota_initialized: bool,
}

impl InodeState {
    #[must_use]
    pub fn from_raw(raw: &RawInode) -> Self {
        let mut fi = 0;
        if raw.inline & PIN_FILE_BIT != 0 {
            fi |= FI_PIN_FILE;
        }
        if raw.inline & DATA_EXIST_BIT != 0 {
            fi |= FI_DATA_EXIST;
        }
        if raw.inline & INLINE_DATA_BIT != 0 {
            fi |= FI_INLINE_DATA;
        }
        if raw.inline & INLINE_XATTR_BIT != 0 {
            fi |= FI_INLINE_XATTR;
        }
        Self {
            mode: raw.mode,
            advise: raw.advise,
            inline: raw.inline,
            uid: raw.uid,
            gid: raw.gid,
            links: raw.links,
            size: raw.size,
            blocks: raw.blocks,
            atime: raw.atime,
            ctime: raw.ctime,
            mtime: raw.mtime,
            atime_nsec: raw.atime_nsec,
            ctime_nsec: raw.ctime_nsec,
            mtime_nsec: raw.mtime_nsec,
            generation: raw.generation,
            flags: raw.flags,
            pino: raw.pino,
            projid: raw.projid,
            gc_failures: raw.gc_failures,
            fi,
            quota_initialized: false,
        }
    }
}

/// A live inode handle. Shared through `Arc` with the inode cache.
#[derive(Debug)]
pub struct Inode {
    ino: Ino,
    state: Mutex<InodeState>,
}

impl Inode {
    #[must_use]
    pub fn new(ino: Ino, state: InodeState) -> Self {
        Self {
            ino,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.state.lock().mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn i_size(&self) -> u64 {
        self.state.lock().size
    }

    #[must_use]
    pub fn test_fi(&self, flag: u32) -> bool {
        self.state.lock().fi & flag != 0
    }

    pub fn set_fi(&self, flag: u32) {
        self.state.lock().fi |= flag;
    }

    pub fn clear_fi(&self, flag: u32) {
        self.state.lock().fi &= !flag;
    }

    /// Usable data slots in this inode's node page.
    #[must_use]
    pub fn addrs_per_inode(&self) -> usize {
        rfs_ondisk::addrs_per_inode(self.state.lock().inline)
    }

    #[must_use]
    pub fn is_casefolded(&self) -> bool {
        self.state.lock().flags & CASEFOLD_FL != 0
    }

    #[must_use]
    pub fn has_encrypted_name(&self) -> bool {
        self.state.lock().advise & ADVISE_ENCRYPT_NAME != 0
    }
}

/// Per-mount cache of live inodes.
#[derive(Default)]
pub struct InodeCache {
    map: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl InodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_iget(&self, sbi: &SbInfo, ino: Ino) -> Result<Arc<Inode>> {
        if let Some(inode) = self.map.lock().get(&ino.0) {
            return Ok(Arc::clone(inode));
        }
        if sbi.fault.should_fail_alloc() {
            return Err(RfsError::OutOfMemory);
        }

        let info = sbi
            .get_node_info(ino.nid())
            .ok_or_else(|| RfsError::NotFound(format!("ino {ino} not in NAT")))?;
        if !info.blkaddr.is_mapped() {
            return Err(RfsError::NotFound(format!("ino {ino} has no node block")));
        }
        let page = sbi.meta().get_page(info.blkaddr)?;
        let raw = RawInode::parse(page.as_slice())
            .map_err(|e| RfsError::Format(format!("ino {ino}: {e}")))?;
        let inode = Arc::new(Inode::new(ino, InodeState::from_raw(&raw)));
        self.map.lock().insert(ino.0, Arc::clone(&inode));
        Ok(inode)
    }

    /// Look up an inode, retrying with a brief wait while memory pressure
    /// lasts.
    pub fn iget_retry(&self, sbi: &SbInfo, ino: Ino) -> Result<Arc<Inode>> {
        loop {
            match self.try_iget(sbi, ino) {
                Err(err) if err.is_retryable() => {
                    trace!(target: "rfs::node", event = "iget_backoff", ino = ino.0);
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    /// Release an inode handle.
    pub fn iput(&self, inode: Arc<Inode>) {
        drop(inode);
    }

    /// The inode's metadata now matches disk; nothing left to flush.
    pub fn mark_synced(&self, inode: &Inode) {
        inode.clear_fi(FI_DIRTY);
    }

    /// The inode carries updates that must reach disk with the next
    /// flush.
    pub fn mark_dirty_sync(&self, inode: &Inode) {
        inode.set_fi(FI_DIRTY);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Drop every cached inode (unmount).
    pub fn evict_all(&self) {
        self.map.lock().clear();
    }
}
