//! Quota context for recovery.
//!
//! An in-memory ledger of per-uid inode charges and per-inode project
//! ownership. Transfer failures are non-fatal to recovery; the caller
//! flags the superblock for offline repair instead.

use parking_lot::Mutex;
use rfs_error::{RfsError, Result};
use rfs_meta::SbInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::inode::Inode;

/// Per-mount quota ledger.
#[derive(Default)]
pub struct QuotaLedger {
    inode_charges: Mutex<HashMap<u32, u64>>,
    project_inodes: Mutex<HashMap<u32, u64>>,
}

impl QuotaLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach quota context to an inode before any charge is made
    /// against it. Idempotent.
    pub fn dquot_initialize(&self, sbi: &SbInfo, inode: &Arc<Inode>) -> Result<()> {
        if !sbi.quota_enabled() {
            return Ok(());
        }
        if sbi.fault.should_fail_alloc() {
            return Err(RfsError::OutOfMemory);
        }
        inode.state().quota_initialized = true;
        Ok(())
    }

    /// Charge one inode allocation to the inode's owner.
    pub fn dquot_alloc_inode(&self, sbi: &SbInfo, inode: &Arc<Inode>) -> Result<()> {
        if !sbi.quota_enabled() {
            return Ok(());
        }
        let uid = inode.state().uid;
        *self.inode_charges.lock().entry(uid).or_insert(0) += 1;
        debug!(target: "rfs::quota", event = "alloc_inode", ino = inode.ino().0, uid);
        Ok(())
    }

    /// Move the inode's charges to a new owner. On failure the caller
    /// sets `QuotaNeedRepair` and recovery continues.
    pub fn dquot_transfer(
        &self,
        sbi: &SbInfo,
        inode: &Arc<Inode>,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        if !sbi.quota_enabled() {
            return Ok(());
        }
        if sbi.fault.should_fail_alloc() {
            return Err(RfsError::Quota(format!(
                "transfer to uid {uid} failed under pressure"
            )));
        }
        let old_uid = {
            let mut state = inode.state();
            let old = state.uid;
            state.uid = uid;
            state.gid = gid;
            old
        };
        if old_uid != uid {
            let mut charges = self.inode_charges.lock();
            if let Some(c) = charges.get_mut(&old_uid) {
                *c = c.saturating_sub(1);
            }
            *charges.entry(uid).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Move the inode to a different project.
    pub fn transfer_project_quota(
        &self,
        sbi: &SbInfo,
        inode: &Arc<Inode>,
        projid: u32,
    ) -> Result<()> {
        if !sbi.quota_enabled() {
            return Ok(());
        }
        if sbi.fault.should_fail_alloc() {
            return Err(RfsError::Quota(format!(
                "project transfer to {projid} failed under pressure"
            )));
        }
        let old = {
            let mut state = inode.state();
            let old = state.projid;
            state.projid = projid;
            old
        };
        if old != projid {
            let mut projects = self.project_inodes.lock();
            if let Some(c) = projects.get_mut(&old) {
                *c = c.saturating_sub(1);
            }
            *projects.entry(projid).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Inode charges currently held by a uid.
    #[must_use]
    pub fn inode_charge(&self, uid: u32) -> u64 {
        self.inode_charges.lock().get(&uid).copied().unwrap_or(0)
    }

    /// Inodes currently owned by a project.
    #[must_use]
    pub fn project_inode_count(&self, projid: u32) -> u64 {
        self.project_inodes.lock().get(&projid).copied().unwrap_or(0)
    }
}
