#![forbid(unsafe_code)]
//! Roll-forward fsync recovery.
//!
//! After an unclean shutdown the filesystem mounts from its last
//! consistent checkpoint; anything an application fsynced after that
//! checkpoint still sits on the node log. This crate walks that log,
//! rebuilds the affected inodes and directory entries, and repairs the
//! data-block indices so the fsynced state becomes visible again, then
//! commits a fresh checkpoint.
//!
//! Roll-forward scenarios, with F = fsync mark and D = dentry mark:
//!
//! 1. `inode(x) | CP | inode(x) | dnode(F)` → update the latest inode(x).
//! 2. `inode(x) | CP | inode(F) | dnode(F)` → no problem.
//! 3. `inode(x) | CP | dnode(F) | inode(x)` → recover to dnode(F), drop
//!    the trailing inode(x).
//! 4. `inode(x) | CP | dnode(F) | inode(F)` → no problem.
//! 5. `CP | inode(x) | dnode(F)` → the inode(DF) is missing; drop the
//!    dnode(F).
//! 6. `CP | inode(DF) | dnode(F)` → no problem.
//! 7. `CP | dnode(F) | inode(DF)` → if the inode open fails, keep
//!    walking to find inode(DF).
//! 8. `CP | dnode(F) | inode(x)` → same as 7, but no inode(DF) ever
//!    arrives; the dnode is dropped.

mod dentry;
mod discover;
mod repair;
mod resolve;
mod table;

pub use discover::{
    RECOVERY_MAX_RA_BLOCKS, RECOVERY_MIN_RA_BLOCKS, adjust_ra_blocks, find_fsync_dnodes,
    scan_chain_extent,
};
pub use repair::{do_recover_data, recover_data, recover_inode};
pub use resolve::check_index_in_prev_nodes;
pub use table::{
    FsyncEntryPool, FsyncInodeEntry, FsyncInodeTable, create_recovery_cache,
    destroy_recovery_cache,
};

use rfs_error::Result;
use rfs_meta::{CpReason, CursegType, SbInfo, SbiFlag};
use rfs_node::{InodeCache, QuotaLedger};
use serde::{Deserialize, Serialize};
use tracing::info;

/// What a recovery run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub check_only: bool,
    /// Fsynced inodes found on the post-checkpoint chain.
    pub fsynced_inodes: usize,
    /// Data indices rewritten during repair.
    pub recovered_indices: usize,
    /// Whether a roll-forward checkpoint was committed.
    pub checkpoint_written: bool,
}

impl RecoverySummary {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of `recover_fsync_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverOutcome {
    /// Recovery finished (or there was nothing to recover).
    Clean(RecoverySummary),
    /// Check-only mode found fsynced data needing recovery.
    NeedsRecovery,
}

/// Run roll-forward recovery.
///
/// Holds the checkpoint lock across discovery and repair, tears down the
/// fsync tables and recovery scratch pages unconditionally, reconciles
/// zoned write pointers when applicable, and commits a recovery
/// checkpoint when repair ran.
pub fn recover_fsync_data(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    pool: &FsyncEntryPool,
    check_only: bool,
) -> Result<RecoverOutcome> {
    let was_readonly = sbi.readonly();
    if was_readonly {
        info!(target: "rfs::recovery", event = "recover_on_readonly");
        sbi.set_readonly(false);
    }
    // Turn on quotas so they are updated correctly.
    let quota_enabled = sbi.enable_quota_files();

    let mut inode_list = FsyncInodeTable::new();
    let mut tmp_list = FsyncInodeTable::new();
    let mut dir_list = FsyncInodeTable::new();

    let mut needs_recovery = false;
    let mut need_checkpoint = false;
    let mut recovered_indices = 0;
    let mut fsynced_inodes = 0;

    // Prevent checkpointing while the log is replayed.
    let cp_guard = sbi.cp_lock();
    let chain_start = sbi.next_free_blkaddr(CursegType::WarmNode);

    // Recovery writes (materialized inode pages, repaired dnodes, dentry
    // blocks) must not land on the unread log: fence every segment the
    // log touches and move all log classes onto fresh segments first.
    let mut err: Result<()> = if check_only {
        Ok(())
    } else {
        scan_chain_extent(sbi, chain_start).and_then(|extent| {
            if extent.is_empty() {
                return Ok(());
            }
            let mut fence = extent;
            for ty in CursegType::ALL {
                fence.push(sbi.curseg_pos(ty).0);
            }
            sbi.reserve_segments(fence);
            sbi.allocate_new_segments()
        })
    };

    // Step 1: find fsynced inode numbers.
    if err.is_ok() {
        err = find_fsync_dnodes(
            sbi,
            icache,
            quota,
            pool,
            &mut inode_list,
            chain_start,
            check_only,
        );
        fsynced_inodes = inode_list.len();
    }

    if err.is_ok() && !inode_list.is_empty() {
        if check_only {
            needs_recovery = true;
        } else {
            need_checkpoint = true;
            // Step 2: recover data.
            err = recover_data(
                sbi,
                icache,
                quota,
                pool,
                &mut inode_list,
                &mut tmp_list,
                &mut dir_list,
                chain_start,
            )
            .map(|n| {
                recovered_indices = n;
            });
            debug_assert!(err.is_err() || inode_list.is_empty());
        }
    }

    // Teardown is unconditional.
    let fix_pointers = !check_only || inode_list.is_empty();
    let had_err = err.is_err();

    inode_list.destroy(icache, pool, had_err);
    tmp_list.destroy(icache, pool, had_err);
    sbi.clear_reserved_segments();

    // Drop the scratch pages recovery read from the log.
    sbi.meta().truncate_from(sbi.geometry().sb.main_blkaddr);
    if had_err {
        sbi.meta().truncate_all();
    }

    if err.is_ok()
        && fix_pointers
        && !sbi.readonly()
        && sbi.geometry().sb.zoned
    {
        err = sbi.fix_curseg_write_pointer();
    }
    if err.is_ok() {
        sbi.clear_flag(SbiFlag::PorDoing);
    }
    drop(cp_guard);

    // Drop the directory handles only after the lock: a clean checkpoint
    // must not see them as busy.
    dir_list.destroy(icache, pool, err.is_err());

    let mut checkpoint_written = false;
    if need_checkpoint {
        sbi.set_flag(SbiFlag::IsRecovered);
        if err.is_ok() {
            err = sbi.write_checkpoint(CpReason::Recovery);
            checkpoint_written = err.is_ok();
        }
    }

    if quota_enabled {
        sbi.disable_quota_files();
    }
    sbi.set_readonly(was_readonly);

    err?;
    if needs_recovery {
        return Ok(RecoverOutcome::NeedsRecovery);
    }
    let summary = RecoverySummary {
        check_only,
        fsynced_inodes,
        recovered_indices,
        checkpoint_written,
    };
    info!(
        target: "rfs::recovery",
        event = "recovery_done",
        fsynced_inodes = summary.fsynced_inodes,
        recovered_indices = summary.recovered_indices,
        checkpoint_written = summary.checkpoint_written
    );
    Ok(RecoverOutcome::Clean(summary))
}

/// Kernel-style integer surface: `0` success or nothing to recover, `1`
/// check-only and recovery is needed, negative errno otherwise.
pub fn recover_fsync_data_errno(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    pool: &FsyncEntryPool,
    check_only: bool,
) -> i32 {
    match recover_fsync_data(sbi, icache, quota, pool, check_only) {
        Ok(RecoverOutcome::Clean(_)) => 0,
        Ok(RecoverOutcome::NeedsRecovery) => 1,
        Err(err) => -err.to_errno(),
    }
}
