//! Discovery pass: walk the post-checkpoint node chain and gather the
//! fsync-inode table.

use crate::table::{FsyncEntryPool, FsyncInodeTable};
use rfs_error::{RfsError, Result};
use rfs_meta::{BlkAddrCategory, SbInfo};
use rfs_node::{InodeCache, QuotaLedger, has_xattr_block, recover_inode_page};
use rfs_ondisk::{
    addrs_per_page, ino_of, is_dent_dnode, is_fsync_dnode, is_inode, is_recoverable,
    next_blkaddr_of, ofs_of, read_addr,
};
use rfs_types::{BlkAddr, SegNo};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Read-ahead window bounds for the chain walk, in pages.
pub const RECOVERY_MAX_RA_BLOCKS: u32 = 8;
pub const RECOVERY_MIN_RA_BLOCKS: u32 = 1;

/// Grow the window while the chain stays contiguous; shrink it when the
/// next hop lands mid-segment.
#[must_use]
pub fn adjust_ra_blocks(sbi: &SbInfo, ra_blocks: u32, blkaddr: BlkAddr, next: BlkAddr) -> u32 {
    if blkaddr.0 + 1 == next.0 {
        RECOVERY_MAX_RA_BLOCKS.min(ra_blocks * 2)
    } else if sbi.is_valid_blkaddr(next, BlkAddrCategory::MetaPor)
        && sbi.geometry().blkoff_of(next) != 0
    {
        RECOVERY_MIN_RA_BLOCKS.max(ra_blocks / 2)
    } else {
        ra_blocks
    }
}

/// Read-only sweep of the log from `start`: every segment the chain's
/// node blocks and index destinations occupy.
///
/// Recovery fences these segments off from its own allocations before
/// any inode page is materialized; the walk doubles as the first
/// warm-up of the page cache. A looped chain simply stops at the bound
/// here; discovery proper reports it as corruption.
pub fn scan_chain_extent(sbi: &SbInfo, start: BlkAddr) -> Result<Vec<SegNo>> {
    let mut blkaddr = start;
    let mut steps = sbi.free_blocks();
    let mut extent: BTreeSet<u32> = BTreeSet::new();

    while steps > 0 {
        if !sbi.is_valid_blkaddr(blkaddr, BlkAddrCategory::MetaPor) {
            break;
        }
        let page = sbi.meta().get_tmp_page(blkaddr)?.into_vec();
        if !is_recoverable(&page, sbi.cp_ver()) {
            break;
        }
        extent.insert(sbi.geometry().segno_of(blkaddr).0);

        // Index destinations this page will replay live in main-area
        // segments too; fence them alongside the chain itself.
        if is_inode(&page) || !has_xattr_block(ofs_of(&page)) {
            for idx in 0..addrs_per_page(&page) {
                let dest = read_addr(&page, idx);
                if dest.is_mapped() && sbi.is_valid_blkaddr(dest, BlkAddrCategory::MetaPor) {
                    extent.insert(sbi.geometry().segno_of(dest).0);
                }
            }
        }

        let next = next_blkaddr_of(&page);
        if next == blkaddr {
            break;
        }
        blkaddr = next;
        steps -= 1;
    }
    Ok(extent.into_iter().map(SegNo).collect())
}

/// Walk the chain from `start` and populate `table` with one entry per
/// fsync-marked ino.
///
/// In check-only mode no inode page is materialized and nothing
/// persistent changes.
pub fn find_fsync_dnodes(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    pool: &FsyncEntryPool,
    table: &mut FsyncInodeTable,
    start: BlkAddr,
    check_only: bool,
) -> Result<()> {
    let mut blkaddr = start;
    let mut ra_blocks = RECOVERY_MAX_RA_BLOCKS;
    let free_blocks = sbi.free_blocks();
    let mut loop_cnt: u32 = 0;

    loop {
        if !sbi.is_valid_blkaddr(blkaddr, BlkAddrCategory::MetaPor) {
            return Ok(());
        }
        let page = sbi.meta().get_tmp_page(blkaddr)?.into_vec();
        if !is_recoverable(&page, sbi.cp_ver()) {
            return Ok(());
        }

        if is_fsync_dnode(&page) {
            let ino = ino_of(&page);
            let mut tracked = table.contains(ino);
            if !tracked {
                let mut quota_inode = false;
                if !check_only && is_inode(&page) && is_dent_dnode(&page) {
                    recover_inode_page(sbi, &page)?;
                    quota_inode = true;
                }
                match table.add(sbi, icache, quota, pool, ino, blkaddr, quota_inode) {
                    Ok(_) => tracked = true,
                    Err(RfsError::NotFound(_)) => {
                        // The inode page for this dnode never made it to
                        // the log; drop the dnode and keep walking.
                        debug!(
                            target: "rfs::recovery",
                            event = "orphan_dnode_skipped",
                            ino = ino.0,
                            blkaddr = blkaddr.0
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
            if tracked {
                let entry = table.find(ino).expect("entry just tracked");
                entry.last_blkaddr = blkaddr;
                if is_inode(&page) && is_dent_dnode(&page) {
                    entry.last_dentry_blkaddr = Some(blkaddr);
                }
            }
        }

        // Sanity check to catch a looped node chain.
        loop_cnt += 1;
        let next = next_blkaddr_of(&page);
        if loop_cnt >= free_blocks || next == blkaddr {
            warn!(
                target: "rfs::recovery",
                event = "looped_node_chain",
                blkaddr = blkaddr.0,
                next = next.0,
                steps = loop_cnt
            );
            return Err(RfsError::Corrupt {
                blkaddr: blkaddr.0,
                detail: format!("looped node chain (next {next}, {loop_cnt} steps)"),
            });
        }

        ra_blocks = adjust_ra_blocks(sbi, ra_blocks, blkaddr, next);
        blkaddr = next;
        sbi.meta().ra_pages_cond(blkaddr, ra_blocks, |a| {
            sbi.is_valid_blkaddr(a, BlkAddrCategory::MetaPor)
        });
    }
}
