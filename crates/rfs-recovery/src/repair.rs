//! Data repair pass: inode reconstruction and data-index repair.

use crate::dentry::recover_dentry;
use crate::discover::{RECOVERY_MAX_RA_BLOCKS, adjust_ra_blocks};
use crate::resolve::check_index_in_prev_nodes;
use crate::table::{FsyncEntryPool, FsyncInodeTable};
use rfs_error::{RfsError, Result};
use rfs_meta::{BlkAddrCategory, SbiFlag, SbInfo};
use rfs_node::{
    DnodeMode, FI_DATA_EXIST, FI_KEEP_ISIZE, FI_PIN_FILE, Inode, InodeCache, QuotaLedger,
    copy_node_footer, fill_node_footer, flush_inode, get_dnode_of_data, has_xattr_block,
    i_size_write, put_dnode, recover_inline_data, recover_inline_xattr, recover_xattr_data,
    replace_block, reserve_new_block, start_bidx_of_node, truncate_data_blocks_range,
    wait_on_node_writeback,
};
use rfs_ondisk::{
    RawInode, addrs_per_page, ino_of, is_inode, is_recoverable, next_blkaddr_of, ofs_of,
    read_addr,
};
use rfs_types::{BLOCK_SIZE, BlkAddr, DATA_EXIST_BIT, PIN_FILE_BIT};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn backoff() {
    std::thread::sleep(Duration::from_millis(1));
}

// ── Inode reconstruction ────────────────────────────────────────────────────

/// Transfer ownership charges when the recovered uid/gid differ.
/// Failure is non-fatal: the superblock is flagged for offline quota
/// repair and recovery continues with the recovered owner.
fn recover_quota_data(
    sbi: &SbInfo,
    quota: &QuotaLedger,
    inode: &Arc<Inode>,
    raw: &RawInode,
) -> Result<()> {
    let (cur_uid, cur_gid) = {
        let state = inode.state();
        (state.uid, state.gid)
    };
    if cur_uid == raw.uid && cur_gid == raw.gid {
        return Ok(());
    }
    if let Err(err) = quota.dquot_transfer(sbi, inode, raw.uid, raw.gid) {
        sbi.set_flag(SbiFlag::QuotaNeedRepair);
        warn!(
            target: "rfs::recovery",
            event = "quota_transfer_failed",
            ino = inode.ino().0,
            error = %err
        );
        let mut state = inode.state();
        state.uid = raw.uid;
        state.gid = raw.gid;
    }
    Ok(())
}

fn recover_inline_flags(inode: &Arc<Inode>, raw: &RawInode) {
    let mut state = inode.state();
    if raw.inline & PIN_FILE_BIT != 0 {
        state.fi |= FI_PIN_FILE;
        state.inline |= PIN_FILE_BIT;
    } else {
        state.fi &= !FI_PIN_FILE;
        state.inline &= !PIN_FILE_BIT;
    }
    if raw.inline & DATA_EXIST_BIT != 0 {
        state.fi |= FI_DATA_EXIST;
        state.inline |= DATA_EXIST_BIT;
    } else {
        state.fi &= !FI_DATA_EXIST;
        state.inline &= !DATA_EXIST_BIT;
    }
}

/// Copy the recovered inode body onto the live inode: mode, ownership,
/// size, timestamps, advise/flags, gc failures, project id, and the
/// inline state bits.
pub fn recover_inode(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    inode: &Arc<Inode>,
    page: &[u8],
) -> Result<()> {
    let raw = RawInode::parse(page)
        .map_err(|e| RfsError::Format(format!("ino {}: {e}", inode.ino())))?;

    inode.state().mode = raw.mode;
    recover_quota_data(sbi, quota, inode, &raw)?;

    if raw.projid_in_inode() && inode.state().projid != raw.projid {
        if let Err(err) = quota.transfer_project_quota(sbi, inode, raw.projid) {
            sbi.set_flag(SbiFlag::QuotaNeedRepair);
            warn!(
                target: "rfs::recovery",
                event = "project_transfer_failed",
                ino = inode.ino().0,
                error = %err
            );
            inode.state().projid = raw.projid;
        }
    }

    {
        let mut state = inode.state();
        state.atime = raw.atime;
        state.ctime = raw.ctime;
        state.mtime = raw.mtime;
        state.atime_nsec = raw.atime_nsec;
        state.ctime_nsec = raw.ctime_nsec;
        state.mtime_nsec = raw.mtime_nsec;
        state.advise = raw.advise;
        state.flags = raw.flags;
        state.gc_failures = raw.gc_failures;
    }
    recover_inline_flags(inode, &raw);
    i_size_write(sbi, inode, raw.size)?;

    icache.mark_dirty_sync(inode);
    flush_inode(sbi, inode)?;

    let name = if inode.has_encrypted_name() {
        "<encrypted>".to_owned()
    } else {
        String::from_utf8_lossy(&raw.name).into_owned()
    };
    info!(
        target: "rfs::recovery",
        event = "recover_inode",
        ino = inode.ino().0,
        name = %name,
        inline = raw.inline
    );
    Ok(())
}

// ── Data-index repair ───────────────────────────────────────────────────────

fn reserve_with_retry(sbi: &SbInfo, dn: &mut rfs_node::DnodeOfData) -> Result<()> {
    use std::sync::atomic::Ordering;
    let retry_forever = sbi.fault.retry_reserve_forever.load(Ordering::Relaxed);
    loop {
        match reserve_new_block(sbi, dn) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() || retry_forever => {
                backoff();
            }
            Err(RfsError::NoSpace) => {
                // The format guarantees the reservation fits; running out
                // here means the allocator and the log disagree.
                debug_assert!(false, "reservation failed during roll-forward");
                return Err(RfsError::Internal(
                    "no space reserving a recovered block".to_owned(),
                ));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Repair one node page of a tracked inode: xattrs, inline data, then
/// every data-index slot by the five-way case analysis. Returns the
/// number of indices recovered.
pub fn do_recover_data(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    inode: &Arc<Inode>,
    page: &[u8],
) -> Result<usize> {
    // Step 1: xattr.
    if is_inode(page) {
        recover_inline_xattr(sbi, inode, page)?;
    } else if has_xattr_block(ofs_of(page)) {
        recover_xattr_data(sbi, inode, page)?;
        return Ok(1);
    }

    // Step 2: inline data.
    if recover_inline_data(sbi, inode, page)? {
        return Ok(0);
    }

    // Step 3: data indices.
    let start = start_bidx_of_node(ofs_of(page), inode);
    let end = start + addrs_per_page(page);

    let mut dn = loop {
        match get_dnode_of_data(sbi, inode, start, DnodeMode::AllocNode) {
            Ok(dn) => break dn,
            Err(err) if err.is_retryable() => backoff(),
            Err(err) => return Err(err),
        }
    };
    wait_on_node_writeback(sbi, dn.node_page_addr);

    let ni = sbi
        .get_node_info(dn.nid)
        .ok_or_else(|| RfsError::Internal(format!("nid {} vanished from NAT", dn.nid)))?;
    if ni.ino != ino_of(page) {
        debug_assert!(false, "summary ino disagrees with node footer");
        let nid = dn.nid;
        put_dnode(dn);
        return Err(RfsError::Internal(format!(
            "node {} owned by ino {} but page claims {}",
            nid,
            ni.ino,
            ino_of(page)
        )));
    }

    if ofs_of(&dn.node_page) != ofs_of(page) {
        warn!(
            target: "rfs::recovery",
            event = "inconsistent_node_ofs",
            ino = inode.ino().0,
            live = ofs_of(&dn.node_page),
            recovered = ofs_of(page)
        );
        put_dnode(dn);
        return Err(RfsError::FsCorrupted(format!(
            "inconsistent node offset for ino {}",
            inode.ino()
        )));
    }

    let keep_isize = inode.test_fi(FI_KEEP_ISIZE);
    let mut recovered = 0_usize;
    let mut err: Result<()> = Ok(());

    for bidx in start..end {
        let src = dn.data_blkaddr();
        let dest = read_addr(page, usize::from(dn.ofs_in_node));

        if src.is_mapped() && !sbi.is_valid_blkaddr(src, BlkAddrCategory::MetaPor) {
            err = Err(RfsError::FsCorrupted(format!(
                "source index {src} outside the main area"
            )));
            break;
        }
        if dest.is_mapped() && !sbi.is_valid_blkaddr(dest, BlkAddrCategory::MetaPor) {
            err = Err(RfsError::FsCorrupted(format!(
                "recovered index {dest} outside the main area"
            )));
            break;
        }

        if src == dest {
            // Case (a): nothing moved.
        } else if dest.is_null() {
            // Case (b): the fsynced state dropped this block.
            truncate_data_blocks_range(sbi, &mut dn, 1)?;
        } else {
            if !keep_isize && inode.i_size() <= (bidx as u64) * BLOCK_SIZE as u64 {
                i_size_write(sbi, inode, (bidx as u64 + 1) * BLOCK_SIZE as u64)?;
            }
            if dest.is_new() {
                // Case (c): reserved but unwritten at fsync time.
                truncate_data_blocks_range(sbi, &mut dn, 1)?;
                reserve_with_retry(sbi, &mut dn)?;
            } else {
                // Cases (d)/(e): a real destination block.
                if src.is_null() {
                    reserve_with_retry(sbi, &mut dn)?;
                }
                loop {
                    match check_index_in_prev_nodes(sbi, icache, quota, dest, &mut dn) {
                        Ok(()) => break,
                        Err(e) if e.is_retryable() => backoff(),
                        Err(e) => {
                            err = Err(e);
                            break;
                        }
                    }
                }
                if err.is_err() {
                    break;
                }
                replace_block(sbi, &mut dn, src, dest, ni.version)?;
                recovered += 1;
            }
        }
        dn.ofs_in_node += 1;
    }

    if err.is_ok() {
        // Carry the chain metadata onto the live node and restore its
        // identity, clearing the fsync/dentry marks.
        dn.refresh(sbi)?;
        let mut live = dn.node_page.clone();
        copy_node_footer(&mut live, page);
        fill_node_footer(&mut live, dn.nid, ni.ino, ofs_of(page));
        sbi.meta().write_page(dn.node_page_addr, &live)?;
    }
    put_dnode(dn);

    info!(
        target: "rfs::recovery",
        event = "recover_data",
        ino = inode.ino().0,
        isize_policy = if keep_isize { "keep" } else { "recover" },
        recovered,
        ok = err.is_ok()
    );
    err.map(|()| recovered)
}

// ── Second chain walk ───────────────────────────────────────────────────────

/// Walk the chain again and repair every page whose ino is in the table.
/// Returns the total number of recovered indices.
pub fn recover_data(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    pool: &FsyncEntryPool,
    inode_list: &mut FsyncInodeTable,
    tmp_list: &mut FsyncInodeTable,
    dir_list: &mut FsyncInodeTable,
    start: BlkAddr,
) -> Result<usize> {
    let mut blkaddr = start;
    let mut ra_blocks = RECOVERY_MAX_RA_BLOCKS;
    let mut recovered = 0_usize;

    loop {
        if !sbi.is_valid_blkaddr(blkaddr, BlkAddrCategory::MetaPor) {
            break;
        }
        let page = sbi.meta().get_tmp_page(blkaddr)?.into_vec();
        if !is_recoverable(&page, sbi.cp_ver()) {
            break;
        }

        let ino = ino_of(&page);
        let tracked = inode_list.find(ino).map(|entry| {
            (
                Arc::clone(&entry.inode),
                entry.last_blkaddr,
                entry.last_dentry_blkaddr,
            )
        });
        if let Some((inode, last_blkaddr, last_dentry)) = tracked {
            // An inode page between checkpoint and the fsynced dnode may
            // carry the only copy of the latest metadata.
            if is_inode(&page) {
                recover_inode(sbi, icache, quota, &inode, &page)?;
            }
            if last_dentry == Some(blkaddr) {
                recover_dentry(sbi, icache, quota, pool, &inode, &page, dir_list)?;
            }
            recovered += do_recover_data(sbi, icache, quota, &inode, &page)?;
            if last_blkaddr == blkaddr {
                inode_list.move_to(ino, tmp_list);
            }
        }

        let next = next_blkaddr_of(&page);
        ra_blocks = adjust_ra_blocks(sbi, ra_blocks, blkaddr, next);
        blkaddr = next;
        sbi.meta().ra_pages_cond(blkaddr, ra_blocks, |a| {
            sbi.is_valid_blkaddr(a, BlkAddrCategory::MetaPor)
        });
    }

    // The next checkpoint starts every data log on a fresh segment.
    sbi.allocate_new_data_segments()?;
    Ok(recovered)
}
