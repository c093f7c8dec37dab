//! Collision resolver.
//!
//! Before a logical index is redirected to a recovered destination
//! block, any older index still pointing at that block must be detached,
//! or two files would share one physical block.

use rfs_error::{RfsError, Result};
use rfs_meta::SbInfo;
use rfs_node::{
    DnodeMode, DnodeOfData, InodeCache, QuotaLedger, get_dnode_of_data, get_node_page, put_dnode,
    start_bidx_of_node, truncate_data_blocks_range,
};
use rfs_ondisk::{ino_of, ofs_of, read_summary};
use rfs_types::BlkAddr;
use std::sync::Arc;
use tracing::trace;

/// Locate and drop any pre-existing index of `dest` in an earlier node.
///
/// `dn` is the locator about to be redirected; the lock-order rule is
/// that its inode-page lock is released while a foreign inode's pages
/// are visited, then retaken (the buffered view is refreshed as the
/// model's equivalent).
pub fn check_index_in_prev_nodes(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    dest: BlkAddr,
    dn: &mut DnodeOfData,
) -> Result<()> {
    let geo = sbi.geometry();
    let segno = geo.segno_of(dest);
    let blkoff = geo.blkoff_of(dest);

    // Not valid in the current bitmap: nothing indexes it.
    if !sbi.get_seg_entry(segno).is_valid(blkoff) {
        return Ok(());
    }

    // Previous summary: from a data curseg in memory, else from the SSA.
    let sum = match sbi.curseg_sum_entry(segno, blkoff) {
        Some(sum) => sum,
        None => {
            let page = sbi.get_sum_page(segno)?;
            read_summary(page.as_slice(), usize::from(blkoff))
                .map_err(|e| RfsError::Format(e.to_string()))?
        }
    };
    let nid = sum.nid;

    // Fast path: the old index lives in the dnode already held.
    if nid == dn.nid {
        let saved = dn.ofs_in_node;
        dn.ofs_in_node = sum.ofs_in_node;
        if dn.data_blkaddr() == dest {
            truncate_data_blocks_range(sbi, dn, 1)?;
        }
        dn.ofs_in_node = saved;
        trace!(target: "rfs::recovery", event = "collision_same_dnode", dest = dest.0);
        return Ok(());
    }

    // Fast path: the old index lives in the current inode's inode page.
    if nid.0 == dn.inode.ino().0 {
        let (ipage_addr, ipage) = get_node_page(sbi, nid)?;
        let mut tdn = DnodeOfData {
            inode: Arc::clone(&dn.inode),
            inode_page_addr: ipage_addr,
            inode_page_locked: true,
            nid,
            node_ofs: 0,
            node_page_addr: ipage_addr,
            node_page: ipage,
            ofs_in_node: sum.ofs_in_node,
        };
        if tdn.data_blkaddr() == dest {
            truncate_data_blocks_range(sbi, &mut tdn, 1)?;
        }
        put_dnode(tdn);
        trace!(target: "rfs::recovery", event = "collision_own_inode", dest = dest.0);
        return Ok(());
    }

    // Slow path: walk to the owning node.
    let (_, npage) = get_node_page(sbi, nid)?;
    let offset = ofs_of(&npage);
    let ino = ino_of(&npage);
    drop(npage);

    let (inode, foreign) = if ino.0 != dn.inode.ino().0 {
        let inode = icache.iget_retry(sbi, ino)?;
        if let Err(err) = quota.dquot_initialize(sbi, &inode) {
            icache.iput(inode);
            return Err(err);
        }
        (inode, true)
    } else {
        (Arc::clone(&dn.inode), false)
    };

    let bidx = start_bidx_of_node(offset, &inode) + usize::from(sum.ofs_in_node);

    // Lock order is current-inode-page < foreign-inode-page: release the
    // held inode-page lock before reaching into the other tree; the
    // reference stays alive.
    let relock = dn.inode_page_locked;
    if relock {
        dn.inode_page_locked = false;
    }

    let walk = (|| -> Result<()> {
        match get_dnode_of_data(sbi, &inode, bidx, DnodeMode::LookupNode) {
            Ok(mut tdn) => {
                if tdn.data_blkaddr() == dest {
                    truncate_data_blocks_range(sbi, &mut tdn, 1)?;
                }
                put_dnode(tdn);
                Ok(())
            }
            // The index path is gone; nothing to detach.
            Err(RfsError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    })();

    if relock {
        dn.inode_page_locked = true;
    }
    // The walk may have rewritten a page this locator buffers.
    dn.refresh(sbi)?;

    if foreign {
        icache.iput(inode);
    }
    trace!(
        target: "rfs::recovery",
        event = "collision_resolved",
        dest = dest.0,
        owner_nid = nid.0,
        foreign
    );
    walk
}
