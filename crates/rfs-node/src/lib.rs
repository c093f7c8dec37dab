#![forbid(unsafe_code)]
//! Node and inode layer.
//!
//! Node pages are reached through the NAT; data indices are reached
//! through `DnodeOfData` locators. All page mutation is read-modify-write
//! through the meta cache, so a locator's buffered view can always be
//! refreshed from the authoritative cached page.

pub mod inode;
pub mod quota;

pub use inode::{
    FI_DATA_EXIST, FI_DIRTY, FI_INLINE_DATA, FI_INLINE_XATTR, FI_KEEP_ISIZE, FI_PIN_FILE, Inode,
    InodeCache, InodeState,
};
pub use quota::QuotaLedger;

use rfs_error::{RfsError, Result};
use rfs_meta::{CursegType, SbInfo};
use rfs_ondisk::{
    NodeFooter, RawInode, SummaryEntry, inline_data_offset, inline_xattr_len,
    inline_xattr_offset, ino_of, is_inode, max_inline_data, read_addr, read_nid_slot, write_addr,
    write_nid_slot,
};
use rfs_types::{
    ADDRS_PER_BLOCK, BLOCK_SIZE, BlkAddr, DATA_EXIST_BIT, DEF_NIDS_PER_INODE, INLINE_DATA_BIT,
    INLINE_XATTR_BIT, INODE_OFF_INLINE, INODE_OFF_SIZE, Ino, Nid, XATTR_NODE_OFS,
};
use std::sync::Arc;
use tracing::{debug, trace};

// ── Node page access ────────────────────────────────────────────────────────

/// Fetch the node page of `nid` through the NAT.
pub fn get_node_page(sbi: &SbInfo, nid: Nid) -> Result<(BlkAddr, Vec<u8>)> {
    let info = sbi
        .get_node_info(nid)
        .ok_or_else(|| RfsError::NotFound(format!("nid {nid} not in NAT")))?;
    if !info.blkaddr.is_mapped() {
        return Err(RfsError::NotFound(format!("nid {nid} has no node block")));
    }
    let page = sbi.meta().get_page(info.blkaddr)?;
    Ok((info.blkaddr, page.into_vec()))
}

/// Allocate a fresh node block for an inode page and register it in the
/// NAT, invalidating any block the nid previously occupied.
pub fn write_new_inode(sbi: &SbInfo, ino: Ino, raw: &RawInode) -> Result<BlkAddr> {
    if let Some(info) = sbi.get_node_info(ino.nid()) {
        if info.blkaddr.is_mapped() {
            sbi.invalidate_block(info.blkaddr);
        }
    }
    let addr = sbi.alloc_block(
        CursegType::WarmNode,
        SummaryEntry {
            nid: ino.nid(),
            version: 0,
            ofs_in_node: 0,
        },
    )?;
    let mut page = vec![0_u8; BLOCK_SIZE];
    raw.write_to(&mut page);
    NodeFooter {
        nid: ino.nid(),
        ino,
        flag: 0,
        ofs: 0,
        cp_ver: sbi.cp_ver(),
        next_blkaddr: BlkAddr::NULL,
    }
    .write_to(&mut page);
    sbi.meta().write_page(addr, &page)?;
    sbi.nat().set_node_addr(ino.nid(), ino, addr, 0);
    Ok(addr)
}

/// Materialize an inode from a recovered inode page: a fresh node block
/// carrying the recovered body with empty index slots.
pub fn recover_inode_page(sbi: &SbInfo, page: &[u8]) -> Result<()> {
    let ino = ino_of(page);
    let raw =
        RawInode::parse(page).map_err(|e| RfsError::Format(format!("ino {ino}: {e}")))?;
    let addr = write_new_inode(sbi, ino, &raw)?;
    debug!(target: "rfs::node", event = "recover_inode_page", ino = ino.0, blkaddr = addr.0);
    Ok(())
}

/// The named suspension point before mutating a node page that block I/O
/// may still reference. Writes are synchronous in this cache model.
pub fn wait_on_node_writeback(_sbi: &SbInfo, addr: BlkAddr) {
    trace!(target: "rfs::node", event = "wait_writeback", blkaddr = addr.0);
}

// ── Dnode locator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnodeMode {
    /// Create missing index paths.
    AllocNode,
    /// Locate only; absence is `NotFound`.
    LookupNode,
}

/// Scoped cursor addressing one data-index slot of an inode.
pub struct DnodeOfData {
    pub inode: Arc<Inode>,
    pub inode_page_addr: BlkAddr,
    /// Whether this locator currently holds the inode page lock (true
    /// exactly when the dnode is the inode page itself).
    pub inode_page_locked: bool,
    pub nid: Nid,
    pub node_ofs: u32,
    pub node_page_addr: BlkAddr,
    pub node_page: Vec<u8>,
    pub ofs_in_node: u16,
}

impl DnodeOfData {
    /// Current on-disk address stored at the cursor.
    #[must_use]
    pub fn data_blkaddr(&self) -> BlkAddr {
        read_addr(&self.node_page, usize::from(self.ofs_in_node))
    }

    /// Refresh the buffered node page from the cache.
    pub fn refresh(&mut self, sbi: &SbInfo) -> Result<()> {
        self.node_page = sbi.meta().get_page(self.node_page_addr)?.into_vec();
        Ok(())
    }

    /// Write one index slot through the cache and keep the buffered view
    /// in sync.
    pub fn set_data_blkaddr(&mut self, sbi: &SbInfo, addr: BlkAddr) -> Result<()> {
        let mut page = sbi.meta().get_page(self.node_page_addr)?.into_vec();
        write_addr(&mut page, usize::from(self.ofs_in_node), addr);
        sbi.meta().write_page(self.node_page_addr, &page)?;
        self.node_page = page;
        Ok(())
    }
}

/// Data index where a node page's coverage begins.
#[must_use]
pub fn start_bidx_of_node(node_ofs: u32, inode: &Arc<Inode>) -> usize {
    debug_assert_ne!(node_ofs, XATTR_NODE_OFS);
    if node_ofs == 0 {
        return 0;
    }
    inode.addrs_per_inode() + (node_ofs as usize - 1) * ADDRS_PER_BLOCK
}

/// Whether a node offset names an inode's dedicated xattr block.
#[must_use]
pub fn has_xattr_block(node_ofs: u32) -> bool {
    node_ofs == XATTR_NODE_OFS
}

/// Acquire a dnode locator for data index `bidx`.
pub fn get_dnode_of_data(
    sbi: &SbInfo,
    inode: &Arc<Inode>,
    bidx: usize,
    mode: DnodeMode,
) -> Result<DnodeOfData> {
    let ino = inode.ino();
    let (ipage_addr, mut ipage) = get_node_page(sbi, ino.nid())?;
    let api = inode.addrs_per_inode();

    if bidx < api {
        return Ok(DnodeOfData {
            inode: Arc::clone(inode),
            inode_page_addr: ipage_addr,
            inode_page_locked: true,
            nid: ino.nid(),
            node_ofs: 0,
            node_page_addr: ipage_addr,
            node_page: ipage,
            ofs_in_node: bidx as u16,
        });
    }

    let rel = bidx - api;
    let k = rel / ADDRS_PER_BLOCK;
    if k >= DEF_NIDS_PER_INODE {
        return Err(RfsError::NotFound(format!(
            "data index {bidx} beyond the node tree of ino {ino}"
        )));
    }
    let ofs_in_node = (rel % ADDRS_PER_BLOCK) as u16;
    let node_ofs = k as u32 + 1;

    let mut nid = read_nid_slot(&ipage, k);
    if nid.0 == 0 {
        if mode == DnodeMode::LookupNode {
            return Err(RfsError::NotFound(format!(
                "ino {ino} has no dnode at offset {node_ofs}"
            )));
        }
        if sbi.fault.should_fail_alloc() {
            return Err(RfsError::OutOfMemory);
        }
        nid = sbi.nat().alloc_nid();
        let addr = sbi.alloc_block(
            CursegType::WarmNode,
            SummaryEntry {
                nid,
                version: 0,
                ofs_in_node: 0,
            },
        )?;
        let mut page = vec![0_u8; BLOCK_SIZE];
        NodeFooter {
            nid,
            ino,
            flag: 0,
            ofs: node_ofs,
            cp_ver: sbi.cp_ver(),
            next_blkaddr: BlkAddr::NULL,
        }
        .write_to(&mut page);
        sbi.meta().write_page(addr, &page)?;
        sbi.nat().set_node_addr(nid, ino, addr, 0);

        write_nid_slot(&mut ipage, k, nid);
        sbi.meta().write_page(ipage_addr, &ipage)?;
        debug!(
            target: "rfs::node",
            event = "dnode_alloc",
            ino = ino.0,
            nid = nid.0,
            node_ofs,
            blkaddr = addr.0
        );
    }

    let (node_page_addr, node_page) = get_node_page(sbi, nid)?;
    Ok(DnodeOfData {
        inode: Arc::clone(inode),
        inode_page_addr: ipage_addr,
        inode_page_locked: false,
        nid,
        node_ofs,
        node_page_addr,
        node_page,
        ofs_in_node,
    })
}

/// Release a locator. Page references release with the buffers; the
/// explicit call keeps locator scopes visible at call sites.
pub fn put_dnode(dn: DnodeOfData) {
    drop(dn);
}

// ── Index maintenance ───────────────────────────────────────────────────────

/// Invalidate `count` data indices starting at the cursor.
pub fn truncate_data_blocks_range(
    sbi: &SbInfo,
    dn: &mut DnodeOfData,
    count: usize,
) -> Result<()> {
    let mut page = sbi.meta().get_page(dn.node_page_addr)?.into_vec();
    for i in 0..count {
        let idx = usize::from(dn.ofs_in_node) + i;
        let addr = read_addr(&page, idx);
        if addr.is_mapped() {
            sbi.invalidate_block(addr);
        } else if addr.is_new() {
            sbi.dec_valid_block_count(1);
        }
        write_addr(&mut page, idx, BlkAddr::NULL);
    }
    sbi.meta().write_page(dn.node_page_addr, &page)?;
    dn.node_page = page;
    Ok(())
}

/// Reserve an unwritten block at the cursor (`NEW_ADDR`).
///
/// The slot must be unallocated. Exhaustion surfaces as `NoSpace`, which
/// roll-forward treats as an invariant violation; transient failures are
/// injected only by the fault policy.
pub fn reserve_new_block(sbi: &SbInfo, dn: &mut DnodeOfData) -> Result<()> {
    if sbi.fault.should_fail_alloc() {
        return Err(RfsError::OutOfMemory);
    }
    debug_assert!(dn.data_blkaddr().is_null());
    sbi.inc_valid_block_count(1)?;
    dn.set_data_blkaddr(sbi, BlkAddr::NEW)
}

/// Redirect the cursor's index from `src` to `dest`, updating segment
/// validity and the summary reverse map.
pub fn replace_block(
    sbi: &SbInfo,
    dn: &mut DnodeOfData,
    src: BlkAddr,
    dest: BlkAddr,
    version: u8,
) -> Result<()> {
    dn.refresh(sbi)?;
    let cur = dn.data_blkaddr();
    if cur.is_new() {
        sbi.dec_valid_block_count(1);
    }
    if src.is_mapped() {
        sbi.invalidate_block(src);
    }
    sbi.mark_block_valid(dest);
    dn.set_data_blkaddr(sbi, dest)?;
    sbi.set_summary(
        dest,
        SummaryEntry {
            nid: dn.nid,
            version,
            ofs_in_node: dn.ofs_in_node,
        },
    )?;
    Ok(())
}

// ── Node footers during repair ──────────────────────────────────────────────

/// Copy the whole footer (version, chain pointer, marks) from a
/// recovered page onto a live node page buffer.
pub fn copy_node_footer(dst: &mut [u8], src: &[u8]) {
    let f = rfs_types::NODE_FOOTER_OFFSET;
    dst[f..].copy_from_slice(&src[f..]);
}

/// Rewrite a node page's identity after a footer copy, clearing the
/// fsync and dentry marks.
pub fn fill_node_footer(page: &mut [u8], nid: Nid, ino: Ino, ofs: u32) {
    let mut footer = NodeFooter::parse(page).unwrap_or(NodeFooter {
        nid,
        ino,
        flag: 0,
        ofs,
        cp_ver: rfs_types::CpVer(0),
        next_blkaddr: BlkAddr::NULL,
    });
    footer.nid = nid;
    footer.ino = ino;
    footer.ofs = ofs;
    footer.flag &= !(rfs_types::FSYNC_BIT | rfs_types::DENTRY_BIT);
    footer.write_to(page);
}

// ── Inode metadata write-back ───────────────────────────────────────────────

/// Grow the file size, writing it through to the inode page.
pub fn i_size_write(sbi: &SbInfo, inode: &Arc<Inode>, size: u64) -> Result<()> {
    inode.state().size = size;
    let (addr, mut page) = get_node_page(sbi, inode.ino().nid())?;
    page[INODE_OFF_SIZE..INODE_OFF_SIZE + 8].copy_from_slice(&size.to_le_bytes());
    sbi.meta().write_page(addr, &page)?;
    Ok(())
}

/// Write the inode's in-memory metadata back onto its inode page,
/// preserving the name, index slots, and nid table.
pub fn flush_inode(sbi: &SbInfo, inode: &Arc<Inode>) -> Result<()> {
    let ino = inode.ino();
    let (addr, mut page) = get_node_page(sbi, ino.nid())?;
    let mut raw = RawInode::parse(&page)
        .map_err(|e| RfsError::Format(format!("ino {ino}: {e}")))?;
    {
        let state = inode.state();
        raw.mode = state.mode;
        raw.advise = state.advise;
        raw.inline = state.inline;
        raw.uid = state.uid;
        raw.gid = state.gid;
        raw.links = state.links;
        raw.size = state.size;
        raw.blocks = state.blocks;
        raw.atime = state.atime;
        raw.ctime = state.ctime;
        raw.mtime = state.mtime;
        raw.atime_nsec = state.atime_nsec;
        raw.ctime_nsec = state.ctime_nsec;
        raw.mtime_nsec = state.mtime_nsec;
        raw.generation = state.generation;
        raw.flags = state.flags;
        raw.pino = state.pino;
        raw.projid = state.projid;
        raw.gc_failures = state.gc_failures;
    }
    raw.write_to(&mut page);
    sbi.meta().write_page(addr, &page)?;
    inode.clear_fi(FI_DIRTY);
    Ok(())
}

// ── Xattr and inline-data recovery ──────────────────────────────────────────

/// Carry the inline xattr region of a recovered inode page onto the live
/// inode page.
pub fn recover_inline_xattr(sbi: &SbInfo, inode: &Arc<Inode>, page: &[u8]) -> Result<()> {
    debug_assert!(is_inode(page));
    let (addr, mut ipage) = get_node_page(sbi, inode.ino().nid())?;
    let off = inline_xattr_offset();
    let len = inline_xattr_len();
    if page[INODE_OFF_INLINE] & INLINE_XATTR_BIT != 0 {
        ipage[off..off + len].copy_from_slice(&page[off..off + len]);
        ipage[INODE_OFF_INLINE] |= INLINE_XATTR_BIT;
        inode.state().inline |= INLINE_XATTR_BIT;
        inode.set_fi(FI_INLINE_XATTR);
    } else {
        ipage[off..off + len].fill(0);
        ipage[INODE_OFF_INLINE] &= !INLINE_XATTR_BIT;
        inode.state().inline &= !INLINE_XATTR_BIT;
        inode.clear_fi(FI_INLINE_XATTR);
    }
    sbi.meta().write_page(addr, &ipage)
}

/// Replace the inode's dedicated xattr node with a recovered one.
pub fn recover_xattr_data(sbi: &SbInfo, inode: &Arc<Inode>, page: &[u8]) -> Result<()> {
    let ino = inode.ino();
    let (ipage_addr, mut ipage) = get_node_page(sbi, ino.nid())?;
    let old_raw = RawInode::parse(&ipage)
        .map_err(|e| RfsError::Format(format!("ino {ino}: {e}")))?;

    let xnid = if old_raw.xattr_nid != 0 {
        let xnid = Nid(old_raw.xattr_nid);
        if let Some(info) = sbi.get_node_info(xnid) {
            if info.blkaddr.is_mapped() {
                sbi.invalidate_block(info.blkaddr);
            }
        }
        xnid
    } else {
        sbi.nat().alloc_nid()
    };

    let addr = sbi.alloc_block(
        CursegType::WarmNode,
        SummaryEntry {
            nid: xnid,
            version: 0,
            ofs_in_node: 0,
        },
    )?;
    let mut new_page = page.to_vec();
    NodeFooter {
        nid: xnid,
        ino,
        flag: 0,
        ofs: XATTR_NODE_OFS,
        cp_ver: sbi.cp_ver(),
        next_blkaddr: BlkAddr::NULL,
    }
    .write_to(&mut new_page);
    sbi.meta().write_page(addr, &new_page)?;
    sbi.nat().set_node_addr(xnid, ino, addr, 0);

    if old_raw.xattr_nid != xnid.0 {
        let off = rfs_types::INODE_OFF_XATTR_NID;
        ipage[off..off + 4].copy_from_slice(&xnid.0.to_le_bytes());
        sbi.meta().write_page(ipage_addr, &ipage)?;
    }
    debug!(target: "rfs::node", event = "recover_xattr", ino = ino.0, xnid = xnid.0);
    Ok(())
}

/// Recover inline file data from a recovered inode page.
///
/// Returns `true` when the page carried inline data and the inode is
/// fully handled (no index recovery needed).
pub fn recover_inline_data(sbi: &SbInfo, inode: &Arc<Inode>, page: &[u8]) -> Result<bool> {
    let page_has_inline =
        is_inode(page) && page[INODE_OFF_INLINE] & INLINE_DATA_BIT != 0;
    let off = inline_data_offset();
    let len = max_inline_data();

    if page_has_inline {
        let (addr, mut ipage) = get_node_page(sbi, inode.ino().nid())?;
        ipage[off..off + len].copy_from_slice(&page[off..off + len]);
        ipage[INODE_OFF_INLINE] |= INLINE_DATA_BIT;
        inode.state().inline |= INLINE_DATA_BIT;
        inode.set_fi(FI_INLINE_DATA);
        if page[INODE_OFF_INLINE] & DATA_EXIST_BIT != 0 {
            ipage[INODE_OFF_INLINE] |= DATA_EXIST_BIT;
            inode.state().inline |= DATA_EXIST_BIT;
            inode.set_fi(FI_DATA_EXIST);
        } else {
            ipage[INODE_OFF_INLINE] &= !DATA_EXIST_BIT;
            inode.state().inline &= !DATA_EXIST_BIT;
            inode.clear_fi(FI_DATA_EXIST);
        }
        sbi.meta().write_page(addr, &ipage)?;
        return Ok(true);
    }

    if inode.test_fi(FI_INLINE_DATA) {
        // The fsynced state abandoned inline data; drop it before
        // recovering block indices.
        let (addr, mut ipage) = get_node_page(sbi, inode.ino().nid())?;
        ipage[off..off + len].fill(0);
        ipage[INODE_OFF_INLINE] &= !(INLINE_DATA_BIT | DATA_EXIST_BIT);
        inode.state().inline &= !(INLINE_DATA_BIT | DATA_EXIST_BIT);
        inode.clear_fi(FI_INLINE_DATA | FI_DATA_EXIST);
        sbi.meta().write_page(addr, &ipage)?;
    }
    Ok(false)
}

// ── Tests ───────────────────────────────────────────────────────────────────
