//! Node page layout: footer, raw inode, and address-slot access.
//!
//! A node page is one block carrying either an inode body or a direct
//! index node, with a footer in the last `NODE_FOOTER_LEN` bytes. All
//! callers hand in full `BLOCK_SIZE` buffers.

use rfs_types::{
    ADDRS_PER_BLOCK, BLOCK_SIZE, BlkAddr, CpVer, DEF_ADDRS_PER_INODE, DEF_NIDS_PER_INODE,
    DENTRY_BIT, FSYNC_BIT, INLINE_XATTR_ADDRS, INLINE_XATTR_BIT, INODE_OFF_ADDR, INODE_OFF_ADVISE,
    INODE_OFF_ATIME, INODE_OFF_ATIME_NSEC, INODE_OFF_BLOCKS, INODE_OFF_CTIME,
    INODE_OFF_CTIME_NSEC, INODE_OFF_EXTRA_ISIZE, INODE_OFF_FLAGS, INODE_OFF_GC_FAILURES,
    INODE_OFF_GENERATION, INODE_OFF_GID, INODE_OFF_INLINE, INODE_OFF_LINKS, INODE_OFF_MODE,
    INODE_OFF_MTIME, INODE_OFF_MTIME_NSEC, INODE_OFF_NAME, INODE_OFF_NAMELEN, INODE_OFF_NID,
    INODE_OFF_PINO, INODE_OFF_PROJID, INODE_OFF_SIZE, INODE_OFF_UID, INODE_OFF_XATTR_NID, Ino,
    MAX_EXTRA_ISIZE, MAX_NAME_LEN, NODE_FOOTER_OFFSET, Nid, ParseError, RAW_NAME_LEN,
    read_le_u16, read_le_u32, read_le_u64,
};

// ── Footer ──────────────────────────────────────────────────────────────────

/// Decoded node-block footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFooter {
    pub nid: Nid,
    pub ino: Ino,
    pub flag: u32,
    pub ofs: u32,
    pub cp_ver: CpVer,
    pub next_blkaddr: BlkAddr,
}

impl NodeFooter {
    pub fn parse(page: &[u8]) -> Result<Self, ParseError> {
        let f = NODE_FOOTER_OFFSET;
        Ok(Self {
            nid: Nid(read_le_u32(page, f)?),
            ino: Ino(read_le_u32(page, f + 4)?),
            flag: read_le_u32(page, f + 8)?,
            ofs: read_le_u32(page, f + 12)?,
            cp_ver: CpVer(read_le_u64(page, f + 16)?),
            next_blkaddr: BlkAddr(read_le_u32(page, f + 24)?),
        })
    }

    pub fn write_to(&self, page: &mut [u8]) {
        debug_assert_eq!(page.len(), BLOCK_SIZE);
        let f = NODE_FOOTER_OFFSET;
        page[f..f + 4].copy_from_slice(&self.nid.0.to_le_bytes());
        page[f + 4..f + 8].copy_from_slice(&self.ino.0.to_le_bytes());
        page[f + 8..f + 12].copy_from_slice(&self.flag.to_le_bytes());
        page[f + 12..f + 16].copy_from_slice(&self.ofs.to_le_bytes());
        page[f + 16..f + 24].copy_from_slice(&self.cp_ver.0.to_le_bytes());
        page[f + 24..f + 28].copy_from_slice(&self.next_blkaddr.0.to_le_bytes());
    }

    #[must_use]
    pub fn is_fsync(&self) -> bool {
        self.flag & FSYNC_BIT != 0
    }

    #[must_use]
    pub fn is_dentry(&self) -> bool {
        self.flag & DENTRY_BIT != 0
    }
}

fn footer_u32(page: &[u8], rel: usize) -> u32 {
    debug_assert_eq!(page.len(), BLOCK_SIZE);
    let off = NODE_FOOTER_OFFSET + rel;
    u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}

#[must_use]
pub fn nid_of(page: &[u8]) -> Nid {
    Nid(footer_u32(page, 0))
}

#[must_use]
pub fn ino_of(page: &[u8]) -> Ino {
    Ino(footer_u32(page, 4))
}

#[must_use]
pub fn ofs_of(page: &[u8]) -> u32 {
    footer_u32(page, 12)
}

#[must_use]
pub fn next_blkaddr_of(page: &[u8]) -> BlkAddr {
    BlkAddr(footer_u32(page, 24))
}

/// An inode page carries its inode body under its own nid.
#[must_use]
pub fn is_inode(page: &[u8]) -> bool {
    nid_of(page).0 == ino_of(page).0
}

#[must_use]
pub fn is_fsync_dnode(page: &[u8]) -> bool {
    footer_u32(page, 8) & FSYNC_BIT != 0
}

#[must_use]
pub fn is_dent_dnode(page: &[u8]) -> bool {
    footer_u32(page, 8) & DENTRY_BIT != 0
}

/// A node page belongs to the post-checkpoint log iff its footer carries
/// the just-mounted checkpoint version.
#[must_use]
pub fn is_recoverable(page: &[u8], current: CpVer) -> bool {
    let off = NODE_FOOTER_OFFSET + 16;
    let ver = u64::from_le_bytes([
        page[off],
        page[off + 1],
        page[off + 2],
        page[off + 3],
        page[off + 4],
        page[off + 5],
        page[off + 6],
        page[off + 7],
    ]);
    ver == current.0
}

// ── Raw inode ───────────────────────────────────────────────────────────────

/// Decoded inode body of an inode page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawInode {
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
    pub namelen: u32,
    pub name: Vec<u8>,
    pub extra_isize: u16,
    pub gc_failures: u16,
    pub projid: u32,
    pub xattr_nid: u32,
}

impl RawInode {
    pub fn parse(page: &[u8]) -> Result<Self, ParseError> {
        let namelen = read_le_u32(page, INODE_OFF_NAMELEN)?;
        if namelen as usize > MAX_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "i_namelen",
                reason: "exceeds maximum name length",
            });
        }
        let extra_isize = read_le_u16(page, INODE_OFF_EXTRA_ISIZE)?;
        if extra_isize > MAX_EXTRA_ISIZE {
            return Err(ParseError::InvalidField {
                field: "i_extra_isize",
                reason: "extra area out of range",
            });
        }

        let name_start = INODE_OFF_NAME;
        let name = page[name_start..name_start + namelen as usize].to_vec();

        Ok(Self {
            mode: read_le_u16(page, INODE_OFF_MODE)?,
            advise: page[INODE_OFF_ADVISE],
            inline: page[INODE_OFF_INLINE],
            uid: read_le_u32(page, INODE_OFF_UID)?,
            gid: read_le_u32(page, INODE_OFF_GID)?,
            links: read_le_u32(page, INODE_OFF_LINKS)?,
            size: read_le_u64(page, INODE_OFF_SIZE)?,
            blocks: read_le_u64(page, INODE_OFF_BLOCKS)?,
            atime: read_le_u64(page, INODE_OFF_ATIME)?,
            ctime: read_le_u64(page, INODE_OFF_CTIME)?,
            mtime: read_le_u64(page, INODE_OFF_MTIME)?,
            atime_nsec: read_le_u32(page, INODE_OFF_ATIME_NSEC)?,
            ctime_nsec: read_le_u32(page, INODE_OFF_CTIME_NSEC)?,
            mtime_nsec: read_le_u32(page, INODE_OFF_MTIME_NSEC)?,
            generation: read_le_u32(page, INODE_OFF_GENERATION)?,
            flags: read_le_u32(page, INODE_OFF_FLAGS)?,
            pino: read_le_u32(page, INODE_OFF_PINO)?,
            namelen,
            name,
            extra_isize,
            gc_failures: read_le_u16(page, INODE_OFF_GC_FAILURES)?,
            projid: read_le_u32(page, INODE_OFF_PROJID)?,
            xattr_nid: read_le_u32(page, INODE_OFF_XATTR_NID)?,
        })
    }

    /// Serialize the inode body into an inode page. Address and nid slots
    /// are left untouched.
    pub fn write_to(&self, page: &mut [u8]) {
        debug_assert_eq!(page.len(), BLOCK_SIZE);
        debug_assert!(self.name.len() <= MAX_NAME_LEN);
        page[INODE_OFF_MODE..INODE_OFF_MODE + 2].copy_from_slice(&self.mode.to_le_bytes());
        page[INODE_OFF_ADVISE] = self.advise;
        page[INODE_OFF_INLINE] = self.inline;
        page[INODE_OFF_UID..INODE_OFF_UID + 4].copy_from_slice(&self.uid.to_le_bytes());
        page[INODE_OFF_GID..INODE_OFF_GID + 4].copy_from_slice(&self.gid.to_le_bytes());
        page[INODE_OFF_LINKS..INODE_OFF_LINKS + 4].copy_from_slice(&self.links.to_le_bytes());
        page[INODE_OFF_SIZE..INODE_OFF_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
        page[INODE_OFF_BLOCKS..INODE_OFF_BLOCKS + 8].copy_from_slice(&self.blocks.to_le_bytes());
        page[INODE_OFF_ATIME..INODE_OFF_ATIME + 8].copy_from_slice(&self.atime.to_le_bytes());
        page[INODE_OFF_CTIME..INODE_OFF_CTIME + 8].copy_from_slice(&self.ctime.to_le_bytes());
        page[INODE_OFF_MTIME..INODE_OFF_MTIME + 8].copy_from_slice(&self.mtime.to_le_bytes());
        page[INODE_OFF_ATIME_NSEC..INODE_OFF_ATIME_NSEC + 4]
            .copy_from_slice(&self.atime_nsec.to_le_bytes());
        page[INODE_OFF_CTIME_NSEC..INODE_OFF_CTIME_NSEC + 4]
            .copy_from_slice(&self.ctime_nsec.to_le_bytes());
        page[INODE_OFF_MTIME_NSEC..INODE_OFF_MTIME_NSEC + 4]
            .copy_from_slice(&self.mtime_nsec.to_le_bytes());
        page[INODE_OFF_GENERATION..INODE_OFF_GENERATION + 4]
            .copy_from_slice(&self.generation.to_le_bytes());
        page[INODE_OFF_FLAGS..INODE_OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        page[INODE_OFF_PINO..INODE_OFF_PINO + 4].copy_from_slice(&self.pino.to_le_bytes());
        page[INODE_OFF_NAMELEN..INODE_OFF_NAMELEN + 4]
            .copy_from_slice(&self.namelen.to_le_bytes());
        page[INODE_OFF_NAME..INODE_OFF_NAME + RAW_NAME_LEN].fill(0);
        page[INODE_OFF_NAME..INODE_OFF_NAME + self.name.len()].copy_from_slice(&self.name);
        page[INODE_OFF_EXTRA_ISIZE..INODE_OFF_EXTRA_ISIZE + 2]
            .copy_from_slice(&self.extra_isize.to_le_bytes());
        page[INODE_OFF_GC_FAILURES..INODE_OFF_GC_FAILURES + 2]
            .copy_from_slice(&self.gc_failures.to_le_bytes());
        page[INODE_OFF_PROJID..INODE_OFF_PROJID + 4].copy_from_slice(&self.projid.to_le_bytes());
        page[INODE_OFF_XATTR_NID..INODE_OFF_XATTR_NID + 4]
            .copy_from_slice(&self.xattr_nid.to_le_bytes());
    }

    #[must_use]
    pub fn has_inline(&self, bit: u8) -> bool {
        self.inline & bit != 0
    }

    /// True when the extra-attribute area is present and wide enough to
    /// contain the project id.
    #[must_use]
    pub fn projid_in_inode(&self) -> bool {
        const NEEDED: u16 = (INODE_OFF_PROJID + 4 - INODE_OFF_EXTRA_ISIZE) as u16;
        self.inline & rfs_types::EXTRA_ATTR_BIT != 0 && self.extra_isize >= NEEDED
    }

    #[must_use]
    pub fn has_inline_xattr(&self) -> bool {
        self.has_inline(INLINE_XATTR_BIT)
    }
}

/// Dentry hash stored right after the name for encrypted+casefolded
/// parents; the field is unaligned by construction.
pub fn stored_name_hash(page: &[u8], namelen: usize) -> Result<u32, ParseError> {
    if namelen + 4 > RAW_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "i_name",
            reason: "no room for stored hash after name",
        });
    }
    read_le_u32(page, INODE_OFF_NAME + namelen)
}

// ── Address and nid slots ───────────────────────────────────────────────────

/// Data-index slots available in an inode page given its inline layout.
#[must_use]
pub fn addrs_per_inode(inline: u8) -> usize {
    if inline & INLINE_XATTR_BIT != 0 {
        DEF_ADDRS_PER_INODE - INLINE_XATTR_ADDRS
    } else {
        DEF_ADDRS_PER_INODE
    }
}

/// Data-index slots this node page covers.
#[must_use]
pub fn addrs_per_page(page: &[u8]) -> usize {
    if is_inode(page) {
        addrs_per_inode(page[INODE_OFF_INLINE])
    } else {
        ADDRS_PER_BLOCK
    }
}

fn addr_slot_offset(inode_page: bool, idx: usize) -> usize {
    if inode_page {
        debug_assert!(idx < DEF_ADDRS_PER_INODE);
        INODE_OFF_ADDR + idx * 4
    } else {
        debug_assert!(idx < ADDRS_PER_BLOCK);
        idx * 4
    }
}

/// Read data-index slot `idx` of a node page.
#[must_use]
pub fn read_addr(page: &[u8], idx: usize) -> BlkAddr {
    let off = addr_slot_offset(is_inode(page), idx);
    BlkAddr(u32::from_le_bytes([
        page[off],
        page[off + 1],
        page[off + 2],
        page[off + 3],
    ]))
}

/// Write data-index slot `idx` of a node page.
pub fn write_addr(page: &mut [u8], idx: usize, addr: BlkAddr) {
    let off = addr_slot_offset(is_inode(page), idx);
    page[off..off + 4].copy_from_slice(&addr.0.to_le_bytes());
}

/// Read direct-node slot `k` of an inode page's nid table.
#[must_use]
pub fn read_nid_slot(page: &[u8], k: usize) -> Nid {
    debug_assert!(k < DEF_NIDS_PER_INODE);
    let off = INODE_OFF_NID + k * 4;
    Nid(u32::from_le_bytes([
        page[off],
        page[off + 1],
        page[off + 2],
        page[off + 3],
    ]))
}

/// Write direct-node slot `k` of an inode page's nid table.
pub fn write_nid_slot(page: &mut [u8], k: usize, nid: Nid) {
    debug_assert!(k < DEF_NIDS_PER_INODE);
    let off = INODE_OFF_NID + k * 4;
    page[off..off + 4].copy_from_slice(&nid.0.to_le_bytes());
}

// ── Inline regions ──────────────────────────────────────────────────────────

/// Byte offset of the inline data region (address slots from index 1).
#[must_use]
pub fn inline_data_offset() -> usize {
    INODE_OFF_ADDR + 4
}

/// Maximum inline data payload, leaving the inline-xattr tail free.
#[must_use]
pub fn max_inline_data() -> usize {
    (DEF_ADDRS_PER_INODE - INLINE_XATTR_ADDRS - 1) * 4
}

/// Byte offset of the inline xattr region (the last `INLINE_XATTR_ADDRS`
/// address slots).
#[must_use]
pub fn inline_xattr_offset() -> usize {
    INODE_OFF_ADDR + (DEF_ADDRS_PER_INODE - INLINE_XATTR_ADDRS) * 4
}

/// Byte length of the inline xattr region.
#[must_use]
pub fn inline_xattr_len() -> usize {
    INLINE_XATTR_ADDRS * 4
}
