#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed block size of the filesystem, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the node-block footer, placed in the last bytes of every node page.
pub const NODE_FOOTER_LEN: usize = 28;
/// Byte offset of the node footer within a node page.
pub const NODE_FOOTER_OFFSET: usize = BLOCK_SIZE - NODE_FOOTER_LEN;

/// Maximum filename length stored in a raw inode or a dentry slot.
pub const MAX_NAME_LEN: usize = 255;

/// Bytes reserved for the on-disk name field of a raw inode.
///
/// Leaves room for the 255-byte name plus the trailing u32 hash that
/// encrypted+casefolded directories store immediately after the name.
pub const RAW_NAME_LEN: usize = 260;

/// Number of address slots in an inode page (`i_addr`).
pub const DEF_ADDRS_PER_INODE: usize = 923;
/// Address slots consumed by the inline xattr region when `INLINE_XATTR` is set.
pub const INLINE_XATTR_ADDRS: usize = 50;
/// Number of address slots in a direct node page.
pub const ADDRS_PER_BLOCK: usize = 1017;
/// Number of direct-node id slots in an inode page (`i_nid`).
pub const DEF_NIDS_PER_INODE: usize = 5;

/// Size of one packed summary entry: `{nid u32, version u8, ofs_in_node u16}`.
pub const SUMMARY_ENTRY_LEN: usize = 7;

/// Dentry slots per directory data block.
pub const DENTRIES_PER_BLOCK: usize = 15;
/// Size of one dentry slot: `{hash u32, ino u32, namelen u16, ftype u8, name[255]}`.
pub const DENTRY_SLOT_LEN: usize = 266;
/// Bytes of the live-slot bitmap at the head of a dentry block.
pub const DENTRY_BITMAP_LEN: usize = 2;

/// Node offset value marking an inode's dedicated xattr node.
pub const XATTR_NODE_OFS: u32 = 0xFFFF_FFFE;

// ── Raw inode field offsets ─────────────────────────────────────────────────

pub const INODE_OFF_MODE: usize = 0x00;
pub const INODE_OFF_ADVISE: usize = 0x02;
pub const INODE_OFF_INLINE: usize = 0x03;
pub const INODE_OFF_UID: usize = 0x04;
pub const INODE_OFF_GID: usize = 0x08;
pub const INODE_OFF_LINKS: usize = 0x0C;
pub const INODE_OFF_SIZE: usize = 0x10;
pub const INODE_OFF_BLOCKS: usize = 0x18;
pub const INODE_OFF_ATIME: usize = 0x20;
pub const INODE_OFF_CTIME: usize = 0x28;
pub const INODE_OFF_MTIME: usize = 0x30;
pub const INODE_OFF_ATIME_NSEC: usize = 0x38;
pub const INODE_OFF_CTIME_NSEC: usize = 0x3C;
pub const INODE_OFF_MTIME_NSEC: usize = 0x40;
pub const INODE_OFF_GENERATION: usize = 0x44;
pub const INODE_OFF_FLAGS: usize = 0x48;
pub const INODE_OFF_PINO: usize = 0x4C;
pub const INODE_OFF_NAMELEN: usize = 0x50;
pub const INODE_OFF_NAME: usize = 0x54;
pub const INODE_OFF_EXTRA_ISIZE: usize = 0x158;
pub const INODE_OFF_GC_FAILURES: usize = 0x15A;
pub const INODE_OFF_PROJID: usize = 0x15C;
pub const INODE_OFF_XATTR_NID: usize = 0x160;
pub const INODE_OFF_NID: usize = 0x164;
/// Start of the `i_addr` data-pointer array.
pub const INODE_OFF_ADDR: usize = 0x178;

/// Largest `extra_isize` the extra-attribute area can report.
///
/// The extra area conceptually follows the fixed fields and may not run
/// into the nid table.
pub const MAX_EXTRA_ISIZE: u16 = (INODE_OFF_NID - INODE_OFF_EXTRA_ISIZE) as u16;

// ── Inline bitmap bits (raw inode `inline` byte) ────────────────────────────

pub const INLINE_XATTR_BIT: u8 = 0x01;
pub const INLINE_DATA_BIT: u8 = 0x02;
pub const EXTRA_ATTR_BIT: u8 = 0x04;
pub const PIN_FILE_BIT: u8 = 0x08;
pub const DATA_EXIST_BIT: u8 = 0x10;

// ── Advise bits (raw inode `advise` byte) ───────────────────────────────────

/// Filenames under this inode are stored encrypted.
pub const ADVISE_ENCRYPT_NAME: u8 = 0x01;

// ── Inode flags (raw inode `flags` word) ────────────────────────────────────

/// Casefolded directory.
pub const CASEFOLD_FL: u32 = 0x4000_0000;
/// Children inherit the project id.
pub const PROJINHERIT_FL: u32 = 0x2000_0000;

// ── Node footer flag bits ───────────────────────────────────────────────────

/// The node write participated in an fsync.
pub const FSYNC_BIT: u32 = 0x1;
/// The same transaction created or renamed a directory entry.
pub const DENTRY_BIT: u32 = 0x2;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Node id: index into the node address table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Nid(pub u32);

/// Inode number. An inode's nid equals its ino.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ino(pub u32);

impl Ino {
    /// Root directory inode.
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub fn nid(self) -> Nid {
        Nid(self.0)
    }
}

impl Nid {
    #[must_use]
    pub fn ino(self) -> Ino {
        Ino(self.0)
    }
}

/// Logical block address into the image.
///
/// The default value is `NULL_ADDR` (unallocated).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlkAddr(pub u32);

impl BlkAddr {
    /// Unallocated slot.
    pub const NULL: Self = Self(0);
    /// Reserved but not yet written slot.
    pub const NEW: Self = Self(0xFFFF_FFFF);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn is_new(self) -> bool {
        self == Self::NEW
    }

    /// True for addresses that name an actual block (neither sentinel).
    #[must_use]
    pub fn is_mapped(self) -> bool {
        !self.is_null() && !self.is_new()
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block on the backing device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * BLOCK_SIZE as u64
    }
}

/// Segment number within the main area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegNo(pub u32);

/// Checkpoint version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpVer(pub u64);

impl CpVer {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SegNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors and little-endian read helpers ─────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
