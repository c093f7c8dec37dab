//! Meta-area structures: superblock, checkpoint pack, NAT/SIT packs.

use rfs_types::{
    BLOCK_SIZE, BlkAddr, CpVer, Ino, Nid, ParseError, SUMMARY_ENTRY_LEN, SegNo, ensure_slice,
    read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Superblock magic ("SFLR" little-endian).
pub const SB_MAGIC: u32 = 0x524C_4653;
/// Checkpoint pack magic ("1KPC" little-endian).
pub const CP_MAGIC: u32 = 0x4350_4B31;

/// The filesystem was unmounted cleanly at this checkpoint.
pub const CP_UMOUNT: u32 = 0x1;
/// This checkpoint was written by roll-forward recovery.
pub const CP_RECOVERED: u32 = 0x2;

/// Current segments: hot/warm/cold × data/node.
pub const NR_CURSEG: usize = 6;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub blocks_per_seg: u32,
    pub main_segs: u32,
    pub nat_blkaddr: BlkAddr,
    pub nat_pack_blocks: u32,
    pub sit_blkaddr: BlkAddr,
    pub sit_pack_blocks: u32,
    pub ssa_blkaddr: BlkAddr,
    pub main_blkaddr: BlkAddr,
    pub total_blocks: u32,
    pub max_orphans: u32,
    pub zoned: bool,
    pub segs_per_zone: u32,
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 0)?;
        if magic != SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SB_MAGIC,
                actual: magic,
            });
        }
        let block_size = read_le_u32(block, 4)?;
        if block_size as usize != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "unsupported block size",
            });
        }
        let blocks_per_seg = read_le_u32(block, 8)?;
        if blocks_per_seg == 0
            || blocks_per_seg as usize * SUMMARY_ENTRY_LEN > BLOCK_SIZE
            || !blocks_per_seg.is_power_of_two()
        {
            return Err(ParseError::InvalidField {
                field: "blocks_per_seg",
                reason: "must be a power of two whose summary fits one block",
            });
        }
        Ok(Self {
            block_size,
            blocks_per_seg,
            main_segs: read_le_u32(block, 12)?,
            nat_blkaddr: BlkAddr(read_le_u32(block, 16)?),
            nat_pack_blocks: read_le_u32(block, 20)?,
            sit_blkaddr: BlkAddr(read_le_u32(block, 24)?),
            sit_pack_blocks: read_le_u32(block, 28)?,
            ssa_blkaddr: BlkAddr(read_le_u32(block, 32)?),
            main_blkaddr: BlkAddr(read_le_u32(block, 36)?),
            total_blocks: read_le_u32(block, 40)?,
            max_orphans: read_le_u32(block, 44)?,
            zoned: block[48] != 0,
            segs_per_zone: read_le_u32(block, 52)?,
        })
    }

    pub fn write_to(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        block[0..4].copy_from_slice(&SB_MAGIC.to_le_bytes());
        block[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        block[8..12].copy_from_slice(&self.blocks_per_seg.to_le_bytes());
        block[12..16].copy_from_slice(&self.main_segs.to_le_bytes());
        block[16..20].copy_from_slice(&self.nat_blkaddr.0.to_le_bytes());
        block[20..24].copy_from_slice(&self.nat_pack_blocks.to_le_bytes());
        block[24..28].copy_from_slice(&self.sit_blkaddr.0.to_le_bytes());
        block[28..32].copy_from_slice(&self.sit_pack_blocks.to_le_bytes());
        block[32..36].copy_from_slice(&self.ssa_blkaddr.0.to_le_bytes());
        block[36..40].copy_from_slice(&self.main_blkaddr.0.to_le_bytes());
        block[40..44].copy_from_slice(&self.total_blocks.to_le_bytes());
        block[44..48].copy_from_slice(&self.max_orphans.to_le_bytes());
        block[48] = u8::from(self.zoned);
        block[52..56].copy_from_slice(&self.segs_per_zone.to_le_bytes());
    }
}

// ── Checkpoint pack ─────────────────────────────────────────────────────────

/// Position of one current segment at checkpoint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursegPos {
    pub segno: u32,
    pub next_blkoff: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPack {
    pub cp_ver: CpVer,
    pub flags: u32,
    pub valid_block_count: u32,
    pub next_free_nid: Nid,
    pub cursegs: [CursegPos; NR_CURSEG],
}

impl CheckpointPack {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 0)?;
        if magic != CP_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: CP_MAGIC,
                actual: magic,
            });
        }
        let mut cursegs = [CursegPos::default(); NR_CURSEG];
        for (i, pos) in cursegs.iter_mut().enumerate() {
            let off = 28 + i * 6;
            pos.segno = read_le_u32(block, off)?;
            pos.next_blkoff = read_le_u16(block, off + 4)?;
        }
        Ok(Self {
            cp_ver: CpVer(read_le_u64(block, 8)?),
            flags: read_le_u32(block, 16)?,
            valid_block_count: read_le_u32(block, 20)?,
            next_free_nid: Nid(read_le_u32(block, 24)?),
            cursegs,
        })
    }

    pub fn write_to(&self, block: &mut [u8]) {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        block[0..4].copy_from_slice(&CP_MAGIC.to_le_bytes());
        block[8..16].copy_from_slice(&self.cp_ver.0.to_le_bytes());
        block[16..20].copy_from_slice(&self.flags.to_le_bytes());
        block[20..24].copy_from_slice(&self.valid_block_count.to_le_bytes());
        block[24..28].copy_from_slice(&self.next_free_nid.0.to_le_bytes());
        for (i, pos) in self.cursegs.iter().enumerate() {
            let off = 28 + i * 6;
            block[off..off + 4].copy_from_slice(&pos.segno.to_le_bytes());
            block[off + 4..off + 6].copy_from_slice(&pos.next_blkoff.to_le_bytes());
        }
    }
}

// ── NAT pack ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPackEntry {
    pub nid: Nid,
    pub ino: Ino,
    pub blkaddr: BlkAddr,
    pub version: u8,
}

const NAT_ENTRY_LEN: usize = 13;

/// Serialize NAT entries into a meta-area byte region. The caller sizes
/// the region with `nat_pack_len`.
#[must_use]
pub fn write_nat_pack(entries: &[NatPackEntry], region_len: usize) -> Vec<u8> {
    debug_assert!(nat_pack_len(entries.len()) <= region_len);
    let mut out = vec![0_u8; region_len];
    out[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, e) in entries.iter().enumerate() {
        let off = 4 + i * NAT_ENTRY_LEN;
        out[off..off + 4].copy_from_slice(&e.nid.0.to_le_bytes());
        out[off + 4..off + 8].copy_from_slice(&e.ino.0.to_le_bytes());
        out[off + 8..off + 12].copy_from_slice(&e.blkaddr.0.to_le_bytes());
        out[off + 12] = e.version;
    }
    out
}

pub fn parse_nat_pack(region: &[u8]) -> Result<Vec<NatPackEntry>, ParseError> {
    let count = read_le_u32(region, 0)? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * NAT_ENTRY_LEN;
        ensure_slice(region, off, NAT_ENTRY_LEN)?;
        entries.push(NatPackEntry {
            nid: Nid(read_le_u32(region, off)?),
            ino: Ino(read_le_u32(region, off + 4)?),
            blkaddr: BlkAddr(read_le_u32(region, off + 8)?),
            version: region[off + 12],
        });
    }
    Ok(entries)
}

/// Bytes needed to pack `count` NAT entries.
#[must_use]
pub fn nat_pack_len(count: usize) -> usize {
    4 + count * NAT_ENTRY_LEN
}

// ── SIT pack ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitPackEntry {
    pub segno: SegNo,
    pub valid_count: u16,
    pub valid_map: Vec<u8>,
}

/// Serialize SIT entries; every entry carries a `map_len`-byte bitmap.
#[must_use]
pub fn write_sit_pack(entries: &[SitPackEntry], map_len: usize, region_len: usize) -> Vec<u8> {
    debug_assert!(sit_pack_len(entries.len(), map_len) <= region_len);
    let entry_len = 6 + map_len;
    let mut out = vec![0_u8; region_len];
    out[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, e) in entries.iter().enumerate() {
        debug_assert_eq!(e.valid_map.len(), map_len);
        let off = 4 + i * entry_len;
        out[off..off + 4].copy_from_slice(&e.segno.0.to_le_bytes());
        out[off + 4..off + 6].copy_from_slice(&e.valid_count.to_le_bytes());
        out[off + 6..off + 6 + map_len].copy_from_slice(&e.valid_map);
    }
    out
}

pub fn parse_sit_pack(region: &[u8], map_len: usize) -> Result<Vec<SitPackEntry>, ParseError> {
    let entry_len = 6 + map_len;
    let count = read_le_u32(region, 0)? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * entry_len;
        ensure_slice(region, off, entry_len)?;
        entries.push(SitPackEntry {
            segno: SegNo(read_le_u32(region, off)?),
            valid_count: read_le_u16(region, off + 4)?,
            valid_map: region[off + 6..off + 6 + map_len].to_vec(),
        });
    }
    Ok(entries)
}

/// Bytes needed to pack `count` SIT entries with `map_len`-byte bitmaps.
#[must_use]
pub fn sit_pack_len(count: usize, map_len: usize) -> usize {
    4 + count * (6 + map_len)
}
