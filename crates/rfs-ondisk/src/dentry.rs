//! Directory entry blocks.
//!
//! A directory's data blocks hold a small live-slot bitmap followed by
//! fixed-size dentry slots `{hash, ino, namelen, ftype, name[255]}`.

use rfs_types::{
    BLOCK_SIZE, DENTRIES_PER_BLOCK, DENTRY_BITMAP_LEN, DENTRY_SLOT_LEN, Ino, MAX_NAME_LEN,
    ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, read_le_u16, read_le_u32,
};

/// Regular file.
pub const FT_REG: u8 = 1;
/// Directory.
pub const FT_DIR: u8 = 2;
/// Symbolic link.
pub const FT_SYMLINK: u8 = 7;

/// Decoded dentry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentrySlot {
    pub hash: u32,
    pub ino: Ino,
    pub ftype: u8,
    pub name: Vec<u8>,
}

#[must_use]
pub fn ftype_from_mode(mode: u16) -> u8 {
    match mode & S_IFMT {
        S_IFDIR => FT_DIR,
        S_IFLNK => FT_SYMLINK,
        _ => FT_REG,
    }
}

fn slot_offset(idx: usize) -> usize {
    debug_assert!(idx < DENTRIES_PER_BLOCK);
    DENTRY_BITMAP_LEN + idx * DENTRY_SLOT_LEN
}

#[must_use]
pub fn is_slot_live(block: &[u8], idx: usize) -> bool {
    debug_assert!(idx < DENTRIES_PER_BLOCK);
    block[idx / 8] >> (idx % 8) & 1 == 1
}

pub fn set_slot_live(block: &mut [u8], idx: usize) {
    debug_assert!(idx < DENTRIES_PER_BLOCK);
    block[idx / 8] |= 1 << (idx % 8);
}

pub fn clear_slot_live(block: &mut [u8], idx: usize) {
    debug_assert!(idx < DENTRIES_PER_BLOCK);
    block[idx / 8] &= !(1 << (idx % 8));
}

/// First free slot index, if any.
#[must_use]
pub fn find_free_slot(block: &[u8]) -> Option<usize> {
    (0..DENTRIES_PER_BLOCK).find(|&idx| !is_slot_live(block, idx))
}

/// Decode slot `idx`. The caller checks liveness first.
pub fn read_slot(block: &[u8], idx: usize) -> Result<DentrySlot, ParseError> {
    let off = slot_offset(idx);
    let namelen = read_le_u16(block, off + 8)? as usize;
    if namelen > MAX_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "dentry_namelen",
            reason: "exceeds maximum name length",
        });
    }
    Ok(DentrySlot {
        hash: read_le_u32(block, off)?,
        ino: Ino(read_le_u32(block, off + 4)?),
        ftype: block[off + 10],
        name: block[off + 11..off + 11 + namelen].to_vec(),
    })
}

/// Encode `slot` at `idx` and mark it live.
pub fn write_slot(block: &mut [u8], idx: usize, slot: &DentrySlot) {
    debug_assert!(slot.name.len() <= MAX_NAME_LEN);
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let off = slot_offset(idx);
    block[off..off + 4].copy_from_slice(&slot.hash.to_le_bytes());
    block[off + 4..off + 8].copy_from_slice(&slot.ino.0.to_le_bytes());
    let namelen = slot.name.len() as u16;
    block[off + 8..off + 10].copy_from_slice(&namelen.to_le_bytes());
    block[off + 10] = slot.ftype;
    block[off + 11..off + 11 + MAX_NAME_LEN].fill(0);
    block[off + 11..off + 11 + slot.name.len()].copy_from_slice(&slot.name);
    set_slot_live(block, idx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_round_trip_with_bitmap() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        assert_eq!(find_free_slot(&block), Some(0));

        let slot = DentrySlot {
            hash: 0x1234_5678,
            ino: Ino(50),
            ftype: FT_REG,
            name: b"foo".to_vec(),
        };
        write_slot(&mut block, 0, &slot);
        assert!(is_slot_live(&block, 0));
        assert_eq!(read_slot(&block, 0).expect("slot"), slot);
        assert_eq!(find_free_slot(&block), Some(1));

        clear_slot_live(&mut block, 0);
        assert!(!is_slot_live(&block, 0));
        assert_eq!(find_free_slot(&block), Some(0));
    }

    #[test]
    fn block_fills_up() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        for idx in 0..DENTRIES_PER_BLOCK {
            let slot = DentrySlot {
                hash: idx as u32,
                ino: Ino(100 + idx as u32),
                ftype: FT_REG,
                name: format!("f{idx}").into_bytes(),
            };
            write_slot(&mut block, idx, &slot);
        }
        assert_eq!(find_free_slot(&block), None);
        for idx in 0..DENTRIES_PER_BLOCK {
            assert_eq!(read_slot(&block, idx).expect("slot").ino, Ino(100 + idx as u32));
        }
    }

    #[test]
    fn ftype_mapping() {
        assert_eq!(ftype_from_mode(S_IFREG | 0o644), FT_REG);
        assert_eq!(ftype_from_mode(S_IFDIR | 0o755), FT_DIR);
        assert_eq!(ftype_from_mode(S_IFLNK | 0o777), FT_SYMLINK);
    }

    #[test]
    fn oversized_namelen_rejected() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        let off = DENTRY_BITMAP_LEN;
        block[off + 8..off + 10].copy_from_slice(&300_u16.to_le_bytes());
        assert!(read_slot(&block, 0).is_err());
    }
}
