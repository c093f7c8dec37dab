//! Segment summary blocks.
//!
//! One summary block per main segment, holding a packed
//! `{nid, version, ofs_in_node}` record per block offset: the reverse
//! pointer from a physical block back to its logical index.

use rfs_types::{BLOCK_SIZE, Nid, ParseError, SUMMARY_ENTRY_LEN, read_le_u16, read_le_u32};
use serde::{Deserialize, Serialize};

/// Reverse-map record for one block of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub nid: Nid,
    pub version: u8,
    pub ofs_in_node: u16,
}

/// Read the summary entry for block offset `blkoff` of a segment.
pub fn read_summary(block: &[u8], blkoff: usize) -> Result<SummaryEntry, ParseError> {
    let off = blkoff * SUMMARY_ENTRY_LEN;
    if off + SUMMARY_ENTRY_LEN > block.len() {
        return Err(ParseError::InsufficientData {
            needed: SUMMARY_ENTRY_LEN,
            offset: off,
            actual: block.len().saturating_sub(off),
        });
    }
    Ok(SummaryEntry {
        nid: Nid(read_le_u32(block, off)?),
        version: block[off + 4],
        ofs_in_node: read_le_u16(block, off + 5)?,
    })
}

/// Write the summary entry for block offset `blkoff` of a segment.
pub fn write_summary(block: &mut [u8], blkoff: usize, entry: SummaryEntry) {
    let off = blkoff * SUMMARY_ENTRY_LEN;
    debug_assert!(off + SUMMARY_ENTRY_LEN <= BLOCK_SIZE);
    block[off..off + 4].copy_from_slice(&entry.nid.0.to_le_bytes());
    block[off + 4] = entry.version;
    block[off + 5..off + 7].copy_from_slice(&entry.ofs_in_node.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trip() {
        let mut block = vec![0_u8; BLOCK_SIZE];
        let entry = SummaryEntry {
            nid: Nid(77),
            version: 3,
            ofs_in_node: 12,
        };
        write_summary(&mut block, 5, entry);
        assert_eq!(read_summary(&block, 5).expect("entry"), entry);
        // Neighbors untouched.
        assert_eq!(
            read_summary(&block, 4).expect("entry"),
            SummaryEntry::default()
        );
        assert_eq!(
            read_summary(&block, 6).expect("entry"),
            SummaryEntry::default()
        );
    }

    #[test]
    fn out_of_range_rejected() {
        let block = vec![0_u8; SUMMARY_ENTRY_LEN * 4];
        assert!(read_summary(&block, 4).is_err());
    }
}
