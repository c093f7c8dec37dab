//! Segment validity state and current segments.
//!
//! The SIT tracks per-segment valid-block bitmaps; `CursegInfo` carries
//! the append cursor and in-memory summary of each log class.

use rfs_ondisk::{SitPackEntry, SummaryEntry};
use rfs_types::SegNo;
use std::collections::HashMap;

/// Log classes, hot/warm/cold × data/node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursegType {
    HotData,
    WarmData,
    ColdData,
    HotNode,
    WarmNode,
    ColdNode,
}

impl CursegType {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::HotData => 0,
            Self::WarmData => 1,
            Self::ColdData => 2,
            Self::HotNode => 3,
            Self::WarmNode => 4,
            Self::ColdNode => 5,
        }
    }

    /// The data classes, in summary-lookup order.
    pub const DATA: [Self; 3] = [Self::HotData, Self::WarmData, Self::ColdData];
    /// All six classes.
    pub const ALL: [Self; 6] = [
        Self::HotData,
        Self::WarmData,
        Self::ColdData,
        Self::HotNode,
        Self::WarmNode,
        Self::ColdNode,
    ];

    #[must_use]
    pub fn is_node(self) -> bool {
        matches!(self, Self::HotNode | Self::WarmNode | Self::ColdNode)
    }
}

/// Validity state of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegEntry {
    pub valid_count: u16,
    pub valid_map: Vec<u8>,
}

impl SegEntry {
    #[must_use]
    pub fn empty(map_len: usize) -> Self {
        Self {
            valid_count: 0,
            valid_map: vec![0_u8; map_len],
        }
    }

    #[must_use]
    pub fn is_valid(&self, blkoff: u16) -> bool {
        let idx = usize::from(blkoff);
        self.valid_map[idx / 8] >> (idx % 8) & 1 == 1
    }

    /// Mark a block valid; returns false if it already was.
    pub fn set_valid(&mut self, blkoff: u16) -> bool {
        let idx = usize::from(blkoff);
        let mask = 1 << (idx % 8);
        if self.valid_map[idx / 8] & mask != 0 {
            return false;
        }
        self.valid_map[idx / 8] |= mask;
        self.valid_count += 1;
        true
    }

    /// Clear a block's valid bit; returns false if it already was clear.
    pub fn clear_valid(&mut self, blkoff: u16) -> bool {
        let idx = usize::from(blkoff);
        let mask = 1 << (idx % 8);
        if self.valid_map[idx / 8] & mask == 0 {
            return false;
        }
        self.valid_map[idx / 8] &= !mask;
        self.valid_count -= 1;
        true
    }
}

#[derive(Debug)]
pub struct SitTable {
    map_len: usize,
    entries: HashMap<u32, SegEntry>,
}

impl SitTable {
    #[must_use]
    pub fn new(map_len: usize) -> Self {
        Self {
            map_len,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_pack(entries: &[SitPackEntry], map_len: usize) -> Self {
        let mut table = Self::new(map_len);
        for e in entries {
            table.entries.insert(
                e.segno.0,
                SegEntry {
                    valid_count: e.valid_count,
                    valid_map: e.valid_map.clone(),
                },
            );
        }
        table
    }

    #[must_use]
    pub fn map_len(&self) -> usize {
        self.map_len
    }

    /// Segment entry, materializing an empty one on first touch.
    pub fn entry_mut(&mut self, segno: SegNo) -> &mut SegEntry {
        let map_len = self.map_len;
        self.entries
            .entry(segno.0)
            .or_insert_with(|| SegEntry::empty(map_len))
    }

    #[must_use]
    pub fn entry(&self, segno: SegNo) -> SegEntry {
        self.entries
            .get(&segno.0)
            .cloned()
            .unwrap_or_else(|| SegEntry::empty(self.map_len))
    }

    #[must_use]
    pub fn valid_count(&self, segno: SegNo) -> u16 {
        self.entries.get(&segno.0).map_or(0, |e| e.valid_count)
    }

    /// Snapshot non-empty segments for checkpoint serialization.
    #[must_use]
    pub fn to_pack(&self) -> Vec<SitPackEntry> {
        let mut out: Vec<SitPackEntry> = self
            .entries
            .iter()
            .filter(|(_, e)| e.valid_count > 0)
            .map(|(&segno, e)| SitPackEntry {
                segno: SegNo(segno),
                valid_count: e.valid_count,
                valid_map: e.valid_map.clone(),
            })
            .collect();
        out.sort_by_key(|e| e.segno.0);
        out
    }
}

/// In-memory cursor of one current segment.
#[derive(Debug, Clone)]
pub struct CursegInfo {
    pub segno: SegNo,
    pub next_blkoff: u16,
    /// Summary entries of the segment being appended, one per block.
    pub sum: Vec<SummaryEntry>,
}

impl CursegInfo {
    #[must_use]
    pub fn new(segno: SegNo, next_blkoff: u16, blocks_per_seg: usize) -> Self {
        Self {
            segno,
            next_blkoff,
            sum: vec![SummaryEntry::default(); blocks_per_seg],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seg_entry_bitmap() {
        let mut entry = SegEntry::empty(1);
        assert!(!entry.is_valid(3));
        assert!(entry.set_valid(3));
        assert!(!entry.set_valid(3));
        assert_eq!(entry.valid_count, 1);
        assert!(entry.is_valid(3));
        assert!(entry.clear_valid(3));
        assert!(!entry.clear_valid(3));
        assert_eq!(entry.valid_count, 0);
    }

    #[test]
    fn table_materializes_and_packs() {
        let mut sit = SitTable::new(1);
        assert_eq!(sit.valid_count(SegNo(4)), 0);
        sit.entry_mut(SegNo(4)).set_valid(0);
        sit.entry_mut(SegNo(4)).set_valid(5);
        sit.entry_mut(SegNo(2)).set_valid(1);
        // Touched but empty segments are not packed.
        let _ = sit.entry_mut(SegNo(9));

        let pack = sit.to_pack();
        assert_eq!(pack.len(), 2);
        assert_eq!(pack[0].segno, SegNo(2));
        assert_eq!(pack[1].segno, SegNo(4));
        assert_eq!(pack[1].valid_count, 2);

        let restored = SitTable::from_pack(&pack, 1);
        assert!(restored.entry(SegNo(4)).is_valid(5));
        assert!(!restored.entry(SegNo(4)).is_valid(1));
    }

    #[test]
    fn curseg_type_indices_are_dense() {
        for (i, ty) in CursegType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        assert!(CursegType::WarmNode.is_node());
        assert!(!CursegType::ColdData.is_node());
    }
}
