//! Node address table.
//!
//! Maps each nid to the block currently holding that node, with its
//! owning ino and a write version. Held in memory between checkpoints;
//! serialized into the NAT pack by `write_checkpoint`.

use rfs_ondisk::NatPackEntry;
use rfs_types::{BlkAddr, Ino, Nid};
use std::collections::HashMap;

/// Live NAT record for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub ino: Ino,
    pub blkaddr: BlkAddr,
    pub version: u8,
}

#[derive(Debug)]
pub struct NatTable {
    entries: HashMap<u32, NodeInfo>,
    next_free_nid: Nid,
}

impl NatTable {
    #[must_use]
    pub fn new(next_free_nid: Nid) -> Self {
        Self {
            entries: HashMap::new(),
            next_free_nid,
        }
    }

    #[must_use]
    pub fn from_pack(entries: &[NatPackEntry], next_free_nid: Nid) -> Self {
        let mut table = Self::new(next_free_nid);
        for e in entries {
            table.entries.insert(
                e.nid.0,
                NodeInfo {
                    ino: e.ino,
                    blkaddr: e.blkaddr,
                    version: e.version,
                },
            );
        }
        table
    }

    #[must_use]
    pub fn lookup(&self, nid: Nid) -> Option<NodeInfo> {
        self.entries.get(&nid.0).copied()
    }

    /// Record or update the address of a node.
    pub fn set_node_addr(&mut self, nid: Nid, ino: Ino, blkaddr: BlkAddr, version: u8) {
        self.entries.insert(
            nid.0,
            NodeInfo {
                ino,
                blkaddr,
                version,
            },
        );
        if nid.0 >= self.next_free_nid.0 {
            self.next_free_nid = Nid(nid.0 + 1);
        }
    }

    pub fn remove(&mut self, nid: Nid) {
        self.entries.remove(&nid.0);
    }

    /// Hand out a fresh nid.
    pub fn alloc_nid(&mut self) -> Nid {
        let nid = self.next_free_nid;
        self.next_free_nid = Nid(nid.0 + 1);
        nid
    }

    #[must_use]
    pub fn next_free_nid(&self) -> Nid {
        self.next_free_nid
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot all entries for checkpoint serialization, nid-sorted so
    /// pack contents are deterministic.
    #[must_use]
    pub fn to_pack(&self) -> Vec<NatPackEntry> {
        let mut out: Vec<NatPackEntry> = self
            .entries
            .iter()
            .map(|(&nid, info)| NatPackEntry {
                nid: Nid(nid),
                ino: info.ino,
                blkaddr: info.blkaddr,
                version: info.version,
            })
            .collect();
        out.sort_by_key(|e| e.nid.0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_lookup_remove() {
        let mut nat = NatTable::new(Nid(10));
        assert!(nat.lookup(Nid(5)).is_none());

        nat.set_node_addr(Nid(5), Ino(5), BlkAddr(100), 1);
        let info = nat.lookup(Nid(5)).expect("entry");
        assert_eq!(info.ino, Ino(5));
        assert_eq!(info.blkaddr, BlkAddr(100));
        assert_eq!(info.version, 1);

        nat.remove(Nid(5));
        assert!(nat.lookup(Nid(5)).is_none());
    }

    #[test]
    fn alloc_nid_is_monotonic_and_skips_explicit_sets() {
        let mut nat = NatTable::new(Nid(10));
        assert_eq!(nat.alloc_nid(), Nid(10));
        assert_eq!(nat.alloc_nid(), Nid(11));

        nat.set_node_addr(Nid(40), Ino(7), BlkAddr(200), 0);
        assert_eq!(nat.alloc_nid(), Nid(41));
    }

    #[test]
    fn pack_round_trip_is_sorted() {
        let mut nat = NatTable::new(Nid(1));
        nat.set_node_addr(Nid(9), Ino(9), BlkAddr(3), 0);
        nat.set_node_addr(Nid(2), Ino(2), BlkAddr(1), 1);
        let pack = nat.to_pack();
        assert_eq!(pack[0].nid, Nid(2));
        assert_eq!(pack[1].nid, Nid(9));

        let restored = NatTable::from_pack(&pack, nat.next_free_nid());
        assert_eq!(restored.lookup(Nid(9)).expect("entry").blkaddr, BlkAddr(3));
        assert_eq!(restored.len(), 2);
    }
}
