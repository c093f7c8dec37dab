#![forbid(unsafe_code)]
//! On-disk format codecs.
//!
//! Bit-exact little-endian readers and writers for every structure the
//! recovery engine consumes: node-block footers, raw inodes, segment
//! summary blocks, directory entry blocks, and the superblock /
//! checkpoint / NAT / SIT packs of the meta area.

pub mod dentry;
pub mod meta;
pub mod node;
pub mod summary;

pub use dentry::{
    DentrySlot, FT_DIR, FT_REG, FT_SYMLINK, clear_slot_live, find_free_slot, ftype_from_mode,
    is_slot_live, read_slot, set_slot_live, write_slot,
};
pub use meta::{
    CP_MAGIC, CP_RECOVERED, CP_UMOUNT, CheckpointPack, CursegPos, NR_CURSEG, NatPackEntry,
    SB_MAGIC, SitPackEntry, Superblock, nat_pack_len, parse_nat_pack, parse_sit_pack,
    sit_pack_len, write_nat_pack, write_sit_pack,
};
pub use node::{
    NodeFooter, RawInode, addrs_per_inode, addrs_per_page, ino_of, inline_data_offset,
    inline_xattr_len, inline_xattr_offset, is_dent_dnode, is_fsync_dnode, is_inode,
    is_recoverable, max_inline_data, next_blkaddr_of, nid_of, ofs_of, read_addr, read_nid_slot,
    stored_name_hash, write_addr, write_nid_slot,
};
pub use summary::{SummaryEntry, read_summary, write_summary};
