#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Dentry-block scan over a directory's data blocks, TEA-based name
//! hashing, recovered-filename derivation (plain, casefolded, and
//! encrypted+casefolded stored-hash forms), and entry
//! creation/deletion.

use rfs_error::{RfsError, Result};
use rfs_meta::{CursegType, SbInfo};
use rfs_node::{DnodeMode, Inode, get_dnode_of_data, i_size_write, put_dnode};
use rfs_ondisk::{
    DentrySlot, RawInode, SummaryEntry, find_free_slot, ftype_from_mode, is_slot_live, read_slot,
    stored_name_hash, write_slot,
};
use rfs_types::{BLOCK_SIZE, BlkAddr, DENTRIES_PER_BLOCK, Ino, MAX_NAME_LEN};
use std::sync::Arc;
use tracing::debug;

// ── Name hash ───────────────────────────────────────────────────────────────

const TEA_DELTA: u32 = 0x9E37_79B9;
const HASH_COL_BIT: u32 = 0x8000_0000;

fn tea_transform(buf: &mut [u32; 4], input: &[u32; 8]) {
    let mut sum: u32 = 0;
    let mut b0 = buf[0];
    let mut b1 = buf[1];
    let (a, b, c, d) = (input[0], input[1], input[2], input[3]);

    for _ in 0..16 {
        sum = sum.wrapping_add(TEA_DELTA);
        b0 = b0.wrapping_add(
            ((b1 << 4).wrapping_add(a))
                ^ (b1.wrapping_add(sum))
                ^ ((b1 >> 5).wrapping_add(b)),
        );
        b1 = b1.wrapping_add(
            ((b0 << 4).wrapping_add(c))
                ^ (b0.wrapping_add(sum))
                ^ ((b0 >> 5).wrapping_add(d)),
        );
    }

    buf[0] = buf[0].wrapping_add(b0);
    buf[1] = buf[1].wrapping_add(b1);
}

fn str2hashbuf(msg: &[u8], len: usize, buf: &mut [u32; 8], num: usize) {
    let mut pad = len as u32 | ((len as u32) << 8);
    pad |= pad << 16;

    let len = len.min(num * 4);
    let mut val = pad;
    let mut out = 0;
    let mut i = 0;
    while i < len {
        if i % 4 == 0 {
            val = pad;
        }
        val = u32::from(msg[i]).wrapping_add(val << 8);
        if i % 4 == 3 {
            buf[out] = val;
            out += 1;
            val = pad;
        }
        i += 1;
    }
    if i == 0 || (i - 1) % 4 != 3 {
        buf[out] = val;
        out += 1;
    }
    while out < num {
        buf[out] = pad;
        out += 1;
    }
}

/// TEA hash over a filename, top collision bit masked off.
#[must_use]
pub fn name_hash(name: &[u8]) -> u32 {
    let mut buf: [u32; 4] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476];
    let mut input = [0_u32; 8];

    let mut p = 0;
    let mut remaining = name.len();
    loop {
        str2hashbuf(&name[p..], remaining, &mut input, 4);
        tea_transform(&mut buf, &input);
        p += 16;
        if remaining <= 16 {
            break;
        }
        remaining -= 16;
    }
    buf[0] & !HASH_COL_BIT
}

/// ASCII case folding; recovery only needs the fold for hashing, names
/// are matched case-sensitively afterwards.
#[must_use]
pub fn casefold(name: &[u8]) -> Vec<u8> {
    name.iter().map(u8::to_ascii_lowercase).collect()
}

// ── Recovered filename ──────────────────────────────────────────────────────

/// Filename descriptor rebuilt from a recovered inode page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredName {
    pub name: Vec<u8>,
    pub hash: u32,
}

/// Derive the lookup name and hash for a recovered dentry. The hash
/// source depends on the parent directory:
/// casefolded+encrypted parents store it on disk after the name,
/// casefolded parents hash the folded name (the fold buffer is released
/// right after), all others hash the raw name.
pub fn init_recovered_filename(
    dir: &Arc<Inode>,
    page: &[u8],
    raw: &RawInode,
) -> Result<RecoveredName> {
    let namelen = raw.namelen as usize;
    if namelen == 0 || namelen > MAX_NAME_LEN {
        return Err(RfsError::NameTooLong);
    }
    let name = raw.name.clone();

    let hash = if dir.has_encrypted_name() && dir.is_casefolded() {
        // Not computable without the key; it was saved on disk.
        stored_name_hash(page, namelen).map_err(|e| RfsError::Format(e.to_string()))?
    } else if dir.is_casefolded() {
        let folded = casefold(&name);
        name_hash(&folded)
    } else {
        name_hash(&name)
    };

    Ok(RecoveredName { name, hash })
}

// ── Lookup, insert, delete ──────────────────────────────────────────────────

/// Location of a live directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DentryRef {
    pub blkaddr: BlkAddr,
    pub slot: usize,
    pub ino: Ino,
}

fn dir_data_blocks(dir: &Arc<Inode>) -> usize {
    (dir.i_size() as usize).div_ceil(BLOCK_SIZE)
}

fn block_of(sbi: &SbInfo, dir: &Arc<Inode>, bidx: usize) -> Result<Option<(BlkAddr, Vec<u8>)>> {
    let dn = match get_dnode_of_data(sbi, dir, bidx, DnodeMode::LookupNode) {
        Ok(dn) => dn,
        Err(RfsError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let addr = dn.data_blkaddr();
    put_dnode(dn);
    if !addr.is_mapped() {
        return Ok(None);
    }
    let block = sbi.meta().get_page(addr)?.into_vec();
    Ok(Some((addr, block)))
}

/// Find `name` in `dir`, matching hash then exact bytes.
pub fn find_entry(
    sbi: &SbInfo,
    dir: &Arc<Inode>,
    name: &RecoveredName,
) -> Result<Option<DentryRef>> {
    for bidx in 0..dir_data_blocks(dir) {
        let Some((addr, block)) = block_of(sbi, dir, bidx)? else {
            continue;
        };
        for slot in 0..DENTRIES_PER_BLOCK {
            if !is_slot_live(&block, slot) {
                continue;
            }
            let entry = read_slot(&block, slot)
                .map_err(|e| RfsError::Format(e.to_string()))?;
            if entry.hash == name.hash && entry.name == name.name {
                return Ok(Some(DentryRef {
                    blkaddr: addr,
                    slot,
                    ino: entry.ino,
                }));
            }
        }
    }
    Ok(None)
}

/// Insert an entry for `(name, ino, mode)`, extending the directory with
/// a fresh dentry block when no slot is free.
pub fn add_dentry(
    sbi: &SbInfo,
    dir: &Arc<Inode>,
    name: &RecoveredName,
    ino: Ino,
    mode: u16,
) -> Result<()> {
    if sbi.fault.should_fail_alloc() {
        return Err(RfsError::OutOfMemory);
    }
    let slot_data = DentrySlot {
        hash: name.hash,
        ino,
        ftype: ftype_from_mode(mode),
        name: name.name.clone(),
    };

    for bidx in 0..dir_data_blocks(dir) {
        let Some((addr, mut block)) = block_of(sbi, dir, bidx)? else {
            continue;
        };
        if let Some(slot) = find_free_slot(&block) {
            write_slot(&mut block, slot, &slot_data);
            sbi.meta().write_page(addr, &block)?;
            debug!(
                target: "rfs::dir",
                event = "add_dentry",
                dir = dir.ino().0,
                ino = ino.0,
                blkaddr = addr.0,
                slot
            );
            return Ok(());
        }
    }

    // Append a new dentry block.
    let bidx = dir_data_blocks(dir);
    let mut dn = get_dnode_of_data(sbi, dir, bidx, DnodeMode::AllocNode)?;
    let addr = sbi.alloc_block(
        CursegType::HotData,
        SummaryEntry {
            nid: dn.nid,
            version: 0,
            ofs_in_node: dn.ofs_in_node,
        },
    )?;
    let mut block = vec![0_u8; BLOCK_SIZE];
    write_slot(&mut block, 0, &slot_data);
    sbi.meta().write_page(addr, &block)?;
    dn.set_data_blkaddr(sbi, addr)?;
    put_dnode(dn);
    i_size_write(sbi, dir, ((bidx + 1) * BLOCK_SIZE) as u64)?;
    debug!(
        target: "rfs::dir",
        event = "add_dentry_new_block",
        dir = dir.ino().0,
        ino = ino.0,
        blkaddr = addr.0
    );
    Ok(())
}

/// Remove a directory entry.
pub fn delete_entry(sbi: &SbInfo, dir: &Arc<Inode>, entry: &DentryRef) -> Result<()> {
    let mut block = sbi.meta().get_page(entry.blkaddr)?.into_vec();
    rfs_ondisk::clear_slot_live(&mut block, entry.slot);
    sbi.meta().write_page(entry.blkaddr, &block)?;
    debug!(
        target: "rfs::dir",
        event = "delete_entry",
        dir = dir.ino().0,
        ino = entry.ino.0,
        blkaddr = entry.blkaddr.0,
        slot = entry.slot
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_block::MemBlockDevice;
    use rfs_meta::{FormatOptions, MountOptions};
    use rfs_node::{InodeCache, write_new_inode};
    use rfs_types::{
        ADVISE_ENCRYPT_NAME, CASEFOLD_FL, INODE_OFF_NAME, S_IFDIR, S_IFREG,
    };

    fn fresh() -> (SbInfo, InodeCache) {
        let opts = FormatOptions {
            blocks_per_seg: 8,
            main_segs: 24,
            max_orphans: 8,
            zoned: false,
            segs_per_zone: 0,
        };
        let dev = Arc::new(MemBlockDevice::new(SbInfo::image_blocks(&opts)));
        SbInfo::format(dev.clone(), &opts).expect("format");
        let sbi = SbInfo::mount(dev, MountOptions::default()).expect("mount");
        (sbi, InodeCache::new())
    }

    fn make_dir(sbi: &SbInfo, icache: &InodeCache, ino: Ino, flags: u32, advise: u8) -> Arc<Inode> {
        let raw = RawInode {
            mode: S_IFDIR | 0o755,
            links: 2,
            flags,
            advise,
            namelen: 1,
            name: b"d".to_vec(),
            ..RawInode::default()
        };
        write_new_inode(sbi, ino, &raw).expect("dir inode");
        icache.iget_retry(sbi, ino).expect("iget")
    }

    fn plain_name(name: &[u8]) -> RecoveredName {
        RecoveredName {
            name: name.to_vec(),
            hash: name_hash(name),
        }
    }

    #[test]
    fn hash_is_deterministic_and_masked() {
        let h1 = name_hash(b"foo");
        assert_eq!(h1, name_hash(b"foo"));
        assert_ne!(h1, name_hash(b"bar"));
        assert_eq!(name_hash(b"a_rather_long_file_name.with.dots") & HASH_COL_BIT, 0);
        // Long names walk multiple 16-byte chunks.
        let long = vec![b'x'; 200];
        assert_ne!(name_hash(&long), name_hash(&long[..199]));
    }

    #[test]
    fn add_find_delete_round_trip() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), 0, 0);
        let name = plain_name(b"foo");

        assert_eq!(find_entry(&sbi, &dir, &name).expect("find"), None);
        add_dentry(&sbi, &dir, &name, Ino(50), S_IFREG | 0o644).expect("add");
        assert_eq!(dir.i_size(), BLOCK_SIZE as u64);

        let found = find_entry(&sbi, &dir, &name).expect("find").expect("entry");
        assert_eq!(found.ino, Ino(50));

        delete_entry(&sbi, &dir, &found).expect("delete");
        assert_eq!(find_entry(&sbi, &dir, &name).expect("find"), None);
    }

    #[test]
    fn directory_grows_past_one_block() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), 0, 0);
        for i in 0..DENTRIES_PER_BLOCK + 2 {
            let name = plain_name(format!("file{i}").as_bytes());
            add_dentry(&sbi, &dir, &name, Ino(100 + i as u32), S_IFREG).expect("add");
        }
        assert_eq!(dir.i_size(), 2 * BLOCK_SIZE as u64);

        let last = plain_name(format!("file{}", DENTRIES_PER_BLOCK + 1).as_bytes());
        let found = find_entry(&sbi, &dir, &last).expect("find").expect("entry");
        assert_eq!(found.ino, Ino(100 + DENTRIES_PER_BLOCK as u32 + 1));
        // Deleted slots are reused before the directory grows again.
        delete_entry(&sbi, &dir, &found).expect("delete");
        add_dentry(&sbi, &dir, &plain_name(b"reuse"), Ino(200), S_IFREG).expect("add");
        assert_eq!(dir.i_size(), 2 * BLOCK_SIZE as u64);
    }

    fn raw_with_name(name: &[u8]) -> RawInode {
        RawInode {
            mode: S_IFREG | 0o644,
            namelen: name.len() as u32,
            name: name.to_vec(),
            ..RawInode::default()
        }
    }

    #[test]
    fn recovered_name_plain() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), 0, 0);
        let raw = raw_with_name(b"Foo");
        let page = vec![0_u8; BLOCK_SIZE];
        let name = init_recovered_filename(&dir, &page, &raw).expect("name");
        assert_eq!(name.hash, name_hash(b"Foo"));
        assert_eq!(name.name, b"Foo".to_vec());
    }

    #[test]
    fn recovered_name_casefolded_hashes_fold() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), CASEFOLD_FL, 0);
        let raw = raw_with_name(b"Foo");
        let page = vec![0_u8; BLOCK_SIZE];
        let name = init_recovered_filename(&dir, &page, &raw).expect("name");
        assert_eq!(name.hash, name_hash(b"foo"));
        // The name itself keeps its case for the exact match.
        assert_eq!(name.name, b"Foo".to_vec());
    }

    #[test]
    fn recovered_name_encrypted_casefolded_reads_stored_hash() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), CASEFOLD_FL, ADVISE_ENCRYPT_NAME);
        let raw = raw_with_name(b"sealed");
        let mut page = vec![0_u8; BLOCK_SIZE];
        page[INODE_OFF_NAME..INODE_OFF_NAME + 6].copy_from_slice(b"sealed");
        let off = INODE_OFF_NAME + 6;
        page[off..off + 4].copy_from_slice(&0xCAFE_F00D_u32.to_le_bytes());

        let name = init_recovered_filename(&dir, &page, &raw).expect("name");
        assert_eq!(name.hash, 0xCAFE_F00D);
    }

    #[test]
    fn recovered_name_rejects_empty() {
        let (sbi, icache) = fresh();
        let dir = make_dir(&sbi, &icache, Ino(5), 0, 0);
        let raw = raw_with_name(b"");
        let page = vec![0_u8; BLOCK_SIZE];
        assert!(matches!(
            init_recovered_filename(&dir, &page, &raw),
            Err(RfsError::NameTooLong)
        ));
    }
}
