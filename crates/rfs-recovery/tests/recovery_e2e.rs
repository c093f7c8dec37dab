//! End-to-end roll-forward scenarios against built images.

mod common;

use common::*;
use rfs_block::BlockDevice;
use rfs_dir::{RecoveredName, find_entry, name_hash};
use rfs_node::{DnodeMode, get_dnode_of_data, put_dnode};
use rfs_ondisk::read_summary;
use rfs_recovery::RecoverOutcome;
use rfs_types::{
    BLOCK_SIZE, BlkAddr, DENTRY_BIT, FSYNC_BIT, Ino, Nid, S_IFREG, SegNo,
};

fn clean_summary(outcome: RecoverOutcome) -> rfs_recovery::RecoverySummary {
    match outcome {
        RecoverOutcome::Clean(summary) => summary,
        RecoverOutcome::NeedsRecovery => panic!("unexpected check-only outcome"),
    }
}

/// A file fsynced after the checkpoint gets its data index and size
/// rolled forward, and a recovery checkpoint is committed.
#[test]
fn fsynced_index_rolls_forward() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();
    let geo = *fs.sbi.geometry();

    let data = geo.addr_of(SegNo(20), 0);
    fill_data_block(dev.as_ref(), data, 0xAA);
    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    assert!(fs.sbi.test_flag(rfs_meta::SbiFlag::PorDoing));
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.fsynced_inodes, 1);
    assert_eq!(summary.recovered_indices, 1);
    assert!(summary.checkpoint_written);
    assert!(!fs.sbi.test_flag(rfs_meta::SbiFlag::PorDoing));

    let inode = fs.icache.iget_retry(&fs.sbi, Ino(7)).expect("iget");
    assert_eq!(inode.i_size(), BLOCK_SIZE as u64);
    let dn = get_dnode_of_data(&fs.sbi, &inode, 0, DnodeMode::LookupNode).expect("dnode");
    assert_eq!(dn.data_blkaddr(), data);
    put_dnode(dn);

    // Round-trip: the index points at the block and the summary points
    // back at (nid, ofs).
    assert!(
        fs.sbi
            .get_seg_entry(geo.segno_of(data))
            .is_valid(geo.blkoff_of(data))
    );
    let sum_page = fs.sbi.get_sum_page(geo.segno_of(data)).expect("sum page");
    let sum = read_summary(sum_page.as_slice(), usize::from(geo.blkoff_of(data)))
        .expect("summary");
    assert_eq!(sum.nid, Nid(7));
    assert_eq!(sum.ofs_in_node, 0);

    // The data block itself was never rewritten.
    assert_eq!(dev.read_block(data).expect("data").as_slice()[0], 0xAA);
    drop(fs);

    // Idempotence: recovering the recovered image is a no-op.
    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover again"));
    assert_eq!(summary.fsynced_inodes, 0);
    assert_eq!(summary.recovered_indices, 0);
    assert!(!summary.checkpoint_written);
}

/// `dnode(F) | inode(x)`: the trailing unfsynced inode page must not
/// overwrite the recovered metadata (the entry retires at its last
/// fsynced block).
#[test]
fn trailing_unfsynced_inode_page_is_dropped() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();
    let geo = *fs.sbi.geometry();

    let data = geo.addr_of(SegNo(21), 0);
    fill_data_block(dev.as_ref(), data, 0xBB);

    let mut fsynced = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut fsynced, 0, data);

    let mut stale = reg_raw("f");
    stale.mode = S_IFREG | 0o600;
    stale.size = 999;
    let trailing = node_page(7, 7, 0, 0, cp_ver, 0, Some(&stale));

    write_chain(dev.as_ref(), start, &mut [fsynced, trailing]);
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.fsynced_inodes, 1);
    assert_eq!(summary.recovered_indices, 1);

    let inode = fs.icache.iget_retry(&fs.sbi, Ino(7)).expect("iget");
    // Metadata comes from the fsynced page, not the trailing one.
    assert_eq!(inode.state().mode, S_IFREG | 0o644);
    assert_eq!(inode.i_size(), BLOCK_SIZE as u64);
    let dn = get_dnode_of_data(&fs.sbi, &inode, 0, DnodeMode::LookupNode).expect("dnode");
    assert_eq!(dn.data_blkaddr(), data);
    put_dnode(dn);
}

/// A data-only fsync node whose inode never reached the log is dropped
/// without failing recovery, and nothing is committed.
#[test]
fn dnode_without_inode_is_skipped() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();

    // Direct node of ino 9; the NAT has never heard of ino 9.
    let page = node_page(33, 9, 1, FSYNC_BIT, cp_ver, 0, None);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let ver_before = fs.sbi.cp_ver();
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.fsynced_inodes, 0);
    assert!(!summary.checkpoint_written);
    assert_eq!(fs.sbi.cp_ver(), ver_before);
}

/// A freshly created and fsynced file is reattached to its parent,
/// displacing a stale entry under an orphan slot.
#[test]
fn recovered_dentry_replaces_stale_entry() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    let dir = fs.seed_file(Ino(5), &dir_raw("d"));
    fs.seed_file(Ino(49), &reg_raw("foo"));
    let foo = RecoveredName {
        name: b"foo".to_vec(),
        hash: name_hash(b"foo"),
    };
    rfs_dir::add_dentry(&fs.sbi, &dir, &foo, Ino(49), S_IFREG | 0o644).expect("stale entry");
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();

    let mut raw50 = reg_raw("foo");
    raw50.uid = 1000;
    raw50.pino = 5;
    let page = node_page(50, 50, 0, FSYNC_BIT | DENTRY_BIT, cp_ver, 0, Some(&raw50));
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.fsynced_inodes, 1);
    assert!(summary.checkpoint_written);

    // Old entry displaced under an orphan slot, new one installed.
    assert_eq!(fs.sbi.orphan_count(), 1);
    let dir = fs.icache.iget_retry(&fs.sbi, Ino(5)).expect("iget dir");
    let found = find_entry(&fs.sbi, &dir, &foo)
        .expect("lookup")
        .expect("entry");
    assert_eq!(found.ino, Ino(50));

    // The inode was reconstructed from the log, with its allocation
    // charged to the recovered owner.
    let inode = fs.icache.iget_retry(&fs.sbi, Ino(50)).expect("iget file");
    assert_eq!(inode.state().uid, 1000);
    assert_eq!(inode.state().mode, S_IFREG | 0o644);
    assert_eq!(fs.quota.inode_charge(1000), 1);
    drop(fs);

    // The new binding survives a remount.
    let fs = mount(&dev);
    let dir = fs.icache.iget_retry(&fs.sbi, Ino(5)).expect("iget dir");
    let found = find_entry(&fs.sbi, &dir, &foo)
        .expect("lookup")
        .expect("entry");
    assert_eq!(found.ino, Ino(50));
}

/// The destination block is still indexed by the same inode at an older
/// offset: the resolver detaches the old index before the new one is
/// installed, leaving a single reference.
#[test]
fn collision_within_same_inode_resolved() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    let inode = fs.seed_file(Ino(7), &reg_raw("f"));
    let geo = *fs.sbi.geometry();
    let data = geo.addr_of(SegNo(20), 0);
    fill_data_block(dev.as_ref(), data, 0xCC);

    // Pre-checkpoint: slot 5 owns the block.
    let mut dn = get_dnode_of_data(&fs.sbi, &inode, 5, DnodeMode::LookupNode).expect("dnode");
    dn.set_data_blkaddr(&fs.sbi, data).expect("seed index");
    put_dnode(dn);
    fs.sbi.mark_block_valid(data);
    fs.sbi
        .set_summary(
            data,
            rfs_ondisk::SummaryEntry {
                nid: Nid(7),
                version: 0,
                ofs_in_node: 5,
            },
        )
        .expect("seed summary");
    rfs_node::i_size_write(&fs.sbi, &inode, 6 * BLOCK_SIZE as u64).expect("size");
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();

    // Fsynced state: slot 0 owns the block, slot 5 is gone.
    let mut raw = reg_raw("f");
    raw.size = 6 * BLOCK_SIZE as u64;
    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&raw));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.recovered_indices, 1);

    let inode = fs.icache.iget_retry(&fs.sbi, Ino(7)).expect("iget");
    assert_eq!(inode.i_size(), 6 * BLOCK_SIZE as u64);

    // Exactly one logical index references the block now.
    let mut holders = Vec::new();
    for bidx in 0..inode.addrs_per_inode() {
        let dn = get_dnode_of_data(&fs.sbi, &inode, bidx, DnodeMode::LookupNode).expect("dnode");
        if dn.data_blkaddr() == data {
            holders.push(bidx);
        }
        put_dnode(dn);
    }
    assert_eq!(holders, vec![0]);

    // And the summary reverse-maps to the new offset.
    let sum_page = fs.sbi.get_sum_page(geo.segno_of(data)).expect("sum page");
    let sum = read_summary(sum_page.as_slice(), usize::from(geo.blkoff_of(data)))
        .expect("summary");
    assert_eq!(sum.nid, Nid(7));
    assert_eq!(sum.ofs_in_node, 0);
}

/// The destination block is indexed by a different inode: the foreign
/// tree is walked (with its own quota context) and the stale index
/// dropped there.
#[test]
fn collision_across_inodes_resolved() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    let other = fs.seed_file(Ino(8), &reg_raw("g"));
    let geo = *fs.sbi.geometry();
    let data = geo.addr_of(SegNo(20), 3);
    fill_data_block(dev.as_ref(), data, 0xDD);

    let mut dn = get_dnode_of_data(&fs.sbi, &other, 3, DnodeMode::LookupNode).expect("dnode");
    dn.set_data_blkaddr(&fs.sbi, data).expect("seed index");
    put_dnode(dn);
    fs.sbi.mark_block_valid(data);
    fs.sbi
        .set_summary(
            data,
            rfs_ondisk::SummaryEntry {
                nid: Nid(8),
                version: 0,
                ofs_in_node: 3,
            },
        )
        .expect("seed summary");
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();

    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.recovered_indices, 1);

    let inode = fs.icache.iget_retry(&fs.sbi, Ino(7)).expect("iget");
    let dn = get_dnode_of_data(&fs.sbi, &inode, 0, DnodeMode::LookupNode).expect("dnode");
    assert_eq!(dn.data_blkaddr(), data);
    put_dnode(dn);

    let other = fs.icache.iget_retry(&fs.sbi, Ino(8)).expect("iget other");
    let dn = get_dnode_of_data(&fs.sbi, &other, 3, DnodeMode::LookupNode).expect("dnode");
    assert!(dn.data_blkaddr().is_null());
    put_dnode(dn);
    // The foreign inode got a quota context while it was visited.
    assert!(other.state().quota_initialized);
}

/// Check-only mode reports pending recovery without touching the image;
/// a subsequent real run performs it.
#[test]
fn check_only_reports_and_leaves_image_untouched() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();
    let geo = *fs.sbi.geometry();

    let data = geo.addr_of(SegNo(20), 0);
    fill_data_block(dev.as_ref(), data, 0xEE);
    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let cp_block_before = dev.read_block(BlkAddr(1)).expect("cp block");
    let outcome = fs.recover(true).expect("check");
    assert_eq!(outcome, RecoverOutcome::NeedsRecovery);
    // Same checkpoint bytes, same version: nothing was committed.
    let cp_block_after = dev.read_block(BlkAddr(1)).expect("cp block");
    assert_eq!(cp_block_before.as_slice(), cp_block_after.as_slice());
    assert_eq!(fs.sbi.cp_ver(), cp_ver);

    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.fsynced_inodes, 1);
    assert!(summary.checkpoint_written);
}

/// Check-only on a clean chain finds nothing.
#[test]
fn check_only_clean_chain() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.checkpoint();
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(true).expect("check"));
    assert_eq!(summary.fsynced_inodes, 0);
}

/// Injected allocation pressure is absorbed by the retry discipline.
#[test]
fn recovery_survives_allocation_pressure() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    let dir = fs.seed_file(Ino(5), &dir_raw("d"));
    fs.seed_file(Ino(49), &reg_raw("foo"));
    let foo = RecoveredName {
        name: b"foo".to_vec(),
        hash: name_hash(b"foo"),
    };
    rfs_dir::add_dentry(&fs.sbi, &dir, &foo, Ino(49), S_IFREG | 0o644).expect("stale entry");
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();
    let geo = *fs.sbi.geometry();

    let data = geo.addr_of(SegNo(20), 0);
    fill_data_block(dev.as_ref(), data, 0x5A);
    let mut raw50 = reg_raw("foo");
    raw50.pino = 5;
    let mut page = node_page(50, 50, 0, FSYNC_BIT | DENTRY_BIT, cp_ver, 0, Some(&raw50));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    fs.sbi.fault.set_oom_period(5);
    let summary = clean_summary(fs.recover(false).expect("recover under pressure"));
    fs.sbi.fault.set_oom_period(0);
    assert_eq!(summary.fsynced_inodes, 1);
    assert!(summary.checkpoint_written);

    let dir = fs.icache.iget_retry(&fs.sbi, Ino(5)).expect("iget dir");
    let found = find_entry(&fs.sbi, &dir, &foo)
        .expect("lookup")
        .expect("entry");
    assert_eq!(found.ino, Ino(50));
}

/// Recovery on a zoned image still completes; write-pointer
/// reconciliation runs after repair.
#[test]
fn zoned_image_recovers() {
    let mut o = opts(32);
    o.zoned = true;
    o.segs_per_zone = 4;
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();
    let geo = *fs.sbi.geometry();

    let data = geo.addr_of(SegNo(20), 0);
    fill_data_block(dev.as_ref(), data, 0x77);
    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(fs);

    let fs = mount(&dev);
    let summary = clean_summary(fs.recover(false).expect("recover"));
    assert_eq!(summary.recovered_indices, 1);
    assert!(summary.checkpoint_written);
}

/// The same roll-forward works against a file-backed image, surviving
/// the process-level equivalent of a remount.
#[test]
fn recovery_on_file_backed_image() {
    use rfs_block::FileBlockDevice;
    use rfs_meta::{CpReason, MountOptions, SbInfo};
    use rfs_node::{InodeCache, QuotaLedger, write_new_inode};
    use rfs_recovery::{create_recovery_cache, recover_fsync_data};
    use std::sync::Arc;

    let o = opts(32);
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("rollfs.img");
    let dev = Arc::new(
        FileBlockDevice::create(&path, SbInfo::image_blocks(&o)).expect("create image"),
    );
    SbInfo::format(dev.clone(), &o).expect("format");

    let (cp_ver, start, data) = {
        let sbi = SbInfo::mount(dev.clone(), MountOptions::default()).expect("mount");
        write_new_inode(&sbi, Ino(7), &reg_raw("f")).expect("seed");
        sbi.write_checkpoint(CpReason::Regular).expect("checkpoint");
        let start = sbi.next_free_blkaddr(rfs_meta::CursegType::WarmNode);
        let data = sbi.geometry().addr_of(SegNo(20), 0);
        (sbi.cp_ver(), start, data)
    };
    fill_data_block(dev.as_ref(), data, 0x42);
    let mut page = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    set_index(&mut page, 0, data);
    write_chain(dev.as_ref(), start, &mut [page]);
    drop(dev);

    let dev = Arc::new(FileBlockDevice::open(&path).expect("reopen"));
    let sbi = SbInfo::mount(dev.clone(), MountOptions::default()).expect("remount");
    let icache = InodeCache::new();
    let quota = QuotaLedger::new();
    let pool = create_recovery_cache();
    let outcome =
        recover_fsync_data(&sbi, &icache, &quota, &pool, false).expect("recover");
    let summary = clean_summary(outcome);
    assert_eq!(summary.recovered_indices, 1);

    let inode = icache.iget_retry(&sbi, Ino(7)).expect("iget");
    let dn = get_dnode_of_data(&sbi, &inode, 0, DnodeMode::LookupNode).expect("dnode");
    assert_eq!(dn.data_blkaddr(), data);
    put_dnode(dn);
}

/// A looped chain aborts recovery with a corruption error and the
/// original checkpoint stays in place.
#[test]
fn looped_chain_aborts_with_corruption() {
    let o = opts(32);
    let dev = format_dev(&o);
    let fs = mount(&dev);
    fs.seed_file(Ino(7), &reg_raw("f"));
    fs.checkpoint();
    let cp_ver = fs.sbi.cp_ver();
    let start = fs.chain_start();

    // Three nodes; the last one points back at the first.
    let a = node_page(7, 7, 0, FSYNC_BIT, cp_ver, 0, Some(&reg_raw("f")));
    let b = node_page(34, 7, 1, FSYNC_BIT, cp_ver, 0, None);
    let c = node_page(35, 7, 2, FSYNC_BIT, cp_ver, start.0, None);
    write_chain(dev.as_ref(), start, &mut [a, b, c]);
    drop(fs);

    let fs = mount(&dev);
    let ver_before = fs.sbi.cp_ver();
    let err = fs.recover(false).expect_err("looped chain must fail");
    assert!(matches!(err, rfs_error::RfsError::Corrupt { .. }));
    assert_eq!(fs.sbi.cp_ver(), ver_before);
}
