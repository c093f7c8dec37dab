//! Property tests over synthetic post-checkpoint chains.

mod common;

use common::*;
use proptest::prelude::*;
use rfs_recovery::{FsyncInodeTable, create_recovery_cache, find_fsync_dnodes};
use rfs_types::{FSYNC_BIT, Ino};
use std::collections::BTreeSet;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any chain with a back-edge is rejected as corrupt, in bounded
    /// steps, regardless of where the edge points.
    #[test]
    fn looped_chains_abort(len in 2usize..7, back in 0usize..7) {
        prop_assume!(back < len);
        let o = opts(32);
        let dev = format_dev(&o);
        let fs = mount(&dev);
        fs.seed_file(Ino(7), &reg_raw("f"));
        fs.checkpoint();
        let cp_ver = fs.sbi.cp_ver();
        let start = fs.chain_start();

        let raw_f = reg_raw("f");
        let mut pages: Vec<Vec<u8>> = (0..len)
            .map(|i| {
                let (nid, ofs) = if i == 0 { (7, 0) } else { (40 + i as u32, i as u32) };
                node_page(nid, 7, ofs, FSYNC_BIT, cp_ver, 0, if i == 0 { Some(&raw_f) } else { None })
            })
            .collect();
        // The last page closes the loop.
        let target = start.0 + back as u32;
        let last = pages.len() - 1;
        let mut footer = rfs_ondisk::NodeFooter::parse(&pages[last]).expect("footer");
        footer.next_blkaddr = rfs_types::BlkAddr(target);
        footer.write_to(&mut pages[last]);
        write_chain(dev.as_ref(), start, &mut pages);
        drop(fs);

        let fs = mount(&dev);
        let err = fs.recover(false).expect_err("loop must abort");
        let is_corrupt = matches!(err, rfs_error::RfsError::Corrupt { .. });
        prop_assert!(is_corrupt);
    }

    /// A chain whose terminal pointer leaves the main area ends the walk
    /// cleanly at that node.
    #[test]
    fn chain_terminates_outside_main_area(len in 1usize..6, terminal in 0usize..3) {
        let o = opts(32);
        let dev = format_dev(&o);
        let fs = mount(&dev);
        fs.seed_file(Ino(7), &reg_raw("f"));
        fs.checkpoint();
        let cp_ver = fs.sbi.cp_ver();
        let start = fs.chain_start();
        let geo = *fs.sbi.geometry();

        // NULL, a meta-area block, or past the end: all outside META_POR.
        let term = match terminal {
            0 => 0,
            1 => 2,
            _ => geo.sb.total_blocks + 17,
        };
        let raw_f = reg_raw("f");
        let mut pages: Vec<Vec<u8>> = (0..len)
            .map(|i| {
                let (nid, ofs) = if i == 0 { (7, 0) } else { (40 + i as u32, i as u32) };
                node_page(nid, 7, ofs, FSYNC_BIT, cp_ver, term, if i == 0 { Some(&raw_f) } else { None })
            })
            .collect();
        write_chain(dev.as_ref(), start, &mut pages);
        drop(fs);

        let fs = mount(&dev);
        let mut table = FsyncInodeTable::new();
        let pool = create_recovery_cache();
        let result = find_fsync_dnodes(
            &fs.sbi, &fs.icache, &fs.quota, &pool, &mut table, start, true,
        );
        prop_assert!(result.is_ok());
        prop_assert_eq!(table.len(), 1);
        table.destroy(&fs.icache, &pool, false);
    }

    /// The table ends up holding exactly the fsync-marked inos that the
    /// NAT can resolve; unmarked nodes and unknown inos never appear.
    #[test]
    fn table_matches_fsync_marks(marks in prop::collection::vec((10u32..15, any::<bool>()), 1..6)) {
        let o = opts(32);
        let dev = format_dev(&o);
        let fs = mount(&dev);
        for ino in 10..15u32 {
            fs.seed_file(Ino(ino), &reg_raw("f"));
        }
        fs.checkpoint();
        let cp_ver = fs.sbi.cp_ver();
        let start = fs.chain_start();

        let mut expected: BTreeSet<u32> = BTreeSet::new();
        let mut pages: Vec<Vec<u8>> = Vec::new();
        for (i, &(ino, fsync)) in marks.iter().enumerate() {
            let flag = if fsync { FSYNC_BIT } else { 0 };
            if fsync {
                expected.insert(ino);
            }
            // Direct nodes only: no inode pages are materialized, so the
            // walk observes marks without touching persistent state.
            pages.push(node_page(200 + i as u32, ino, 1, flag, cp_ver, 0, None));
        }
        // One fsync-marked node whose ino the NAT has never seen; it
        // must be skipped, not fail the walk.
        pages.push(node_page(300, 99, 1, FSYNC_BIT, cp_ver, 0, None));
        write_chain(dev.as_ref(), start, &mut pages);
        drop(fs);

        let fs = mount(&dev);
        let mut table = FsyncInodeTable::new();
        let pool = create_recovery_cache();
        let result = find_fsync_dnodes(
            &fs.sbi, &fs.icache, &fs.quota, &pool, &mut table, start, true,
        );
        prop_assert!(result.is_ok());
        let got: BTreeSet<u32> = table.inos().map(|i| i.0).collect();
        prop_assert_eq!(got, expected);
        table.destroy(&fs.icache, &pool, false);
    }
}
