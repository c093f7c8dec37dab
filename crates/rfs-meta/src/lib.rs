#![forbid(unsafe_code)]
//! Mount state.
//!
//! `SbInfo` owns everything recovery observes under the checkpoint lock:
//! superblock geometry and flags, the checkpoint version, the NAT, the
//! SIT with per-segment validity bitmaps, the six current segments, and
//! the buffered meta cache. It also carries the block/segment allocator,
//! orphan-inode slots, the zoned write-pointer model, and the
//! `format`/`mount`/`write_checkpoint` lifecycle.

pub mod nat;
pub mod sit;

pub use nat::{NatTable, NodeInfo};
pub use sit::{CursegInfo, CursegType, SegEntry, SitTable};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use rfs_block::{BlockBuf, BlockDevice, MetaCache};
use rfs_error::{RfsError, Result};
use rfs_ondisk::{
    CP_RECOVERED, CP_UMOUNT, CheckpointPack, CursegPos, NR_CURSEG, NodeFooter, RawInode,
    Superblock, SummaryEntry, meta::nat_pack_len, meta::sit_pack_len, parse_nat_pack,
    parse_sit_pack, write_nat_pack, write_sit_pack, write_summary,
};
use rfs_types::{BLOCK_SIZE, BlkAddr, CpVer, Ino, Nid, S_IFDIR, SegNo};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{info, warn};

// ── Flags and categories ────────────────────────────────────────────────────

/// Superblock-level runtime flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbiFlag {
    /// Power-off recovery is in progress.
    PorDoing = 0x1,
    /// A roll-forward recovery completed on this mount.
    IsRecovered = 0x2,
    /// Quota state diverged; offline repair needed.
    QuotaNeedRepair = 0x4,
}

/// Validity categories for block addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkAddrCategory {
    /// The meta area before the main area.
    Meta,
    /// Main-area block, including post-checkpoint log positions.
    MetaPor,
}

/// Why a checkpoint is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpReason {
    Regular,
    Umount,
    Recovery,
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Superblock geometry plus derived address math.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub sb: Superblock,
}

impl Geometry {
    #[must_use]
    pub fn main_blocks(&self) -> u32 {
        self.sb.main_segs * self.sb.blocks_per_seg
    }

    /// Capacity available to user data and nodes.
    #[must_use]
    pub fn user_block_count(&self) -> u32 {
        self.main_blocks()
    }

    #[must_use]
    pub fn segno_of(&self, addr: BlkAddr) -> SegNo {
        debug_assert!(addr.0 >= self.sb.main_blkaddr.0);
        SegNo((addr.0 - self.sb.main_blkaddr.0) / self.sb.blocks_per_seg)
    }

    #[must_use]
    pub fn blkoff_of(&self, addr: BlkAddr) -> u16 {
        debug_assert!(addr.0 >= self.sb.main_blkaddr.0);
        ((addr.0 - self.sb.main_blkaddr.0) % self.sb.blocks_per_seg) as u16
    }

    #[must_use]
    pub fn addr_of(&self, segno: SegNo, blkoff: u16) -> BlkAddr {
        BlkAddr(self.sb.main_blkaddr.0 + segno.0 * self.sb.blocks_per_seg + u32::from(blkoff))
    }

    /// Bytes per segment validity bitmap.
    #[must_use]
    pub fn sit_map_len(&self) -> usize {
        (self.sb.blocks_per_seg as usize).div_ceil(8)
    }

    /// SSA block of a segment.
    #[must_use]
    pub fn sum_blkaddr(&self, segno: SegNo) -> BlkAddr {
        BlkAddr(self.sb.ssa_blkaddr.0 + segno.0)
    }
}

// ── Fault injection ─────────────────────────────────────────────────────────

/// Deterministic allocation-failure injection for exercising the
/// retry-on-pressure paths.
#[derive(Debug, Default)]
pub struct FaultPolicy {
    oom_period: AtomicU32,
    counter: AtomicU32,
    /// Opt-in: retry `reserve_new_block` forever instead of treating
    /// exhaustion as an invariant violation.
    pub retry_reserve_forever: AtomicBool,
}

impl FaultPolicy {
    /// Fail every `period`-th may-fail allocation; 0 disables.
    pub fn set_oom_period(&self, period: u32) {
        self.oom_period.store(period, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn should_fail_alloc(&self) -> bool {
        let period = self.oom_period.load(Ordering::Relaxed);
        if period == 0 {
            return false;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n % period == period - 1
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    pub readonly: bool,
    /// Quota accounting is configured for this mount.
    pub quota: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            quota: true,
        }
    }
}

// ── SbInfo ──────────────────────────────────────────────────────────────────

pub struct SbInfo {
    geo: Geometry,
    meta: MetaCache,
    cp_lock: RwLock<()>,
    cp_ver: AtomicU64,
    flags: AtomicU32,
    readonly: AtomicBool,
    quota_configured: bool,
    quota_files_on: AtomicBool,
    nat: Mutex<NatTable>,
    sit: Mutex<SitTable>,
    cursegs: Mutex<Vec<CursegInfo>>,
    reserved_segs: Mutex<HashSet<u32>>,
    valid_block_count: AtomicU32,
    last_valid_block_count: AtomicU32,
    alloc_block_count: AtomicU32,
    orphan_count: AtomicU32,
    zones: Mutex<std::collections::HashMap<u32, BlkAddr>>,
    pub fault: FaultPolicy,
}

impl SbInfo {
    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn meta(&self) -> &MetaCache {
        &self.meta
    }

    #[must_use]
    pub fn cp_ver(&self) -> CpVer {
        CpVer(self.cp_ver.load(Ordering::Acquire))
    }

    /// Take the checkpoint lock exclusively. Held across both recovery
    /// walks so the NAT/SIT cannot change underneath them.
    pub fn cp_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.cp_lock.write()
    }

    pub fn nat(&self) -> MutexGuard<'_, NatTable> {
        self.nat.lock()
    }

    pub fn sit(&self) -> MutexGuard<'_, SitTable> {
        self.sit.lock()
    }

    #[must_use]
    pub fn get_node_info(&self, nid: Nid) -> Option<NodeInfo> {
        self.nat.lock().lookup(nid)
    }

    // ── Flags ───────────────────────────────────────────────────────────

    pub fn set_flag(&self, flag: SbiFlag) {
        self.flags.fetch_or(flag as u32, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: SbiFlag) {
        self.flags.fetch_and(!(flag as u32), Ordering::AcqRel);
    }

    #[must_use]
    pub fn test_flag(&self, flag: SbiFlag) -> bool {
        self.flags.load(Ordering::Acquire) & flag as u32 != 0
    }

    #[must_use]
    pub fn readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn set_readonly(&self, ro: bool) {
        self.readonly.store(ro, Ordering::Release);
    }

    // ── Quota files ─────────────────────────────────────────────────────

    /// Turn on quota accounting for recovery; returns whether it was
    /// enabled by this call.
    pub fn enable_quota_files(&self) -> bool {
        if !self.quota_configured || self.quota_files_on.swap(true, Ordering::AcqRel) {
            return false;
        }
        true
    }

    pub fn disable_quota_files(&self) {
        self.quota_files_on.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn quota_enabled(&self) -> bool {
        self.quota_files_on.load(Ordering::Acquire)
    }

    // ── Address validity ────────────────────────────────────────────────

    #[must_use]
    pub fn is_valid_blkaddr(&self, addr: BlkAddr, category: BlkAddrCategory) -> bool {
        let sb = &self.geo.sb;
        match category {
            BlkAddrCategory::Meta => addr.0 >= 1 && addr.0 < sb.main_blkaddr.0,
            BlkAddrCategory::MetaPor => {
                addr.0 >= sb.main_blkaddr.0
                    && addr.0 < sb.main_blkaddr.0 + self.geo.main_blocks()
                    && addr.0 < sb.total_blocks
            }
        }
    }

    // ── Block counters ──────────────────────────────────────────────────

    #[must_use]
    pub fn valid_block_count(&self) -> u32 {
        self.valid_block_count.load(Ordering::Acquire)
    }

    /// Blocks the post-checkpoint log may legitimately occupy; discovery
    /// uses this as its loop bound.
    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.geo.user_block_count().saturating_sub(self.valid_block_count())
    }

    /// Reserve accounting for one block (e.g. a `NEW_ADDR` slot).
    pub fn inc_valid_block_count(&self, count: u32) -> Result<()> {
        let cur = self.valid_block_count.load(Ordering::Acquire);
        if cur.saturating_add(count) > self.geo.user_block_count() {
            return Err(RfsError::NoSpace);
        }
        self.valid_block_count.fetch_add(count, Ordering::AcqRel);
        self.alloc_block_count.fetch_add(count, Ordering::AcqRel);
        Ok(())
    }

    pub fn dec_valid_block_count(&self, count: u32) {
        self.valid_block_count.fetch_sub(count, Ordering::AcqRel);
    }

    /// Whether enough space remains to replay the roll-forward log.
    #[must_use]
    pub fn space_for_roll_forward(&self) -> bool {
        let last = self.last_valid_block_count.load(Ordering::Acquire);
        let alloc = self.alloc_block_count.load(Ordering::Acquire);
        last.saturating_add(alloc) <= self.geo.user_block_count()
    }

    // ── Orphan slots ────────────────────────────────────────────────────

    pub fn acquire_orphan_inode(&self) -> Result<()> {
        let cur = self.orphan_count.fetch_add(1, Ordering::AcqRel);
        if cur >= self.geo.sb.max_orphans {
            self.orphan_count.fetch_sub(1, Ordering::AcqRel);
            return Err(RfsError::NoSpace);
        }
        Ok(())
    }

    pub fn release_orphan_inode(&self) {
        self.orphan_count.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn orphan_count(&self) -> u32 {
        self.orphan_count.load(Ordering::Acquire)
    }

    // ── Current segments ────────────────────────────────────────────────

    #[must_use]
    pub fn curseg_pos(&self, ty: CursegType) -> (SegNo, u16) {
        let cursegs = self.cursegs.lock();
        let cs = &cursegs[ty.index()];
        (cs.segno, cs.next_blkoff)
    }

    /// First free block of a current segment: the boundary between
    /// "belongs to checkpoint" and "written after checkpoint".
    #[must_use]
    pub fn next_free_blkaddr(&self, ty: CursegType) -> BlkAddr {
        let (segno, blkoff) = self.curseg_pos(ty);
        self.geo.addr_of(segno, blkoff)
    }

    /// Summary entry for `(segno, blkoff)` if a data current segment
    /// covers that segment in memory.
    #[must_use]
    pub fn curseg_sum_entry(&self, segno: SegNo, blkoff: u16) -> Option<SummaryEntry> {
        let cursegs = self.cursegs.lock();
        for ty in CursegType::DATA {
            let cs = &cursegs[ty.index()];
            if cs.segno == segno {
                return Some(cs.sum[usize::from(blkoff)]);
            }
        }
        None
    }

    /// Read a segment's summary block from the SSA.
    pub fn get_sum_page(&self, segno: SegNo) -> Result<BlockBuf> {
        self.meta.get_page(self.geo.sum_blkaddr(segno))
    }

    #[must_use]
    pub fn get_seg_entry(&self, segno: SegNo) -> SegEntry {
        self.sit.lock().entry(segno)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Exclude segments from free-segment selection while the
    /// post-checkpoint log is still being walked.
    pub fn reserve_segments(&self, segs: impl IntoIterator<Item = SegNo>) {
        let mut reserved = self.reserved_segs.lock();
        for s in segs {
            reserved.insert(s.0);
        }
    }

    pub fn clear_reserved_segments(&self) {
        self.reserved_segs.lock().clear();
    }

    fn pick_free_segment(
        &self,
        cursegs: &[CursegInfo],
        sit: &SitTable,
    ) -> Result<SegNo> {
        let reserved = self.reserved_segs.lock();
        for segno in 0..self.geo.sb.main_segs {
            if reserved.contains(&segno) {
                continue;
            }
            if cursegs.iter().any(|cs| cs.segno.0 == segno) {
                continue;
            }
            if sit.valid_count(SegNo(segno)) == 0 {
                return Ok(SegNo(segno));
            }
        }
        Err(RfsError::NoSpace)
    }

    fn flush_curseg_sum(&self, cs: &CursegInfo) -> Result<()> {
        let mut block = vec![0_u8; BLOCK_SIZE];
        for (blkoff, entry) in cs.sum.iter().enumerate() {
            write_summary(&mut block, blkoff, *entry);
        }
        self.meta.write_page(self.geo.sum_blkaddr(cs.segno), &block)
    }

    /// Move one current segment onto a fresh free segment.
    fn new_curseg(&self, cursegs: &mut [CursegInfo], ty: CursegType) -> Result<()> {
        let segno = {
            let sit = self.sit.lock();
            self.pick_free_segment(cursegs, &sit)?
        };
        let cs = &mut cursegs[ty.index()];
        self.flush_curseg_sum(cs)?;
        *cs = CursegInfo::new(segno, 0, self.geo.sb.blocks_per_seg as usize);
        Ok(())
    }

    /// Allocate the next block of a log class and record its summary.
    pub fn alloc_block(&self, ty: CursegType, summary: SummaryEntry) -> Result<BlkAddr> {
        let mut cursegs = self.cursegs.lock();
        if u32::from(cursegs[ty.index()].next_blkoff) >= self.geo.sb.blocks_per_seg {
            self.new_curseg(&mut cursegs, ty)?;
        }
        let cs = &mut cursegs[ty.index()];
        let blkoff = cs.next_blkoff;
        let addr = self.geo.addr_of(cs.segno, blkoff);
        cs.sum[usize::from(blkoff)] = summary;
        cs.next_blkoff += 1;

        let newly = self.sit.lock().entry_mut(cs.segno).set_valid(blkoff);
        debug_assert!(newly, "allocated block already valid in SIT");
        self.valid_block_count.fetch_add(1, Ordering::AcqRel);
        self.alloc_block_count.fetch_add(1, Ordering::AcqRel);

        if self.geo.sb.zoned {
            let zone = cs.segno.0 / self.geo.sb.segs_per_zone.max(1);
            self.zones.lock().insert(zone, BlkAddr(addr.0 + 1));
        }
        Ok(addr)
    }

    /// Mark an already-written block valid (roll-forward replay of a
    /// post-checkpoint data write). Returns whether the bit was newly set.
    pub fn mark_block_valid(&self, addr: BlkAddr) -> bool {
        let segno = self.geo.segno_of(addr);
        let blkoff = self.geo.blkoff_of(addr);
        let newly = self.sit.lock().entry_mut(segno).set_valid(blkoff);
        if newly {
            self.valid_block_count.fetch_add(1, Ordering::AcqRel);
            self.alloc_block_count.fetch_add(1, Ordering::AcqRel);
        }
        newly
    }

    /// Drop a block from the validity map.
    pub fn invalidate_block(&self, addr: BlkAddr) {
        let segno = self.geo.segno_of(addr);
        let blkoff = self.geo.blkoff_of(addr);
        if self.sit.lock().entry_mut(segno).clear_valid(blkoff) {
            self.valid_block_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Record a summary entry for a block outside any current segment,
    /// directly in its SSA block.
    pub fn set_summary(&self, addr: BlkAddr, entry: SummaryEntry) -> Result<()> {
        let segno = self.geo.segno_of(addr);
        let blkoff = self.geo.blkoff_of(addr);
        {
            let mut cursegs = self.cursegs.lock();
            for cs in cursegs.iter_mut() {
                if cs.segno == segno {
                    cs.sum[usize::from(blkoff)] = entry;
                    return Ok(());
                }
            }
        }
        let mut block = self.get_sum_page(segno)?.into_vec();
        write_summary(&mut block, usize::from(blkoff), entry);
        self.meta.write_page(self.geo.sum_blkaddr(segno), &block)
    }

    /// Move every current segment onto a fresh segment.
    pub fn allocate_new_segments(&self) -> Result<()> {
        let mut cursegs = self.cursegs.lock();
        for ty in CursegType::ALL {
            self.new_curseg(&mut cursegs, ty)?;
        }
        Ok(())
    }

    /// Move the data current segments onto fresh segments.
    pub fn allocate_new_data_segments(&self) -> Result<()> {
        let mut cursegs = self.cursegs.lock();
        for ty in CursegType::DATA {
            self.new_curseg(&mut cursegs, ty)?;
        }
        Ok(())
    }

    // ── Zoned devices ───────────────────────────────────────────────────

    /// Reconcile each current segment with its zone's write pointer.
    ///
    /// A curseg whose append position disagrees with the recorded write
    /// pointer is moved to a fresh segment, since the device would reject
    /// non-sequential writes at the stale position.
    pub fn fix_curseg_write_pointer(&self) -> Result<()> {
        if !self.geo.sb.zoned {
            return Ok(());
        }
        let segs_per_zone = self.geo.sb.segs_per_zone.max(1);
        let mut cursegs = self.cursegs.lock();
        for ty in CursegType::ALL {
            let (segno, expected) = {
                let cs = &cursegs[ty.index()];
                (cs.segno, self.geo.addr_of(cs.segno, cs.next_blkoff))
            };
            let zone = segno.0 / segs_per_zone;
            let wp = self.zones.lock().get(&zone).copied();
            match wp {
                Some(wp) if wp != expected => {
                    warn!(
                        target: "rfs::meta",
                        event = "curseg_wp_mismatch",
                        curseg = ty.index(),
                        segno = segno.0,
                        expected = expected.0,
                        write_pointer = wp.0
                    );
                    self.new_curseg(&mut cursegs, ty)?;
                    let cs = &cursegs[ty.index()];
                    let new_zone = cs.segno.0 / segs_per_zone;
                    self.zones
                        .lock()
                        .insert(new_zone, self.geo.addr_of(cs.segno, 0));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Record a zone write pointer, as a zone report would.
    pub fn note_zone_write_pointer(&self, zone: u32, wp: BlkAddr) {
        self.zones.lock().insert(zone, wp);
    }

    // ── Meta region IO ──────────────────────────────────────────────────

    fn write_region(&self, start: BlkAddr, nblocks: u32, bytes: &[u8]) -> Result<()> {
        if bytes.len() > nblocks as usize * BLOCK_SIZE {
            return Err(RfsError::Internal(format!(
                "meta pack of {} bytes exceeds its {} reserved blocks",
                bytes.len(),
                nblocks
            )));
        }
        for i in 0..nblocks {
            let mut block = vec![0_u8; BLOCK_SIZE];
            let off = i as usize * BLOCK_SIZE;
            if off < bytes.len() {
                let end = (off + BLOCK_SIZE).min(bytes.len());
                block[..end - off].copy_from_slice(&bytes[off..end]);
            }
            self.meta
                .write_page(BlkAddr(start.0 + i), &block)?;
        }
        Ok(())
    }

    fn read_region(&self, start: BlkAddr, nblocks: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(nblocks as usize * BLOCK_SIZE);
        for i in 0..nblocks {
            out.extend_from_slice(self.meta.get_page(BlkAddr(start.0 + i))?.as_slice());
        }
        Ok(out)
    }

    // ── Checkpoint ──────────────────────────────────────────────────────

    /// Write a checkpoint: flush current-segment summaries to the SSA,
    /// serialize the NAT and SIT, and commit a new pack with a bumped
    /// version.
    pub fn write_checkpoint(&self, reason: CpReason) -> Result<()> {
        let _guard = self.cp_lock.write();
        let sb = &self.geo.sb;

        {
            let cursegs = self.cursegs.lock();
            for cs in cursegs.iter() {
                self.flush_curseg_sum(cs)?;
            }
        }

        let nat_entries = self.nat.lock().to_pack();
        if nat_pack_len(nat_entries.len()) > sb.nat_pack_blocks as usize * BLOCK_SIZE {
            return Err(RfsError::Internal("NAT pack overflow".to_owned()));
        }
        let nat_bytes = write_nat_pack(
            &nat_entries,
            sb.nat_pack_blocks as usize * BLOCK_SIZE,
        );
        self.write_region(sb.nat_blkaddr, sb.nat_pack_blocks, &nat_bytes)?;

        let sit_entries = self.sit.lock().to_pack();
        let map_len = self.geo.sit_map_len();
        if sit_pack_len(sit_entries.len(), map_len) > sb.sit_pack_blocks as usize * BLOCK_SIZE {
            return Err(RfsError::Internal("SIT pack overflow".to_owned()));
        }
        let sit_bytes = write_sit_pack(
            &sit_entries,
            map_len,
            sb.sit_pack_blocks as usize * BLOCK_SIZE,
        );
        self.write_region(sb.sit_blkaddr, sb.sit_pack_blocks, &sit_bytes)?;

        let next_ver = self.cp_ver().next();
        let mut flags = 0;
        match reason {
            CpReason::Umount => flags |= CP_UMOUNT,
            CpReason::Recovery => flags |= CP_RECOVERED,
            CpReason::Regular => {}
        }
        let mut cursegs_pos = [CursegPos::default(); NR_CURSEG];
        {
            let cursegs = self.cursegs.lock();
            for (i, cs) in cursegs.iter().enumerate() {
                cursegs_pos[i] = CursegPos {
                    segno: cs.segno.0,
                    next_blkoff: cs.next_blkoff,
                };
            }
        }
        let pack = CheckpointPack {
            cp_ver: next_ver,
            flags,
            valid_block_count: self.valid_block_count(),
            next_free_nid: self.nat.lock().next_free_nid(),
            cursegs: cursegs_pos,
        };
        let mut block = vec![0_u8; BLOCK_SIZE];
        pack.write_to(&mut block);
        self.meta.write_page(BlkAddr(1), &block)?;
        self.meta.sync()?;

        self.cp_ver.store(next_ver.0, Ordering::Release);
        self.last_valid_block_count
            .store(self.valid_block_count(), Ordering::Release);
        self.alloc_block_count.store(0, Ordering::Release);
        info!(
            target: "rfs::meta",
            event = "checkpoint",
            cp_ver = next_ver.0,
            reason = ?reason,
            valid_blocks = pack.valid_block_count
        );
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Assemble mount state from the device's checkpoint.
    pub fn mount(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let meta = MetaCache::new(dev);
        let sb_block = meta.get_page(BlkAddr(0))?;
        let sb = Superblock::parse(sb_block.as_slice())
            .map_err(|e| RfsError::Format(e.to_string()))?;
        let geo = Geometry { sb };

        let cp_block = meta.get_page(BlkAddr(1))?;
        let cp = CheckpointPack::parse(cp_block.as_slice())
            .map_err(|e| RfsError::Format(e.to_string()))?;

        let sbi = Self {
            geo,
            meta,
            cp_lock: RwLock::new(()),
            cp_ver: AtomicU64::new(cp.cp_ver.0),
            flags: AtomicU32::new(0),
            readonly: AtomicBool::new(options.readonly),
            quota_configured: options.quota,
            quota_files_on: AtomicBool::new(false),
            nat: Mutex::new(NatTable::new(cp.next_free_nid)),
            sit: Mutex::new(SitTable::new(geo.sit_map_len())),
            cursegs: Mutex::new(Vec::new()),
            reserved_segs: Mutex::new(HashSet::new()),
            valid_block_count: AtomicU32::new(cp.valid_block_count),
            last_valid_block_count: AtomicU32::new(cp.valid_block_count),
            alloc_block_count: AtomicU32::new(0),
            orphan_count: AtomicU32::new(0),
            zones: Mutex::new(std::collections::HashMap::new()),
            fault: FaultPolicy::default(),
        };

        let nat_bytes = sbi.read_region(sb.nat_blkaddr, sb.nat_pack_blocks)?;
        let nat_entries =
            parse_nat_pack(&nat_bytes).map_err(|e| RfsError::Format(e.to_string()))?;
        *sbi.nat.lock() = NatTable::from_pack(&nat_entries, cp.next_free_nid);

        let sit_bytes = sbi.read_region(sb.sit_blkaddr, sb.sit_pack_blocks)?;
        let sit_entries = parse_sit_pack(&sit_bytes, geo.sit_map_len())
            .map_err(|e| RfsError::Format(e.to_string()))?;
        *sbi.sit.lock() = SitTable::from_pack(&sit_entries, geo.sit_map_len());

        {
            let mut cursegs = sbi.cursegs.lock();
            for pos in &cp.cursegs {
                let mut cs = CursegInfo::new(
                    SegNo(pos.segno),
                    pos.next_blkoff,
                    sb.blocks_per_seg as usize,
                );
                // Reload the partially-filled segment's summary.
                let sum_block = sbi.meta.get_page(geo.sum_blkaddr(cs.segno))?;
                for blkoff in 0..sb.blocks_per_seg as usize {
                    cs.sum[blkoff] = rfs_ondisk::read_summary(sum_block.as_slice(), blkoff)
                        .map_err(|e| RfsError::Format(e.to_string()))?;
                }
                cursegs.push(cs);
            }
        }

        if cp.flags & CP_UMOUNT == 0 {
            sbi.set_flag(SbiFlag::PorDoing);
            info!(target: "rfs::meta", event = "unclean_mount", cp_ver = cp.cp_ver.0);
        }
        Ok(sbi)
    }

    /// Number of blocks an image needs for the given format options.
    #[must_use]
    pub fn image_blocks(opts: &FormatOptions) -> u32 {
        Self::layout(opts).total_blocks
    }

    fn layout(opts: &FormatOptions) -> Superblock {
        let main_blocks = opts.main_segs * opts.blocks_per_seg;
        // Every main-area block could in principle hold a node.
        let nat_pack_blocks =
            (nat_pack_len(main_blocks as usize).div_ceil(BLOCK_SIZE)) as u32;
        let map_len = (opts.blocks_per_seg as usize).div_ceil(8);
        let sit_pack_blocks =
            (sit_pack_len(opts.main_segs as usize, map_len).div_ceil(BLOCK_SIZE)) as u32;
        let nat_blkaddr = BlkAddr(2);
        let sit_blkaddr = BlkAddr(nat_blkaddr.0 + nat_pack_blocks);
        let ssa_blkaddr = BlkAddr(sit_blkaddr.0 + sit_pack_blocks);
        let main_blkaddr = BlkAddr(ssa_blkaddr.0 + opts.main_segs);
        Superblock {
            block_size: BLOCK_SIZE as u32,
            blocks_per_seg: opts.blocks_per_seg,
            main_segs: opts.main_segs,
            nat_blkaddr,
            nat_pack_blocks,
            sit_blkaddr,
            sit_pack_blocks,
            ssa_blkaddr,
            main_blkaddr,
            total_blocks: main_blkaddr.0 + main_blocks,
            max_orphans: opts.max_orphans,
            zoned: opts.zoned,
            segs_per_zone: opts.segs_per_zone,
        }
    }

    /// Write a fresh filesystem onto the device: superblock, empty NAT
    /// and SIT, a root directory inode, and a clean checkpoint.
    pub fn format(dev: Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<()> {
        let sb = Self::layout(opts);
        if dev.block_count() < sb.total_blocks {
            return Err(RfsError::NoSpace);
        }
        let geo = Geometry { sb };
        let meta = MetaCache::new(dev);

        let mut sb_block = vec![0_u8; BLOCK_SIZE];
        sb.write_to(&mut sb_block);
        meta.write_page(BlkAddr(0), &sb_block)?;

        let mut cursegs = Vec::with_capacity(NR_CURSEG);
        for i in 0..NR_CURSEG {
            cursegs.push(CursegInfo::new(
                SegNo(i as u32),
                0,
                sb.blocks_per_seg as usize,
            ));
        }

        let sbi = Self {
            geo,
            meta,
            cp_lock: RwLock::new(()),
            cp_ver: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            readonly: AtomicBool::new(false),
            quota_configured: true,
            quota_files_on: AtomicBool::new(false),
            nat: Mutex::new(NatTable::new(Nid(Ino::ROOT.0 + 1))),
            sit: Mutex::new(SitTable::new(geo.sit_map_len())),
            cursegs: Mutex::new(cursegs),
            reserved_segs: Mutex::new(HashSet::new()),
            valid_block_count: AtomicU32::new(0),
            last_valid_block_count: AtomicU32::new(0),
            alloc_block_count: AtomicU32::new(0),
            orphan_count: AtomicU32::new(0),
            zones: Mutex::new(std::collections::HashMap::new()),
            fault: FaultPolicy::default(),
        };

        sbi.create_root_inode()?;
        sbi.write_checkpoint(CpReason::Umount)
    }

    fn create_root_inode(&self) -> Result<()> {
        let addr = self.alloc_block(
            CursegType::WarmNode,
            SummaryEntry {
                nid: Ino::ROOT.nid(),
                version: 0,
                ofs_in_node: 0,
            },
        )?;
        let mut page = vec![0_u8; BLOCK_SIZE];
        let raw = RawInode {
            mode: S_IFDIR | 0o755,
            links: 2,
            ..RawInode::default()
        };
        raw.write_to(&mut page);
        NodeFooter {
            nid: Ino::ROOT.nid(),
            ino: Ino::ROOT,
            flag: 0,
            ofs: 0,
            cp_ver: CpVer(0),
            next_blkaddr: BlkAddr::NULL,
        }
        .write_to(&mut page);
        self.meta.write_page(addr, &page)?;
        self.nat
            .lock()
            .set_node_addr(Ino::ROOT.nid(), Ino::ROOT, addr, 0);
        Ok(())
    }
}

/// mkfs parameters.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub blocks_per_seg: u32,
    pub main_segs: u32,
    pub max_orphans: u32,
    pub zoned: bool,
    pub segs_per_zone: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            blocks_per_seg: 512,
            main_segs: 64,
            max_orphans: 32,
            zoned: false,
            segs_per_zone: 0,
        }
    }
}
