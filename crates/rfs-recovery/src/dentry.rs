//! Directory repair: reattach a recovered inode to its parent by name.

use crate::table::{FsyncEntryPool, FsyncInodeTable, missing_as_exists};
use rfs_error::{RfsError, Result};
use rfs_meta::SbInfo;
use rfs_node::{Inode, InodeCache, QuotaLedger};
use rfs_ondisk::RawInode;
use rfs_types::Ino;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reinstate the filename carried by a recovered inode page.
///
/// A colliding entry that resolves to a different ino is deleted under
/// an orphan-inode slot and the lookup retried; `OutOfMemory` while
/// adding the new entry is retried indefinitely.
pub fn recover_dentry(
    sbi: &SbInfo,
    icache: &InodeCache,
    quota: &QuotaLedger,
    pool: &FsyncEntryPool,
    inode: &Arc<Inode>,
    page: &[u8],
    dir_list: &mut FsyncInodeTable,
) -> Result<()> {
    let raw = RawInode::parse(page)
        .map_err(|e| RfsError::Format(format!("ino {}: {e}", inode.ino())))?;
    let pino = Ino(raw.pino);

    if dir_list.find(pino).is_none() {
        // Parent directories are plain (non-quota) entries; they are only
        // held so repeated dentry recoveries reuse one handle.
        dir_list.add(sbi, icache, quota, pool, pino, rfs_types::BlkAddr::NULL, false)?;
    }
    let dir = Arc::clone(&dir_list.find(pino).expect("parent just added").inode);

    let fname = rfs_dir::init_recovered_filename(&dir, page, &raw)?;
    let mode = inode.state().mode;

    let result = loop {
        match rfs_dir::find_entry(sbi, &dir, &fname)? {
            Some(de) if de.ino == inode.ino() => break Ok(()),
            Some(de) => {
                // Stale entry from before the crash; displace it.
                let einode = match icache.iget_retry(sbi, de.ino) {
                    Ok(einode) => einode,
                    Err(err) => break Err(missing_as_exists(err)),
                };
                if let Err(err) = quota.dquot_initialize(sbi, &einode) {
                    icache.iput(einode);
                    if err.is_retryable() {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    break Err(err);
                }
                if let Err(err) = sbi.acquire_orphan_inode() {
                    icache.iput(einode);
                    break Err(err);
                }
                rfs_dir::delete_entry(sbi, &dir, &de)?;
                icache.iput(einode);
                // Retry the lookup.
            }
            None => match rfs_dir::add_dentry(sbi, &dir, &fname, inode.ino(), mode) {
                Ok(()) => break Ok(()),
                Err(err) if err.is_retryable() => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => break Err(err),
            },
        }
    };

    let shown = if inode.has_encrypted_name() {
        "<encrypted>".to_owned()
    } else {
        String::from_utf8_lossy(&fname.name).into_owned()
    };
    info!(
        target: "rfs::recovery",
        event = "recover_dentry",
        ino = inode.ino().0,
        name = %shown,
        dir = pino.0,
        ok = result.is_ok()
    );
    result
}
