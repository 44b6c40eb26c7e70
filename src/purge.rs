//! Depot purge
//!
//! Walks every depot root and evicts blobs that no catalog at the
//! current generation references. Nothing is deleted: evicted blobs move
//! to a backup directory, placed under the originating catalog's
//! relative path when a non-artificial earlier-generation Dat is known,
//! and under `uncategorized/` otherwise. Each successful move decrements
//! the owning root's size accounting.
//!
//! Move failures are per-blob: they are logged by the harness and the
//! walk continues.

use crate::depot::Depot;
use crate::error::{DepotError, Result};
use crate::layout::{self, common_root};
use crate::types::Dat;
use crate::walk::{self, Master, ProgressTracker, Worker, WorkSummary};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const UNCATEGORIZED_DIR: &str = "uncategorized";

impl Depot {
    /// Move every unreferenced blob into `backup_dir`
    ///
    /// A blob is referenced iff some non-artificial Dat at the current
    /// generation resolves from its digests. Returns the walk totals.
    pub fn purge(&self, backup_dir: &Path, num_workers: usize) -> Result<WorkSummary> {
        if backup_dir.as_os_str().is_empty() {
            return Err(DepotError::invalid_config("no backup dir specified"));
        }
        fs::create_dir_all(backup_dir)?;
        let backup_dir = backup_dir.canonicalize()?;
        info!(
            "purging depot into {:?} at generation {}",
            backup_dir,
            self.index().generation()
        );

        let master = PurgeMaster {
            depot: self,
            backup_dir,
            num_workers,
            progress: ProgressTracker::new(),
        };
        let roots = self.roots().to_vec();
        walk::work("purge roms", &roots, &master)
    }
}

struct PurgeMaster<'d> {
    depot: &'d Depot,
    backup_dir: PathBuf,
    num_workers: usize,
    progress: ProgressTracker,
}

impl Master for PurgeMaster<'_> {
    fn accept(&self, path: &Path) -> bool {
        path.extension().map_or(false, |ext| ext == "gz")
    }

    fn new_worker(&self, _index: usize) -> Box<dyn Worker + Send + '_> {
        Box::new(PurgeWorker { master: self })
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn finish_up(&self) -> Result<()> {
        self.depot.write_sizes();
        Ok(())
    }

    fn scanned(&self, _num_files: usize, _num_bytes: u64, _common_root: &Path) {}

    fn progress(&self) -> &ProgressTracker {
        &self.progress
    }
}

struct PurgeWorker<'d> {
    master: &'d PurgeMaster<'d>,
}

impl Worker for PurgeWorker<'_> {
    fn process(&mut self, path: &Path, size: u64) -> Result<()> {
        let depot = self.master.depot;

        let mut rom = layout::rom_from_blob_path(path)?;
        let sha1_hex = rom.sha1_hex().unwrap_or_default();
        let Some(hashes) = depot.sha1_in_depot(&sha1_hex)? else {
            warn!("blob {:?} vanished during purge", path);
            return Ok(());
        };
        rom.md5 = Some(hashes.md5.to_vec());
        rom.crc = Some(hashes.crc.to_vec());

        let dats = depot.index().dats_for_rom(&rom)?;
        let current_generation = depot.index().generation();

        let mut used = false;
        let mut real_dat: Option<&Dat> = None;
        for dat in &dats {
            if !dat.artificial && dat.generation == current_generation {
                used = true;
                break;
            }
            if !dat.artificial {
                real_dat = Some(dat);
            }
        }
        if used {
            return Ok(());
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| DepotError::MalformedPath(path.to_path_buf()))?;
        let dest = match real_dat.and_then(|dat| dat.path.as_deref()) {
            Some(dat_path) => {
                // Mirror the catalog's path below the backup dir, with
                // its shared prefix and extension removed.
                let shared = common_root(&self.master.backup_dir, dat_path);
                let relative = dat_path.strip_prefix(&shared).unwrap_or(dat_path);
                self.master
                    .backup_dir
                    .join(relative.with_extension(""))
                    .join(file_name)
            }
            None => self
                .master
                .backup_dir
                .join(UNCATEGORIZED_DIR)
                .join(file_name),
        };

        debug!("purging {:?}, moving to {:?}", path, dest);
        layout::mv(path, &dest)?;

        if let Some(root_index) = depot.root_index_of(path) {
            depot.adjust_size(root_index, -(size as i64));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
