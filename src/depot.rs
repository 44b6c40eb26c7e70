//! The depot: a multi-root content-addressed store of compressed payloads
//!
//! A depot spreads blobs across one or more roots, each with a configured
//! size cap and a persisted `.size` counter. Placement is first-fit from a
//! cursor that skips past full roots: writes concentrate on the
//! lowest-indexed root with capacity, which keeps the working set compact
//! and makes backups predictable.
//!
//! Ingestion ([`Depot::archive`]) runs the worker harness over a set of
//! starting paths. Each worker streams a payload once to compute its
//! digest triple, consults the index, and, if the payload is new,
//! reserves space, streams it a second time through the blob writer, and
//! corrects the reservation with the actual compressed size. Completion
//! records feed a resume observer that periodically writes a safe barrier
//! to a per-run resume log, so an interrupted run can be resumed.
//!
//! ## Concurrent duplicate writes
//!
//! The presence probe and the reservation are not atomic: two workers
//! can race on the same payload, both reserve space and both write. This
//! is accepted: the second write overwrites a byte-identical blob, each
//! reservation is corrected by its own size adjustment, and the final
//! state is consistent because blobs are content-addressed.

use crate::blob::{self, archive_blob};
use crate::error::{DepotError, Result};
use crate::hashes::Hashes;
use crate::index::{IndexBatch, RomIndex};
use crate::layout::{self, blob_path, establish_size, format_bytes, GZIP_SUFFIX};
use crate::types::Rom;
use crate::walk::{self, extract_resume_point, Completed, Master, ProgressTracker, Worker};
use crossbeam_channel::{Receiver, Sender};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use zip::ZipArchive;

/// Compression floor used to estimate blob sizes for admission
///
/// Payloads are admitted against `size / 5` before the real compressed
/// size is known; the reservation is corrected afterwards.
const COMPRESSION_ESTIMATE_DIVISOR: u64 = 5;

/// Interval between resume-barrier flushes
const OBSERVER_TICK: Duration = Duration::from_secs(60);

/// Configuration of one depot root
#[derive(Debug, Clone)]
pub struct DepotRoot {
    /// Root directory
    pub path: PathBuf,
    /// Size cap in bytes
    pub max_size: u64,
}

#[derive(Debug)]
struct DepotState {
    sizes: Vec<u64>,
    start: usize,
}

/// A multi-root content-addressed blob store
pub struct Depot {
    roots: Vec<PathBuf>,
    max_sizes: Vec<u64>,
    state: Mutex<DepotState>,
    index: Arc<RomIndex>,
}

/// Options for an archive run
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Also ingest zip/gz container files as opaque payloads
    pub include_zips: bool,
    /// Only ingest payloads referenced by some non-artificial Dat
    pub only_needed: bool,
    /// Worker thread count
    pub num_workers: usize,
    /// Resume log of a prior run, if resuming
    pub resume: Option<PathBuf>,
    /// Directory receiving this run's resume log
    pub log_dir: PathBuf,
}

impl ArchiveOptions {
    /// Default options writing the resume log into `log_dir`
    pub fn new(log_dir: PathBuf) -> ArchiveOptions {
        ArchiveOptions {
            include_zips: false,
            only_needed: false,
            num_workers: num_cpus::get(),
            resume: None,
            log_dir,
        }
    }
}

/// Totals of one archive run
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Files handed to workers
    pub files: usize,
    /// Bytes handed to workers
    pub bytes: u64,
    /// The resume log written by this run
    pub resume_log: PathBuf,
}

impl Depot {
    /// Open a depot over a set of roots
    ///
    /// Establishes each root's used size (from its `.size` file, or by
    /// scanning its blobs once) and logs the root table.
    pub fn new(roots: Vec<DepotRoot>, index: Arc<RomIndex>) -> Result<Depot> {
        info!("depot init");
        let mut paths = Vec::with_capacity(roots.len());
        let mut max_sizes = Vec::with_capacity(roots.len());
        let mut sizes = Vec::with_capacity(roots.len());

        for root in roots {
            fs::create_dir_all(&root.path)?;
            debug!("establishing size of {:?}", root.path);
            let size = establish_size(&root.path)?;
            info!(
                "root = {:?}, maxSize = {}, size = {}",
                root.path,
                format_bytes(root.max_size),
                format_bytes(size)
            );
            paths.push(root.path);
            max_sizes.push(root.max_size);
            sizes.push(size);
        }

        Ok(Depot {
            roots: paths,
            max_sizes,
            state: Mutex::new(DepotState { sizes, start: 0 }),
            index,
        })
    }

    /// The index this depot consults
    pub fn index(&self) -> &RomIndex {
        &self.index
    }

    /// The configured root directories
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Snapshot of the per-root used sizes
    pub fn sizes(&self) -> Vec<u64> {
        self.state.lock().sizes.clone()
    }

    /// Reserve space on the first root that fits
    ///
    /// Scans from the cursor; a root admits the reservation if its size
    /// plus the estimate stays strictly below its cap. Roots found at or
    /// above their cap advance the cursor permanently.
    pub fn reserve_root(&self, estimated_size: u64) -> Result<usize> {
        let mut state = self.state.lock();
        let start = state.start;
        for i in start..self.roots.len() {
            if state.sizes[i] + estimated_size < self.max_sizes[i] {
                state.sizes[i] += estimated_size;
                return Ok(i);
            } else if state.sizes[i] >= self.max_sizes[i] {
                state.start = i + 1;
            }
        }

        error!("depot ran out of disk space; root table follows");
        for (i, root) in self.roots.iter().enumerate() {
            error!(
                "root = {:?}, maxSize = {}, size = {}",
                root,
                format_bytes(self.max_sizes[i]),
                format_bytes(state.sizes[i])
            );
        }
        Err(DepotError::OutOfSpace {
            needed: estimated_size,
        })
    }

    /// Correct a root's size accounting
    ///
    /// `delta` may be negative, after compression reveals the actual
    /// blob size, or while purge removes blobs.
    pub fn adjust_size(&self, index: usize, delta: i64) {
        let mut state = self.state.lock();
        let size = &mut state.sizes[index];
        *size = size.saturating_add_signed(delta);
    }

    /// Persist every root's `.size` file
    ///
    /// Failures are logged per root; size files are an optimization, the
    /// authoritative state is the blobs themselves.
    pub fn write_sizes(&self) {
        let state = self.state.lock();
        for (i, root) in self.roots.iter().enumerate() {
            if let Err(err) = layout::write_size_file(root, state.sizes[i]) {
                error!("failed to write size file into {:?}: {}", root, err);
            }
        }
    }

    /// Index of the root containing `path`, if any
    pub(crate) fn root_index_of(&self, path: &Path) -> Option<usize> {
        self.roots.iter().position(|root| path.starts_with(root))
    }

    /// Probe the roots for a blob by strong digest
    ///
    /// Returns the trailer hashes of the first blob found, or `None` if
    /// no root holds the digest.
    pub fn sha1_in_depot(&self, sha1_hex: &str) -> Result<Option<Hashes>> {
        for root in &self.roots {
            let path = blob_path(root, sha1_hex, GZIP_SUFFIX);
            if path.exists() {
                return blob::hashes_for_blob(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Locate the blob backing a rom
    ///
    /// With a single 20-byte digest, the first root holding it wins. With
    /// a collision set, each candidate is probed and disambiguated
    /// against the rom's MD5, then CRC, via the blob trailer; if the rom
    /// carries neither, the first candidate found is returned with a
    /// warning.
    pub fn find_rom_blob(&self, rom: &Rom) -> Result<Option<PathBuf>> {
        if rom.sha1.is_none() {
            return Err(DepotError::HashMissing(rom.name.clone()));
        }

        if let Some(sha1) = rom.single_sha1() {
            let sha1_hex = hex::encode(sha1);
            for root in &self.roots {
                let path = blob_path(root, &sha1_hex, GZIP_SUFFIX);
                if path.exists() {
                    return Ok(Some(path));
                }
            }
            return Ok(None);
        }

        debug!(
            "searching for the right blob for rom {} because of hash collisions",
            rom.name
        );
        for candidate in rom.sha1_candidates() {
            let sha1_hex = hex::encode(candidate);
            trace!("trying SHA1 {}", sha1_hex);
            for root in &self.roots {
                let path = blob_path(root, &sha1_hex, GZIP_SUFFIX);
                if !path.exists() {
                    continue;
                }
                if rom.md5.is_some() || rom.crc.is_some() {
                    let hh = blob::hashes_for_blob(&path)?;
                    if let Some(md5) = &rom.md5 {
                        if md5.as_slice() == hh.md5.as_slice() {
                            return Ok(Some(path));
                        }
                    }
                    if let Some(crc) = &rom.crc {
                        if crc.as_slice() == hh.crc.as_slice() {
                            return Ok(Some(path));
                        }
                    }
                } else {
                    warn!(
                        "rom {} with collision SHA1 and no other hash to disambiguate",
                        rom.name
                    );
                    return Ok(Some(path));
                }
            }
        }

        Ok(None)
    }

    /// Archive every file below the given paths
    ///
    /// Runs the worker harness with a fresh timestamped resume log in
    /// `opts.log_dir`. If `opts.resume` names a prior run's log, its
    /// barrier is extracted and only paths strictly greater are
    /// processed. Root sizes are persisted on finish.
    pub fn archive(&self, paths: &[PathBuf], opts: &ArchiveOptions) -> Result<ArchiveSummary> {
        fs::create_dir_all(&opts.log_dir)?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H_%M_%S");
        let resume_log_path = opts
            .log_dir
            .join(format!("archive-resume-{timestamp}.log"));
        let resume_log = File::create(&resume_log_path)?;

        let num_workers = opts.num_workers.max(1);
        let resume_point = match &opts.resume {
            Some(prior) => extract_resume_point(prior, num_workers)?,
            None => String::new(),
        };
        if !resume_point.is_empty() {
            info!("resuming archive run after {}", resume_point);
        }

        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        let master = ArchiveMaster {
            depot: self,
            resume_point,
            include_zips: opts.include_zips,
            only_needed: opts.only_needed,
            num_workers,
            completed: completed_tx,
            progress: ProgressTracker::new(),
        };

        let summary = thread::scope(|scope| {
            let observer = scope.spawn(|| {
                resume_observer(self, completed_rx, num_workers, resume_log);
            });
            let result = walk::work("archive roms", paths, &master);
            if observer.join().is_err() {
                error!("resume observer panicked");
            }
            result
        })?;

        Ok(ArchiveSummary {
            files: summary.files,
            bytes: summary.bytes,
            resume_log: resume_log_path,
        })
    }
}

/// Master of an archive run
struct ArchiveMaster<'d> {
    depot: &'d Depot,
    resume_point: String,
    include_zips: bool,
    only_needed: bool,
    num_workers: usize,
    completed: Sender<Completed>,
    progress: ProgressTracker,
}

impl Master for ArchiveMaster<'_> {
    fn accept(&self, path: &Path) -> bool {
        if self.resume_point.is_empty() {
            return true;
        }
        path.to_string_lossy().as_ref() > self.resume_point.as_str()
    }

    fn new_worker(&self, index: usize) -> Box<dyn Worker + Send + '_> {
        let depot: &Depot = self.depot;
        Box::new(ArchiveWorker {
            master: self,
            batch: depot.index.batch(),
            index,
        })
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn finish_up(&self) -> Result<()> {
        self.completed
            .send(Completed {
                path: PathBuf::new(),
                worker_index: None,
            })
            .map_err(|_| DepotError::storage("resume observer is gone"))?;
        self.depot.write_sizes();
        Ok(())
    }

    fn scanned(&self, _num_files: usize, _num_bytes: u64, _common_root: &Path) {}

    fn progress(&self) -> &ProgressTracker {
        &self.progress
    }
}

/// Something a payload can be re-opened from
///
/// Ingestion reads every payload twice (once to hash, once to compress)
/// so the source must be reopenable. The returned reader may borrow the
/// opener (a zip entry borrows its archive).
trait ReaderOpener {
    fn open(&mut self) -> Result<Box<dyn Read + '_>>;
}

struct FileOpener(PathBuf);

impl ReaderOpener for FileOpener {
    fn open(&mut self) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(&self.0)?))
    }
}

struct GzipOpener(PathBuf);

impl ReaderOpener for GzipOpener {
    fn open(&mut self) -> Result<Box<dyn Read + '_>> {
        let file = File::open(&self.0)?;
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    }
}

struct ZipEntryOpener<'a> {
    archive: &'a mut ZipArchive<File>,
    entry: usize,
}

impl ReaderOpener for ZipEntryOpener<'_> {
    fn open(&mut self) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.archive.by_index(self.entry)?))
    }
}

/// One ingest worker; strictly sequential over the paths it is handed
struct ArchiveWorker<'d> {
    master: &'d ArchiveMaster<'d>,
    batch: IndexBatch<'d>,
    index: usize,
}

impl Worker for ArchiveWorker<'_> {
    fn process(&mut self, path: &Path, size: u64) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "zip" => self.ingest_zip(path, size)?,
            "gz" => self.ingest_gz(path, size)?,
            _ => self.ingest_loose(path, size)?,
        };

        self.master
            .completed
            .send(Completed {
                path: path.to_path_buf(),
                worker_index: Some(self.index),
            })
            .map_err(|_| DepotError::storage("resume observer is gone"))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.batch.flush()
    }
}

impl ArchiveWorker<'_> {
    /// The eight-step ingest of one payload
    fn ingest(
        &mut self,
        opener: &mut dyn ReaderOpener,
        name: &str,
        origin: &Path,
        size: u64,
    ) -> Result<u64> {
        let (hh, _) = {
            let reader = opener.open()?;
            Hashes::for_reader(BufReader::new(reader))?
        };
        let rom = Rom::from_hashes(name.to_string(), origin.to_path_buf(), size, &hh);

        if self.master.only_needed {
            let dats = self.master.depot.index.dats_for_rom(&rom)?;
            if !dats.iter().any(|dat| !dat.artificial) {
                trace!("skipping {}, not needed by any real dat", name);
                return Ok(0);
            }
        }

        self.batch.index_rom(&rom)?;

        let sha1_hex = hh.sha1_hex();
        if self.master.depot.sha1_in_depot(&sha1_hex)?.is_some() {
            trace!("skipping {}, already in depot", name);
            return Ok(0);
        }

        let estimated = size / COMPRESSION_ESTIMATE_DIVISOR;
        let root = self.master.depot.reserve_root(estimated)?;
        let out_path = blob_path(&self.master.depot.roots[root], &sha1_hex, GZIP_SUFFIX);

        let actual = {
            let reader = opener.open()?;
            archive_blob(&out_path, BufReader::new(reader), &hh.md5crc())?
        };

        self.master
            .depot
            .adjust_size(root, actual as i64 - estimated as i64);
        debug!("archived {} as {} ({})", name, sha1_hex, format_bytes(actual));
        Ok(actual)
    }

    fn ingest_loose(&mut self, path: &Path, size: u64) -> Result<u64> {
        let name = file_name_of(path);
        self.ingest(&mut FileOpener(path.to_path_buf()), &name, path, size)
    }

    fn ingest_zip(&mut self, path: &Path, size: u64) -> Result<u64> {
        debug!("archiving zip {:?}", path);
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut total = 0u64;

        for entry in 0..archive.len() {
            let (entry_name, entry_size, is_dir) = {
                let file = archive.by_index(entry)?;
                (file.name().to_string(), file.size(), file.is_dir())
            };
            if is_dir {
                continue;
            }
            trace!("archiving zip {:?}: entry {}", path, entry_name);
            let origin = path.join(&entry_name);
            let mut opener = ZipEntryOpener {
                archive: &mut archive,
                entry,
            };
            total += self.ingest(&mut opener, &entry_name, &origin, entry_size)?;
        }

        if self.master.include_zips {
            let name = file_name_of(path);
            total += self.ingest(&mut FileOpener(path.to_path_buf()), &name, path, size)?;
        }
        Ok(total)
    }

    fn ingest_gz(&mut self, path: &Path, size: u64) -> Result<u64> {
        if self.master.include_zips {
            return self.ingest_loose(path, size);
        }

        let stripped = path.with_extension("");
        let name = file_name_of(&stripped);
        self.ingest(&mut GzipOpener(path.to_path_buf()), &name, &stripped, size)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// The resume observer
///
/// Single consumer of the completion channel. Keeps each worker's most
/// recent completed path; on every tick and at shutdown, sorts the live
/// entries and writes the smallest, the safe barrier, as one line to
/// the resume log, then persists depot sizes.
fn resume_observer(
    depot: &Depot,
    completed: Receiver<Completed>,
    num_workers: usize,
    resume_log: File,
) {
    let mut last_completed: Vec<Option<String>> = vec![None; num_workers];
    let mut writer = BufWriter::new(resume_log);
    let ticker = crossbeam_channel::tick(OBSERVER_TICK);

    loop {
        crossbeam_channel::select! {
            recv(completed) -> record => {
                match record {
                    Ok(Completed { worker_index: Some(index), path }) => {
                        if index < num_workers {
                            last_completed[index] =
                                Some(path.to_string_lossy().into_owned());
                        }
                    }
                    // Sentinel or closed channel: flush the final barrier.
                    Ok(Completed { worker_index: None, .. }) | Err(_) => {
                        write_resume_barrier(depot, &mut writer, &last_completed);
                        break;
                    }
                }
            }
            recv(ticker) -> _ => {
                write_resume_barrier(depot, &mut writer, &last_completed);
            }
        }
    }

    if let Err(err) = writer.flush() {
        warn!("could not flush resume log: {}", err);
    }
}

fn write_resume_barrier(
    depot: &Depot,
    writer: &mut BufWriter<File>,
    last_completed: &[Option<String>],
) {
    let mut live: Vec<&str> = last_completed
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    if live.is_empty() {
        return;
    }
    live.sort_unstable();

    if let Err(err) = writeln!(writer, "{}", live[0]).and_then(|_| writer.flush()) {
        warn!("could not write resume log entry: {}", err);
    }
    depot.write_sizes();
}
