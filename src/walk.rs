//! Parallel worker harness
//!
//! Enumerates files below a set of starting paths, filters them through
//! the master's acceptor predicate, and fans them out to a bounded pool
//! of worker threads over a channel. Each worker is strictly sequential
//! over the paths it is handed; the only cross-thread wait is the
//! channel.
//!
//! Per-path errors are logged and the walk continues; operational errors
//! (depot out of space, index write failure) raise an abort flag that
//! stops the dispatch loop and fails the run.
//!
//! The harness also carries the resume machinery: completion records feed
//! an observer (owned by the operation that launched the run) which
//! periodically writes the smallest per-worker last-completed path to a
//! resume log. [`extract_resume_point`] recovers that barrier from a
//! prior run's log; every path lexicographically at or below the barrier
//! has been processed by every worker, so a fresh run resumes by
//! accepting only paths strictly greater.

use crate::error::Result;
use crate::layout::{common_root_of, format_bytes};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// How much of a resume log's tail is scanned for the barrier
const RESUME_TAIL_BYTES: u64 = 10 * 1024;

/// One unit of work: a file the master accepted
type WorkItem = (PathBuf, u64);

/// A worker owned by one harness thread
pub trait Worker {
    /// Process one file; errors are logged by the harness
    fn process(&mut self, path: &Path, size: u64) -> Result<()>;

    /// Called once after the worker's channel drains
    fn close(&mut self) -> Result<()>;
}

/// The controlling side of a harness run
pub trait Master: Sync {
    /// Filter predicate applied to every enumerated file
    fn accept(&self, path: &Path) -> bool;

    /// Create the worker for slot `index`; called once per slot
    fn new_worker(&self, index: usize) -> Box<dyn Worker + Send + '_>;

    /// Bound on concurrent `process` calls
    fn num_workers(&self) -> usize;

    /// Called before enumeration starts
    fn start(&self) -> Result<()>;

    /// Called after every worker has closed
    fn finish_up(&self) -> Result<()>;

    /// Enumeration summary: accepted file count, byte total, common root
    fn scanned(&self, num_files: usize, num_bytes: u64, common_root: &Path);

    /// The run's progress counters
    fn progress(&self) -> &ProgressTracker;
}

/// Atomic progress counters shared between workers and observers
#[derive(Debug, Default)]
pub struct ProgressTracker {
    files_total: AtomicU64,
    bytes_total: AtomicU64,
    files_so_far: AtomicU64,
    bytes_so_far: AtomicU64,
}

impl ProgressTracker {
    /// Fresh tracker with zeroed counters
    pub fn new() -> ProgressTracker {
        ProgressTracker::default()
    }

    /// Record the enumeration totals
    pub fn set_totals(&self, files: u64, bytes: u64) {
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    /// Record one completed file
    pub fn add_file(&self, bytes: u64) {
        self.files_so_far.fetch_add(1, Ordering::Relaxed);
        self.bytes_so_far.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current `(files_so_far, bytes_so_far, files_total, bytes_total)`
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.files_so_far.load(Ordering::Relaxed),
            self.bytes_so_far.load(Ordering::Relaxed),
            self.files_total.load(Ordering::Relaxed),
            self.bytes_total.load(Ordering::Relaxed),
        )
    }
}

/// A completion record emitted by a worker
///
/// `worker_index` of `None` is the shutdown sentinel: the observer writes
/// its final barrier and exits.
#[derive(Debug, Clone)]
pub struct Completed {
    /// The path the worker just finished
    pub path: PathBuf,
    /// Worker slot, or `None` for the shutdown sentinel
    pub worker_index: Option<usize>,
}

/// Totals of one harness run
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkSummary {
    /// Files handed to workers
    pub files: usize,
    /// Bytes handed to workers
    pub bytes: u64,
}

/// Run a master over a set of starting paths
///
/// Enumerates files in sorted order, reports totals through `scanned`,
/// dispatches accepted files to `num_workers` threads, closes every
/// worker, then calls `finish_up`. The first operational (non-per-item)
/// worker error aborts dispatch and is returned after the pool drains.
pub fn work(name: &str, start_paths: &[PathBuf], master: &dyn Master) -> Result<WorkSummary> {
    master.start()?;

    let mut items: Vec<WorkItem> = Vec::new();
    let mut total_bytes = 0u64;
    for start in start_paths {
        for entry in WalkDir::new(start) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("{}: walk error: {}", name, err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !master.accept(path) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!("{}: cannot stat {:?}: {}", name, path, err);
                    continue;
                }
            };
            total_bytes += size;
            items.push((path.to_path_buf(), size));
        }
    }
    // Sorted dispatch keeps every worker's cursor monotonic in walk
    // order, which the resume barrier depends on.
    items.sort();

    let item_paths: Vec<PathBuf> = items.iter().map(|(p, _)| p.clone()).collect();
    let common = common_root_of(&item_paths);
    master.scanned(items.len(), total_bytes, &common);
    master.progress().set_totals(items.len() as u64, total_bytes);
    info!(
        "{}: scanned {} files ({})",
        name,
        items.len(),
        format_bytes(total_bytes)
    );

    let summary = WorkSummary {
        files: items.len(),
        bytes: total_bytes,
    };

    let num_workers = master.num_workers().max(1);
    let aborted = AtomicBool::new(false);
    let fatal: Mutex<Option<crate::error::DepotError>> = Mutex::new(None);
    let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(num_workers * 2);

    thread::scope(|scope| {
        for index in 0..num_workers {
            let rx = rx.clone();
            let mut worker = master.new_worker(index);
            let progress = master.progress();
            let aborted = &aborted;
            let fatal = &fatal;
            scope.spawn(move || {
                while let Ok((path, size)) = rx.recv() {
                    if aborted.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(err) = worker.process(&path, size) {
                        if err.is_per_item() {
                            error!("{}: error processing {:?}: {}", name, path, err);
                        } else {
                            error!("{}: aborting run at {:?}: {}", name, path, err);
                            aborted.store(true, Ordering::Relaxed);
                            let mut slot = fatal.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            break;
                        }
                    }
                    progress.add_file(size);
                }
                if let Err(err) = worker.close() {
                    error!("{}: worker {} close failed: {}", name, index, err);
                }
            });
        }
        drop(rx);

        for item in items {
            if aborted.load(Ordering::Relaxed) {
                break;
            }
            if tx.send(item).is_err() {
                break;
            }
        }
        drop(tx);
    });

    master.finish_up()?;

    if let Some(err) = fatal.into_inner() {
        return Err(err);
    }
    Ok(summary)
}

/// Extract the resume barrier from a prior run's resume log
///
/// Reads at least the last 10 KiB of the log, keeps the last
/// `num_workers` lines in a ring, sorts them and returns the smallest:
/// the safe barrier below which every path has been processed. An empty
/// log is an error; fewer lines than workers is only a warning.
pub fn extract_resume_point(resume_path: &Path, num_workers: usize) -> Result<String> {
    let mut file = File::open(resume_path)?;
    let len = file.metadata()?.len();
    let tail = RESUME_TAIL_BYTES.min(len);
    file.seek(SeekFrom::End(-(tail as i64)))?;

    let mut buf = vec![0u8; tail as usize];
    file.read_exact(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut ring: VecDeque<String> = VecDeque::with_capacity(num_workers);
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if ring.len() == num_workers {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
    }

    if ring.is_empty() {
        return Err(crate::error::DepotError::invalid_config(format!(
            "could not extract a resume point from {resume_path:?}, file seems empty"
        )));
    }
    if ring.len() < num_workers {
        warn!(
            "extracting resume point from {:?}: expected {} lines, got {}",
            resume_path,
            num_workers,
            ring.len()
        );
    }

    let mut lines: Vec<String> = ring.into_iter().collect();
    lines.sort();
    Ok(lines.remove(0))
}
