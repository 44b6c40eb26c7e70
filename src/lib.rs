//! # romdepot - Content-addressed deduplicating ROM archive
//!
//! A storage core for ROM collections: every distinct payload is persisted
//! exactly once, compressed, keyed by its SHA1 across a pool of on-disk
//! roots, and cross-referenced with the catalogs ("DATs") that describe it.
//!
//! ## Overview
//!
//! romdepot ingests arbitrary file trees (loose files, zip containers,
//! pre-compressed singletons) and gives back three capabilities:
//!
//! - **Deduplicated storage**: payloads are content-addressed, so a rom
//!   that appears in a hundred collections is stored once
//! - **Multi-key lookup**: a payload is findable by CRC32, MD5 or SHA1,
//!   and resolves to every catalog that references it
//! - **Reconstruction**: any cataloged game can be rebuilt on demand as a
//!   deterministic zip archive, byte-identical across rebuilds
//!
//! ## Architecture
//!
//! Three subsystems cooperate:
//!
//! - **The Depot** ([`Depot`]): a multi-root store of gzip blobs sharded
//!   by digest prefix, with first-fit placement against per-root size
//!   caps, concurrent ingestion, and garbage collection by catalog
//!   reachability ([`Depot::purge`])
//! - **The Index** ([`RomIndex`]): six durable key/value maps relating
//!   the three payload digests to each other and to catalog identities,
//!   with append-union semantics that make ingestion idempotent
//! - **The Worker Harness** ([`walk`]): a bounded-parallelism tree
//!   scanner feeding both, with a resume log that lets an interrupted
//!   bulk ingest pick up where it left off
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use romdepot::{ArchiveOptions, Depot, DepotRoot, RomIndex};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn main() -> romdepot::Result<()> {
//! // Open the index and a two-root depot.
//! let index = Arc::new(RomIndex::open(&PathBuf::from("./index"))?);
//! let depot = Depot::new(
//!     vec![
//!         DepotRoot { path: PathBuf::from("./depot/a"), max_size: 500 << 30 },
//!         DepotRoot { path: PathBuf::from("./depot/b"), max_size: 500 << 30 },
//!     ],
//!     index,
//! )?;
//!
//! // Ingest a collection.
//! let summary = depot.archive(
//!     &[PathBuf::from("/collections/incoming")],
//!     &ArchiveOptions::new(PathBuf::from("./logs")),
//! )?;
//! println!("archived {} files", summary.files);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Content addressing
//!
//! A payload's home is derived from its SHA1: four two-character shard
//! directories followed by the full hex digest, e.g.
//! `22/59/63/63/2259...d511.gz`. Blobs carry their MD5 and CRC32 in a
//! 20-byte trailer readable without decompression, so weaker-hash
//! queries never re-read payloads.
//!
//! ### Catalogs and generations
//!
//! Catalogs are soft-deleted wholesale: [`RomIndex::orphan_dats`] bumps
//! a generation counter, and reachability compares each catalog's
//! stamped generation against the current one. [`Depot::purge`] then
//! moves unreferenced blobs aside into a backup tree instead of deleting
//! them.
//!
//! ### Resumable ingestion
//!
//! During a bulk ingest, an observer tracks each worker's last completed
//! path and periodically writes the smallest, a barrier below which
//! everything is done, to a resume log. Passing that log to the next
//! run skips everything at or below the barrier.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`](Result) with [`DepotError`]
//! describing what went wrong. Per-file problems during bulk runs are
//! logged and skipped; operational failures (depot full, index write
//! failure) abort the run.

pub mod blob;
pub mod depot;
pub mod error;
pub mod hashes;
pub mod index;
pub mod kv;
pub mod layout;
pub mod purge;
pub mod rebuild;
pub mod types;
pub mod walk;

pub use depot::{ArchiveOptions, ArchiveSummary, Depot, DepotRoot};
pub use error::{DepotError, Result};
pub use hashes::Hashes;
pub use index::{IndexBatch, RomIndex};
pub use kv::{KvStore, LogKv, StoreOpener, WriteBatch};
pub use rebuild::DatEmitter;
pub use types::{Dat, Game, Rom};
pub use walk::{Master, ProgressTracker, Worker, WorkSummary};
