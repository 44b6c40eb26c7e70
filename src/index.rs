//! Multi-key rom index
//!
//! Six durable key/value maps cross-reference the three payload digests
//! with each other and with catalog identities:
//!
//! | store | key | value |
//! |---|---|---|
//! | `dats_db` | SHA1(dat) | serialized [`Dat`] |
//! | `crc_db` | CRC | union of 20-byte Dat identities |
//! | `md5_db` | MD5 | union of 20-byte Dat identities |
//! | `sha1_db` | SHA1(rom) | union of 20-byte Dat identities |
//! | `crcsha1_db` | CRC | union of 20-byte rom SHA1s |
//! | `md5sha1_db` | MD5 | union of 20-byte rom SHA1s |
//!
//! `dats_db` is authoritative: membership of a Dat identity in any union
//! map implies a `dats_db` entry under the same key. The five union maps
//! only ever grow through append-union with deduplication, which is what
//! makes ingest idempotent and safe to retry.
//!
//! A `generation` file under the index root soft-deletes catalogs:
//! [`RomIndex::orphan_dats`] bumps the counter, and reachability checks
//! compare a Dat's stamped generation against the current one instead of
//! deleting anything.

use crate::error::{DepotError, Result};
use crate::kv::{
    default_store_opener, merge_union, KvStore, StoreOpener, WriteBatch, KEY_SIZE_CRC,
    KEY_SIZE_MD5, KEY_SIZE_SHA1,
};
use crate::types::{Dat, Rom};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const DATS_DB_NAME: &str = "dats_db";
const CRC_DB_NAME: &str = "crc_db";
const MD5_DB_NAME: &str = "md5_db";
const SHA1_DB_NAME: &str = "sha1_db";
const CRCSHA1_DB_NAME: &str = "crcsha1_db";
const MD5SHA1_DB_NAME: &str = "md5sha1_db";

const GENERATION_FILE: &str = "generation";

/// A batch auto-flushes once its buffered writes pass this size.
const BATCH_FLUSH_THRESHOLD: u64 = 16 * 1024 * 1024;

/// The six-map rom/catalog index
pub struct RomIndex {
    path: PathBuf,
    generation: RwLock<u64>,
    dats: Box<dyn KvStore>,
    crc: Box<dyn KvStore>,
    md5: Box<dyn KvStore>,
    sha1: Box<dyn KvStore>,
    crcsha1: Box<dyn KvStore>,
    md5sha1: Box<dyn KvStore>,
}

impl RomIndex {
    /// Open an index with the default store backend
    pub fn open(path: &Path) -> Result<RomIndex> {
        RomIndex::open_with(path, default_store_opener)
    }

    /// Open an index with a caller-chosen store backend
    pub fn open_with(path: &Path, opener: StoreOpener) -> Result<RomIndex> {
        fs::create_dir_all(path)?;

        let generation = read_generation_file(path)?;
        info!("opening rom index at {:?} (generation {})", path, generation);

        Ok(RomIndex {
            path: path.to_path_buf(),
            generation: RwLock::new(generation),
            dats: opener(&path.join(DATS_DB_NAME), KEY_SIZE_SHA1)?,
            crc: opener(&path.join(CRC_DB_NAME), KEY_SIZE_CRC)?,
            md5: opener(&path.join(MD5_DB_NAME), KEY_SIZE_MD5)?,
            sha1: opener(&path.join(SHA1_DB_NAME), KEY_SIZE_SHA1)?,
            crcsha1: opener(&path.join(CRCSHA1_DB_NAME), KEY_SIZE_CRC)?,
            md5sha1: opener(&path.join(MD5SHA1_DB_NAME), KEY_SIZE_MD5)?,
        })
    }

    /// The current generation
    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    /// Invalidate all previously indexed non-artificial Dats
    ///
    /// Bumps the generation counter and persists it. Nothing is deleted;
    /// reachability queries simply stop matching older generations.
    pub fn orphan_dats(&self) -> Result<()> {
        let mut generation = self.generation.write();
        *generation += 1;
        write_generation_file(&self.path, *generation)?;
        info!("orphaned dats: generation is now {}", *generation);
        Ok(())
    }

    /// Fetch and decode a Dat by its identity digest
    ///
    /// An absent key is `Ok(None)`. An undecodable value is treated the
    /// same way: a corrupt catalog behaves like a missing one.
    pub fn get_dat(&self, sha1_bytes: &[u8]) -> Result<Option<Dat>> {
        let Some(encoded) = self.dats.get(sha1_bytes)? else {
            return Ok(None);
        };
        match Dat::decode(&encoded) {
            Ok(dat) => Ok(Some(dat)),
            Err(err) => {
                warn!(
                    "undecodable dat under {}: {}",
                    hex::encode(sha1_bytes),
                    err
                );
                Ok(None)
            }
        }
    }

    /// Resolve the Dats referencing a rom
    ///
    /// Tiered lookup: the rom's SHA1 candidates first, then MD5, then CRC.
    /// The first non-empty tier wins; tiers are never unioned. Within a
    /// tier, Dats come back in insertion order.
    pub fn dats_for_rom(&self, rom: &Rom) -> Result<Vec<Dat>> {
        let mut dat_sha1s: Option<Vec<u8>> = None;

        for candidate in rom.sha1_candidates() {
            if let Some(found) = self.sha1.get(candidate)? {
                if !found.is_empty() {
                    dat_sha1s = Some(found);
                    break;
                }
            }
        }
        if dat_sha1s.is_none() {
            if let Some(md5) = &rom.md5 {
                dat_sha1s = self.md5.get(md5)?.filter(|v| !v.is_empty());
            }
        }
        if dat_sha1s.is_none() {
            if let Some(crc) = &rom.crc {
                dat_sha1s = self.crc.get(crc)?.filter(|v| !v.is_empty());
            }
        }

        let Some(dat_sha1s) = dat_sha1s else {
            return Ok(Vec::new());
        };

        let mut dats = Vec::new();
        for sha1_bytes in dat_sha1s.chunks_exact(KEY_SIZE_SHA1) {
            if let Some(dat) = self.get_dat(sha1_bytes)? {
                dats.push(dat);
            }
        }
        Ok(dats)
    }

    /// Fill in a missing SHA1 from the digest cross-link maps
    ///
    /// Consults `md5sha1_db` first, then `crcsha1_db`, and takes the first
    /// 20 bytes of the stored union. A rom that already has a SHA1 is left
    /// untouched.
    pub fn complete_rom(&self, rom: &mut Rom) -> Result<()> {
        if rom.sha1.is_some() {
            return Ok(());
        }

        if let Some(md5) = &rom.md5 {
            if let Some(found) = self.md5sha1.get(md5)? {
                if found.len() >= KEY_SIZE_SHA1 {
                    rom.sha1 = Some(found[..KEY_SIZE_SHA1].to_vec());
                    return Ok(());
                }
            }
        }
        if let Some(crc) = &rom.crc {
            if let Some(found) = self.crcsha1.get(crc)? {
                if found.len() >= KEY_SIZE_SHA1 {
                    rom.sha1 = Some(found[..KEY_SIZE_SHA1].to_vec());
                }
            }
        }
        Ok(())
    }

    /// Index a single rom through a one-shot batch
    pub fn index_rom(&self, rom: &Rom) -> Result<()> {
        let mut batch = self.batch();
        batch.index_rom(rom)?;
        batch.close()
    }

    /// Index a single Dat through a one-shot batch
    pub fn index_dat(&self, dat: &Dat, sha1_bytes: &[u8]) -> Result<()> {
        let mut batch = self.batch();
        batch.index_dat(dat, sha1_bytes)?;
        batch.close()
    }

    /// Start a batch spanning all six stores
    pub fn batch(&self) -> IndexBatch<'_> {
        IndexBatch {
            index: self,
            dats: WriteBatch::new(KEY_SIZE_SHA1),
            crc: WriteBatch::new(KEY_SIZE_CRC),
            md5: WriteBatch::new(KEY_SIZE_MD5),
            sha1: WriteBatch::new(KEY_SIZE_SHA1),
            crcsha1: WriteBatch::new(KEY_SIZE_CRC),
            md5sha1: WriteBatch::new(KEY_SIZE_MD5),
        }
    }

    /// Bracket a full catalog re-import over `dats_db`
    pub fn begin_dat_refresh(&self) -> Result<()> {
        self.dats.begin_refresh()
    }

    /// Close the catalog re-import bracket
    pub fn end_dat_refresh(&self) -> Result<()> {
        self.dats.end_refresh()
    }

    /// Flush all six stores
    pub fn flush(&self) -> Result<()> {
        self.dats.flush()?;
        self.crc.flush()?;
        self.md5.flush()?;
        self.sha1.flush()?;
        self.crcsha1.flush()?;
        self.md5sha1.flush()?;
        Ok(())
    }

    /// Flush and close all six stores
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.dats.close()?;
        self.crc.close()?;
        self.md5.close()?;
        self.sha1.close()?;
        self.crcsha1.close()?;
        self.md5sha1.close()?;
        Ok(())
    }

    #[cfg(test)]
    fn raw_sha1_db(&self) -> &dyn KvStore {
        self.sha1.as_ref()
    }

    #[cfg(test)]
    fn raw_md5sha1_db(&self) -> &dyn KvStore {
        self.md5sha1.as_ref()
    }
}

/// A write batch spanning the six index stores
///
/// Writes accumulate per store and are committed together by [`flush`]
/// (`dats` first, cross-link maps last). Batches auto-flush once the
/// buffered bytes pass an internal threshold, so long ingest runs can
/// keep one batch open per worker. There is no cross-store rollback: a
/// partial failure is surfaced and recovery is re-running the ingest,
/// which the append-union semantics make idempotent.
///
/// [`flush`]: IndexBatch::flush
pub struct IndexBatch<'a> {
    index: &'a RomIndex,
    dats: WriteBatch,
    crc: WriteBatch,
    md5: WriteBatch,
    sha1: WriteBatch,
    crcsha1: WriteBatch,
    md5sha1: WriteBatch,
}

impl<'a> IndexBatch<'a> {
    /// Bytes buffered across all six sub-batches
    pub fn pending_bytes(&self) -> u64 {
        self.dats.pending_bytes()
            + self.crc.pending_bytes()
            + self.md5.pending_bytes()
            + self.sha1.pending_bytes()
            + self.crcsha1.pending_bytes()
            + self.md5sha1.pending_bytes()
    }

    /// Index one scanned rom
    ///
    /// Establishes the digest cross-links (`crc -> sha1`, `md5 -> sha1`),
    /// then resolves the referencing Dats. If at least one Dat already
    /// references the rom, `sha1_db` is seeded with every Dat identity
    /// reachable through the rom's weaker hashes. If none does, an
    /// artificial Dat wrapping just this rom is synthesized and indexed so
    /// the payload stays reachable.
    pub fn index_rom(&mut self, rom: &Rom) -> Result<()> {
        trace!("indexing rom {}", rom.name);

        if let Some(sha1) = rom.single_sha1() {
            if let Some(crc) = &rom.crc {
                self.crcsha1.append(crc, sha1)?;
            }
            if let Some(md5) = &rom.md5 {
                self.md5sha1.append(md5, sha1)?;
            }
        } else {
            warn!("indexing rom {} with missing SHA1", rom.name);
        }

        let dats = self.index.dats_for_rom(rom)?;
        if !dats.is_empty() {
            trace!("rom {} already referenced by {} dat(s)", rom.name, dats.len());

            if let Some(sha1) = rom.single_sha1() {
                let seeded = self.index.sha1.get(sha1)?.map_or(false, |v| !v.is_empty());
                if !seeded {
                    let mut dat_sha1s = Vec::new();
                    if let Some(md5) = &rom.md5 {
                        if let Some(found) = self.index.md5.get(md5)? {
                            merge_union(&mut dat_sha1s, &found);
                        }
                    }
                    if let Some(crc) = &rom.crc {
                        if let Some(found) = self.index.crc.get(crc)? {
                            merge_union(&mut dat_sha1s, &found);
                        }
                    }
                    if !dat_sha1s.is_empty() {
                        self.sha1.set(sha1, &dat_sha1s)?;
                    }
                }
            }
            return self.maybe_flush();
        }

        trace!("rom {} not referenced by any dat, building artificial dat", rom.name);
        let dat = Dat::artificial_for(rom.clone(), self.index.generation());
        let sha1_bytes = dat.sha1_bytes()?;
        self.index_dat(&dat, &sha1_bytes)
    }

    /// Index one Dat under its identity digest
    ///
    /// The Dat is stamped with the current generation and written to
    /// `dats_db` unconditionally (re-indexing refreshes the stamp). The
    /// union maps are only traversed for Dats not already present.
    /// Artificial Dats always count as new; their identity covers their
    /// content.
    pub fn index_dat(&mut self, dat: &Dat, sha1_bytes: &[u8]) -> Result<()> {
        debug!("indexing dat {}", dat.name);

        if sha1_bytes.len() != KEY_SIZE_SHA1 {
            return Err(DepotError::KeySize {
                expected: KEY_SIZE_SHA1,
                actual: sha1_bytes.len(),
            });
        }

        let mut stamped = dat.clone();
        stamped.generation = self.index.generation();
        let encoded = stamped.encode()?;

        let exists = if stamped.artificial {
            false
        } else {
            self.index.dats.exists(sha1_bytes)?
        };

        self.dats.set(sha1_bytes, &encoded)?;

        if !exists {
            for game in &stamped.games {
                trace!("indexing game {}", game.name);
                for rom in &game.roms {
                    if let Some(sha1) = rom.single_sha1() {
                        self.sha1.append(sha1, sha1_bytes)?;
                    }
                    if let Some(md5) = &rom.md5 {
                        self.md5.append(md5, sha1_bytes)?;
                        if let Some(sha1) = rom.single_sha1() {
                            self.md5sha1.append(md5, sha1)?;
                        }
                    }
                    if let Some(crc) = &rom.crc {
                        self.crc.append(crc, sha1_bytes)?;
                        if let Some(sha1) = rom.single_sha1() {
                            self.crcsha1.append(crc, sha1)?;
                        }
                    }
                }
            }
        }

        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.pending_bytes() > BATCH_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Commit all six sub-batches in order and clear them
    pub fn flush(&mut self) -> Result<()> {
        self.index.dats.write_batch(&self.dats)?;
        self.dats.clear();
        self.index.crc.write_batch(&self.crc)?;
        self.crc.clear();
        self.index.md5.write_batch(&self.md5)?;
        self.md5.clear();
        self.index.sha1.write_batch(&self.sha1)?;
        self.sha1.clear();
        self.index.crcsha1.write_batch(&self.crcsha1)?;
        self.crcsha1.clear();
        self.index.md5sha1.write_batch(&self.md5sha1)?;
        self.md5sha1.clear();
        Ok(())
    }

    /// Flush and consume the batch
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

fn read_generation_file(path: &Path) -> Result<u64> {
    let file = path.join(GENERATION_FILE);
    if !file.exists() {
        write_generation_file(path, 0)?;
        return Ok(0);
    }
    let text = fs::read_to_string(&file)?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| DepotError::storage(format!("unparseable generation file {file:?}")))
}

fn write_generation_file(path: &Path, generation: u64) -> Result<()> {
    fs::write(path.join(GENERATION_FILE), generation.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::{Hashes, SHA1_SIZE};
    use crate::types::Game;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn rom_for(payload: &[u8], name: &str) -> Rom {
        let (hh, size) = Hashes::for_reader(payload).unwrap();
        Rom::from_hashes(name.to_string(), PathBuf::from("/in").join(name), size, &hh)
    }

    fn dat_with(roms: Vec<Rom>, name: &str) -> Dat {
        Dat {
            name: name.to_string(),
            description: String::new(),
            path: Some(PathBuf::from(format!("/dats/{name}.dat"))),
            generation: 0,
            artificial: false,
            games: vec![Game {
                name: format!("{name} game"),
                description: String::new(),
                roms,
            }],
        }
    }

    #[test]
    fn test_index_dat_then_lookup_each_tier() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let rom = rom_for(b"payload one", "one.bin");
        let dat = dat_with(vec![rom.clone()], "set-a");
        let dat_sha1 = dat.sha1_bytes().unwrap();
        index.index_dat(&dat, &dat_sha1).unwrap();

        // Full digests: resolved through the sha1 tier.
        let dats = index.dats_for_rom(&rom).unwrap();
        assert_eq!(dats.len(), 1);
        assert_eq!(dats[0].name, "set-a");

        // MD5 only.
        let md5_only = Rom {
            md5: rom.md5.clone(),
            ..Default::default()
        };
        assert_eq!(index.dats_for_rom(&md5_only).unwrap().len(), 1);

        // CRC only.
        let crc_only = Rom {
            crc: rom.crc.clone(),
            ..Default::default()
        };
        assert_eq!(index.dats_for_rom(&crc_only).unwrap().len(), 1);

        // Unknown rom.
        let unknown = rom_for(b"unknown payload", "unknown.bin");
        assert!(index.dats_for_rom(&unknown).unwrap().is_empty());
    }

    #[test]
    fn test_index_rom_synthesizes_artificial_dat() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let rom = rom_for(b"orphan payload", "orphan.bin");
        index.index_rom(&rom).unwrap();

        let dats = index.dats_for_rom(&rom).unwrap();
        assert_eq!(dats.len(), 1);
        assert!(dats[0].artificial);
        assert_eq!(dats[0].name, "Artificial Dat for orphan.bin");

        // The artificial Dat is dereferenceable through dats_db.
        let id = dats[0].sha1_bytes().unwrap();
        assert!(index.get_dat(&id).unwrap().is_some());
    }

    #[test]
    fn test_index_rom_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let rom = rom_for(b"repeat payload", "repeat.bin");
        index.index_rom(&rom).unwrap();
        index.index_rom(&rom).unwrap();
        index.index_rom(&rom).unwrap();

        // Exactly one artificial Dat, and the cross-link holds the rom
        // SHA1 exactly once.
        assert_eq!(index.dats_for_rom(&rom).unwrap().len(), 1);
        let links = index
            .raw_md5sha1_db()
            .get(rom.md5.as_ref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(links.len(), SHA1_SIZE);
        assert_eq!(&links, rom.sha1.as_ref().unwrap());
    }

    #[test]
    fn test_index_rom_seeds_sha1_tier_from_weaker_hashes() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        // The catalog only knows the weaker digests.
        let full = rom_for(b"weakly cataloged", "weak.bin");
        let cataloged = Rom {
            name: full.name.clone(),
            size: full.size,
            crc: full.crc.clone(),
            md5: full.md5.clone(),
            sha1: None,
            path: None,
        };
        let dat = dat_with(vec![cataloged], "weak-set");
        let dat_sha1 = dat.sha1_bytes().unwrap();
        index.index_dat(&dat, &dat_sha1).unwrap();

        // Before the scan, the sha1 tier knows nothing.
        assert!(index
            .raw_sha1_db()
            .get(full.single_sha1().unwrap())
            .unwrap()
            .is_none());

        // Scanning the payload fills the sha1 tier from md5/crc.
        index.index_rom(&full).unwrap();
        let seeded = index
            .raw_sha1_db()
            .get(full.single_sha1().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(seeded, dat_sha1.to_vec());

        // And the rom now resolves through the sha1 tier to a real dat.
        let dats = index.dats_for_rom(&full).unwrap();
        assert_eq!(dats.len(), 1);
        assert!(!dats[0].artificial);
    }

    #[test]
    fn test_complete_rom() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let full = rom_for(b"completable", "comp.bin");
        index.index_rom(&full).unwrap();

        let mut md5_only = Rom {
            md5: full.md5.clone(),
            ..Default::default()
        };
        index.complete_rom(&mut md5_only).unwrap();
        assert_eq!(md5_only.sha1, full.sha1);

        let mut crc_only = Rom {
            crc: full.crc.clone(),
            ..Default::default()
        };
        index.complete_rom(&mut crc_only).unwrap();
        assert_eq!(crc_only.sha1, full.sha1);

        // A rom that already has a SHA1 keeps it.
        let mut untouched = full.clone();
        untouched.md5 = None;
        index.complete_rom(&mut untouched).unwrap();
        assert_eq!(untouched.sha1, full.sha1);
    }

    #[test]
    fn test_generation_bump_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let index = RomIndex::open(dir.path()).unwrap();
            assert_eq!(index.generation(), 0);
            index.orphan_dats().unwrap();
            index.orphan_dats().unwrap();
            assert_eq!(index.generation(), 2);
            index.close().unwrap();
        }
        let index = RomIndex::open(dir.path()).unwrap();
        assert_eq!(index.generation(), 2);
    }

    #[test]
    fn test_reindex_refreshes_generation_stamp() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let rom = rom_for(b"stamped", "stamp.bin");
        let dat = dat_with(vec![rom.clone()], "stamp-set");
        let dat_sha1 = dat.sha1_bytes().unwrap();
        index.index_dat(&dat, &dat_sha1).unwrap();
        assert_eq!(index.get_dat(&dat_sha1).unwrap().unwrap().generation, 0);

        index.orphan_dats().unwrap();
        index.index_dat(&dat, &dat_sha1).unwrap();
        assert_eq!(index.get_dat(&dat_sha1).unwrap().unwrap().generation, 1);
    }

    #[test]
    fn test_corrupt_dat_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let index = RomIndex::open(dir.path()).unwrap();

        let key = [7u8; KEY_SIZE_SHA1];
        index.dats.set(&key, b"\xff\xff not a dat").unwrap();
        assert!(index.get_dat(&key).unwrap().is_none());
    }
}
