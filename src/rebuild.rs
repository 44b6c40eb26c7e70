//! Game rebuilder
//!
//! Reconstructs named archive files from depot blobs. A game rebuilds as
//! `<game name>.zip` with fixed compression options, a fixed timestamp
//! and entries sorted by name, so rebuilding the same game twice yields a
//! byte-identical archive.
//!
//! Roms that cannot be rebuilt (missing SHA1, or no blob in any root)
//! are collected into a shadow "fix" catalog describing exactly what is
//! missing. Emission of that catalog in DAT format is an external
//! collaborator's job, reached through the [`DatEmitter`] seam.

use crate::blob;
use crate::depot::Depot;
use crate::error::Result;
use crate::types::{Dat, Game, Rom};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// External serializer for fix catalogs
///
/// The DAT file format is out of this crate's hands; rebuild passes the
/// composed fix catalog to whatever emitter the caller supplies.
pub type DatEmitter<'a> = &'a dyn Fn(&Dat, &mut dyn Write) -> Result<()>;

const FIX_PREFIX: &str = "fix_";
const DAT_SUFFIX: &str = ".dat";
const ZIP_SUFFIX: &str = ".zip";

/// Fixed deflate level for rebuilt archives
const REBUILD_COMPRESSION_LEVEL: i32 = 6;

fn rebuild_options() -> FileOptions {
    // Fixed options keep rebuilt archives byte-identical across runs:
    // same method, same level, and the epoch timestamp (1980-01-01).
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(REBUILD_COMPRESSION_LEVEL))
        .last_modified_time(zip::DateTime::default())
}

impl Depot {
    /// Rebuild every game of a catalog under `outdir/<dat name>/`
    ///
    /// Unresolved games accumulate into a fix catalog; if any exist, a
    /// `fix_<dat name>.dat` companion is written next to the output
    /// directory through `emit_fix`. Returns `true` iff every game was
    /// fully rebuilt.
    pub fn build_dat(&self, dat: &Dat, outdir: &Path, emit_fix: DatEmitter) -> Result<bool> {
        let dat_dir = outdir.join(&dat.name);
        fs::create_dir_all(&dat_dir)?;
        info!("building dat {} into {:?}", dat.name, dat_dir);

        let mut fix_games = Vec::new();
        for game in &dat.games {
            let game_path = dat_dir.join(format!("{}{ZIP_SUFFIX}", game.name));
            let (fix_game, found_any) = self.build_game(game, &game_path)?;
            if let Some(fix_game) = fix_game {
                fix_games.push(fix_game);
            }
            if !found_any {
                fs::remove_file(&game_path)?;
            }
        }

        if fix_games.is_empty() {
            return Ok(true);
        }

        let fix_dat = Dat {
            name: dat.name.clone(),
            description: dat.description.clone(),
            path: dat.path.clone(),
            generation: 0,
            artificial: false,
            games: fix_games,
        };
        let fix_path = outdir.join(format!("{FIX_PREFIX}{}{DAT_SUFFIX}", dat.name));
        debug!("writing fix dat {:?}", fix_path);
        let mut writer = BufWriter::new(File::create(&fix_path)?);
        emit_fix(&fix_dat, &mut writer)?;
        writer.flush()?;

        Ok(false)
    }

    /// Rebuild one game as a deterministic zip archive
    ///
    /// Returns the shadow game of unresolvable roms (if any) and whether
    /// at least one rom was found. An output file that ends up empty is
    /// the caller's to remove.
    fn build_game(&self, game: &Game, game_path: &Path) -> Result<(Option<Game>, bool)> {
        let file = File::create(game_path)?;
        let mut archive = ZipWriter::new(file);
        let options = rebuild_options();

        let mut fix_roms: Vec<Rom> = Vec::new();
        let mut found_any = false;

        // Sorted entries are part of the determinism contract.
        let mut roms: Vec<&Rom> = game.roms.iter().collect();
        roms.sort_by(|a, b| a.name.cmp(&b.name));

        for rom in roms {
            if rom.sha1.is_none() {
                warn!("game {} has rom with missing SHA1 {}", game.name, rom.name);
                fix_roms.push(rom.clone());
                continue;
            }

            let Some(blob_path) = self.find_rom_blob(rom)? else {
                warn!(
                    "game {} has missing rom {} (sha1 {})",
                    game.name,
                    rom.name,
                    rom.sha1_hex().unwrap_or_default()
                );
                fix_roms.push(rom.clone());
                continue;
            };

            found_any = true;
            archive.start_file(rom.name.clone(), options)?;
            let mut payload = blob::open_blob(&blob_path)?;
            io::copy(&mut payload, &mut archive)?;
        }

        archive.finish()?;

        let fix_game = if fix_roms.is_empty() {
            None
        } else {
            Some(Game {
                name: game.name.clone(),
                description: game.description.clone(),
                roms: fix_roms,
            })
        };
        Ok((fix_game, found_any))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depot::DepotRoot;
    use crate::hashes::Hashes;
    use crate::index::RomIndex;
    use crate::layout::{blob_path, GZIP_SUFFIX};
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn depot_with_payloads(payloads: &[&[u8]]) -> (Depot, TempDir, TempDir, Vec<Rom>) {
        let roots_dir = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let index = Arc::new(RomIndex::open(index_dir.path()).unwrap());
        let depot = Depot::new(
            vec![DepotRoot {
                path: roots_dir.path().join("root0"),
                max_size: 1 << 20,
            }],
            index,
        )
        .unwrap();

        let mut roms = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let (hh, size) = Hashes::for_reader(*payload).unwrap();
            let out = blob_path(&depot.roots()[0], &hh.sha1_hex(), GZIP_SUFFIX);
            crate::blob::archive_blob(&out, *payload, &hh.md5crc()).unwrap();
            roms.push(Rom::from_hashes(
                format!("rom{i}.bin"),
                PathBuf::from(format!("/in/rom{i}.bin")),
                size,
                &hh,
            ));
        }
        (depot, roots_dir, index_dir, roms)
    }

    fn no_emitter() -> impl Fn(&Dat, &mut dyn Write) -> Result<()> {
        |_dat: &Dat, _w: &mut dyn Write| Ok(())
    }

    #[test]
    fn test_build_dat_complete() {
        let (depot, _r, _i, roms) = depot_with_payloads(&[b"alpha payload", b"beta payload"]);
        let out = TempDir::new().unwrap();

        let dat = Dat {
            name: "complete-set".to_string(),
            games: vec![Game {
                name: "game".to_string(),
                description: String::new(),
                roms,
            }],
            ..Default::default()
        };

        let emit = no_emitter();
        assert!(depot.build_dat(&dat, out.path(), &emit).unwrap());

        // The archive holds both payloads under their rom names.
        let zip_path = out.path().join("complete-set").join("game.zip");
        let mut archive = ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = Vec::new();
        archive
            .by_name("rom0.bin")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"alpha payload");

        // No fix dat was written.
        assert!(!out.path().join("fix_complete-set.dat").exists());
    }

    #[test]
    fn test_build_dat_is_deterministic() {
        let (depot, _r, _i, roms) = depot_with_payloads(&[b"first", b"second", b"third"]);

        let dat = Dat {
            name: "det".to_string(),
            games: vec![Game {
                name: "game".to_string(),
                description: String::new(),
                roms,
            }],
            ..Default::default()
        };

        let out_a = TempDir::new().unwrap();
        let out_b = TempDir::new().unwrap();
        let emit = no_emitter();
        depot.build_dat(&dat, out_a.path(), &emit).unwrap();
        depot.build_dat(&dat, out_b.path(), &emit).unwrap();

        let bytes_a = fs::read(out_a.path().join("det/game.zip")).unwrap();
        let bytes_b = fs::read(out_b.path().join("det/game.zip")).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_build_dat_records_missing_roms() {
        let (depot, _r, _i, mut roms) = depot_with_payloads(&[b"present payload"]);

        // One present rom, one whose blob does not exist, one without SHA1.
        let (absent_hashes, absent_size) = Hashes::for_reader(&b"never stored"[..]).unwrap();
        roms.push(Rom::from_hashes(
            "absent.bin".to_string(),
            PathBuf::from("/in/absent.bin"),
            absent_size,
            &absent_hashes,
        ));
        roms.push(Rom {
            name: "unhashed.bin".to_string(),
            ..Default::default()
        });

        let dat = Dat {
            name: "partial".to_string(),
            games: vec![Game {
                name: "game".to_string(),
                description: String::new(),
                roms,
            }],
            ..Default::default()
        };

        let out = TempDir::new().unwrap();
        let emitted: std::cell::RefCell<Option<Dat>> = std::cell::RefCell::new(None);
        let emit = |dat: &Dat, w: &mut dyn Write| -> Result<()> {
            *emitted.borrow_mut() = Some(dat.clone());
            w.write_all(b"fix dat placeholder")?;
            Ok(())
        };

        assert!(!depot.build_dat(&dat, out.path(), &emit).unwrap());

        // The partial archive still exists with the one found rom.
        let zip_path = out.path().join("partial").join("game.zip");
        let mut archive = ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);

        // The fix dat lists exactly the two unresolvable roms.
        let fix = emitted.borrow().clone().unwrap();
        assert_eq!(fix.games.len(), 1);
        let names: Vec<_> = fix.games[0].roms.iter().map(|r| r.name.clone()).collect();
        assert!(names.contains(&"absent.bin".to_string()));
        assert!(names.contains(&"unhashed.bin".to_string()));
        assert!(out.path().join("fix_partial.dat").exists());
    }

    #[test]
    fn test_build_dat_removes_empty_archives() {
        let (depot, _r, _i, _) = depot_with_payloads(&[]);

        let (hh, size) = Hashes::for_reader(&b"nowhere"[..]).unwrap();
        let dat = Dat {
            name: "empty".to_string(),
            games: vec![Game {
                name: "hollow".to_string(),
                description: String::new(),
                roms: vec![Rom::from_hashes(
                    "gone.bin".to_string(),
                    PathBuf::from("/in/gone.bin"),
                    size,
                    &hh,
                )],
            }],
            ..Default::default()
        };

        let out = TempDir::new().unwrap();
        let emit = no_emitter();
        assert!(!depot.build_dat(&dat, out.path(), &emit).unwrap());
        // Every rom was absent, so the empty archive was removed.
        assert!(!out.path().join("empty").join("hollow.zip").exists());
    }
}
