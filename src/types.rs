//! Catalog data types
//!
//! The catalog model is a two-level tree: a [`Dat`] names a set of
//! [`Game`]s, each of which groups [`Rom`]s. Roms are transient: scanners
//! create them, the index consumes them, and only their digests survive in
//! the stores. Dats persist in serialized form and are identified by the
//! SHA1 of that encoding.
//!
//! ## Encoding stability
//!
//! A Dat's identity digest is SHA1 over its bincode encoding, so the
//! encoder is pinned to one bincode major version in `Cargo.toml`.
//! Changing the encoder changes every Dat identity and effectively
//! invalidates the index.

use crate::error::Result;
use crate::hashes::{self, Hashes, CRC_SIZE, MD5_SIZE, SHA1_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One cataloged payload
///
/// A rom as a catalog describes it: a name, a size and up to three
/// digests. The `sha1` field normally holds exactly 20 bytes; it may also
/// hold a multiple of 20 bytes when weaker-hash lookups produced several
/// candidate strong digests (a collision set). At ingest a rom always has
/// exactly 20.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rom {
    /// Name as cataloged (entry name inside a game archive)
    pub name: String,
    /// Payload size in bytes
    pub size: u64,
    /// CRC32, big-endian, 4 bytes when present
    pub crc: Option<Vec<u8>>,
    /// MD5, 16 bytes when present
    pub md5: Option<Vec<u8>>,
    /// SHA1: 20 bytes, or a multiple of 20 for a collision set
    pub sha1: Option<Vec<u8>>,
    /// Origin hint: where the payload was first seen
    pub path: Option<PathBuf>,
}

impl Rom {
    /// Build a rom from a freshly computed digest triple
    pub fn from_hashes(name: String, path: PathBuf, size: u64, hh: &Hashes) -> Rom {
        Rom {
            name,
            size,
            crc: Some(hh.crc.to_vec()),
            md5: Some(hh.md5.to_vec()),
            sha1: Some(hh.sha1.to_vec()),
            path: Some(path),
        }
    }

    /// The single 20-byte SHA1, if this rom carries exactly one
    pub fn single_sha1(&self) -> Option<&[u8]> {
        match &self.sha1 {
            Some(v) if v.len() == SHA1_SIZE => Some(v.as_slice()),
            _ => None,
        }
    }

    /// True if the sha1 field holds more than one candidate digest
    pub fn has_collision_set(&self) -> bool {
        matches!(&self.sha1, Some(v) if v.len() > SHA1_SIZE && v.len() % SHA1_SIZE == 0)
    }

    /// Iterate the candidate SHA1s (one for the normal case)
    pub fn sha1_candidates(&self) -> impl Iterator<Item = &[u8]> {
        self.sha1
            .as_deref()
            .unwrap_or(&[])
            .chunks_exact(SHA1_SIZE)
    }

    /// Lowercase hex of the first SHA1 candidate, for logging
    pub fn sha1_hex(&self) -> Option<String> {
        self.sha1_candidates().next().map(hex::encode)
    }

    /// Validate digest widths (4/16/20) where fields are present
    pub fn digests_well_formed(&self) -> bool {
        self.crc.as_ref().map_or(true, |c| c.len() == CRC_SIZE)
            && self.md5.as_ref().map_or(true, |m| m.len() == MD5_SIZE)
            && self
                .sha1
                .as_ref()
                .map_or(true, |s| !s.is_empty() && s.len() % SHA1_SIZE == 0)
    }
}

/// A named group of roms; the unit of rebuild output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    /// Game name; rebuilt as `<name>.zip`
    pub name: String,
    /// Free-form description from the catalog
    pub description: String,
    /// Constituent roms
    pub roms: Vec<Rom>,
}

/// A catalog of games
///
/// Dats come from catalog files parsed by an external collaborator, or are
/// synthesized as artificial wrappers around a single unclassified rom so
/// that every stored payload stays indexable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dat {
    /// Catalog name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Location of the source catalog file
    pub path: Option<PathBuf>,
    /// Generation this Dat was last indexed at; compared against the
    /// index's current generation for reachability
    pub generation: u64,
    /// True for synthesized single-rom wrappers
    pub artificial: bool,
    /// The cataloged games
    pub games: Vec<Game>,
}

impl Dat {
    /// Serialize to the durable index encoding
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Deserialize from the durable index encoding
    pub fn decode(bytes: &[u8]) -> Result<Dat> {
        let (dat, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(dat)
    }

    /// Identity digest: SHA1 over the serialized form
    pub fn sha1_bytes(&self) -> Result<[u8; SHA1_SIZE]> {
        Ok(hashes::sha1_bytes(&self.encode()?))
    }

    /// Synthesize an artificial Dat wrapping a single rom
    ///
    /// Used when a scanned payload is not referenced by any real catalog;
    /// wrapping it keeps the payload reachable through the index.
    pub fn artificial_for(rom: Rom, generation: u64) -> Dat {
        let name = format!("Artificial Dat for {}", rom.name);
        let path = rom.path.clone();
        Dat {
            name,
            description: String::new(),
            path,
            generation,
            artificial: true,
            games: vec![Game {
                name: String::new(),
                description: String::new(),
                roms: vec![rom],
            }],
        }
    }
}
