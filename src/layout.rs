//! Depot on-disk layout
//!
//! A depot root stores one gzip blob per distinct payload, sharded four
//! levels deep by the hex prefix of the payload's SHA1:
//!
//! ```text
//! <root>/.size                            # UTF-8 decimal used-bytes counter
//! <root>/22/59/63/63/2259...d511.gz       # compressed payload
//! ```
//!
//! Two hex characters per level keeps directory fanout at 256 regardless
//! of depot size. The full digest stays in the file name so a blob path is
//! self-describing: [`rom_from_blob_path`] recovers the strong digest from
//! the path alone, which is what the purge walk relies on.

use crate::error::{DepotError, Result};
use crate::hashes::SHA1_SIZE;
use crate::types::Rom;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix of depot blob files
pub const GZIP_SUFFIX: &str = ".gz";
/// Suffix of zip containers recognized during ingest
pub const ZIP_SUFFIX: &str = ".zip";

/// Number of two-character shard levels below a root
const SHARD_DEPTH: usize = 4;
/// Name of the per-root size accounting file
const SIZE_FILE: &str = ".size";

/// Compute the sharded path of a blob below a root
///
/// `sha1_hex` must be the lowercase hex encoding of a 20-byte digest;
/// `suffix` is appended verbatim (normally [`GZIP_SUFFIX`]).
pub fn blob_path(root: &Path, sha1_hex: &str, suffix: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for level in 0..SHARD_DEPTH {
        path.push(&sha1_hex[level * 2..level * 2 + 2]);
    }
    path.push(format!("{sha1_hex}{suffix}"));
    path
}

/// Recover a rom skeleton from a depot blob path
///
/// The file stem is the full hex digest; the four shard directories must
/// match its prefix. Returns a rom carrying only the SHA1 (the other
/// digests live in the blob trailer).
///
/// # Errors
///
/// [`DepotError::MalformedPath`] if the depth is wrong, the stem is not
/// 40 hex characters, or the shard directories disagree with the stem.
pub fn rom_from_blob_path(path: &Path) -> Result<Rom> {
    let malformed = || DepotError::MalformedPath(path.to_path_buf());

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(malformed)?;
    if stem.len() != SHA1_SIZE * 2 {
        return Err(malformed());
    }
    let sha1 = hex::decode(stem).map_err(|_| malformed())?;

    // Walk the shard directories back up and check them against the stem.
    let mut dir = path.parent();
    for level in (0..SHARD_DEPTH).rev() {
        let parent = dir.ok_or_else(malformed)?;
        let segment = parent
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(malformed)?;
        if segment != &stem[level * 2..level * 2 + 2] {
            return Err(malformed());
        }
        dir = parent.parent();
    }

    Ok(Rom {
        name: stem.to_string(),
        sha1: Some(sha1),
        path: Some(path.to_path_buf()),
        ..Default::default()
    })
}

/// Read a root's persisted size, if the `.size` file exists
pub fn read_size_file(root: &Path) -> Result<Option<u64>> {
    let path = root.join(SIZE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    text.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| DepotError::storage(format!("unparseable size file {path:?}")))
}

/// Persist a root's size counter
pub fn write_size_file(root: &Path, size: u64) -> Result<()> {
    fs::write(root.join(SIZE_FILE), size.to_string())?;
    Ok(())
}

/// Establish the used size of a root
///
/// Prefers the persisted `.size` file; falls back to summing every blob
/// under the root and writes the result so the next open is cheap.
pub fn establish_size(root: &Path) -> Result<u64> {
    if let Some(size) = read_size_file(root)? {
        return Ok(size);
    }

    debug!("no size file in {:?}, scanning blobs", root);
    let mut size = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().map_or(false, |e| e == "gz")
        {
            size += entry.metadata()?.len();
        }
    }
    write_size_file(root, size)?;
    Ok(size)
}

/// Move a file, creating destination parents
///
/// Tries a rename first and falls back to copy-then-delete when the
/// destination is on another filesystem.
pub fn mv(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)?;
    if let Err(err) = fs::remove_file(src) {
        warn!("moved {:?} but could not remove source: {}", src, err);
        return Err(err.into());
    }
    Ok(())
}

/// Longest shared path prefix of two paths
pub fn common_root(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// Longest shared path prefix of a set of paths
pub fn common_root_of(paths: &[PathBuf]) -> PathBuf {
    match paths.split_first() {
        None => PathBuf::new(),
        Some((first, rest)) => rest
            .iter()
            .fold(first.clone(), |acc, p| common_root(&acc, p)),
    }
}

/// Format a byte count for logs
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
