//! Compressed blob format
//!
//! A depot blob is a single gzip member holding the raw payload, followed
//! by a 20-byte trailer `md5(16) || crc32_be(4)` appended after the member
//! ends. The two halves never interfere:
//!
//! - a trailer reader takes the last 20 bytes of the file and never
//!   touches the deflate stream ([`hashes_for_blob`]);
//! - a gzip reader stops at the member boundary and never sees the
//!   trailer ([`open_blob`]).
//!
//! The compression level is fixed. Deduplication keys on the payload
//! digest rather than the blob bytes, but a fixed level keeps blob files
//! byte-identical across runs and versions, which keeps size accounting
//! and backup diffing stable.

use crate::error::{DepotError, Result};
use crate::hashes::{Hashes, SHA1_SIZE, TRAILER_SIZE};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{trace, warn};

/// Fixed compression level for every depot blob
const BLOB_COMPRESSION: u32 = 6;

/// Write a payload as a depot blob
///
/// Creates the output file (including shard directories), streams `reader`
/// through a gzip encoder at the fixed level, appends the 20-byte trailer
/// and returns the on-disk size of the finished blob. On any failure the
/// partial file is removed.
pub fn archive_blob<R: Read>(
    out_path: &Path,
    reader: R,
    trailer: &[u8; TRAILER_SIZE],
) -> Result<u64> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    match write_blob(out_path, reader, trailer) {
        Ok(size) => {
            trace!("wrote blob {:?} ({} bytes)", out_path, size);
            Ok(size)
        }
        Err(err) => {
            if let Err(rm_err) = fs::remove_file(out_path) {
                if rm_err.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove partial blob {:?}: {}", out_path, rm_err);
                }
            }
            Err(err)
        }
    }
}

fn write_blob<R: Read>(out_path: &Path, mut reader: R, trailer: &[u8]) -> Result<u64> {
    let file = File::create(out_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(BLOB_COMPRESSION));
    io::copy(&mut reader, &mut encoder)?;

    let mut writer = encoder.finish()?;
    writer.write_all(trailer)?;
    writer.flush()?;

    let file = writer
        .into_inner()
        .map_err(|e| DepotError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Read the digest triple of a blob without decompressing it
///
/// The MD5 and CRC come from the trailer; the SHA1 is decoded from the
/// file name (the depot stores blobs under their full hex digest).
pub fn hashes_for_blob(path: &Path) -> Result<Hashes> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| s.len() == SHA1_SIZE * 2)
        .ok_or_else(|| DepotError::MalformedPath(path.to_path_buf()))?;
    let sha1_vec =
        hex::decode(stem).map_err(|_| DepotError::MalformedPath(path.to_path_buf()))?;
    let mut sha1 = [0u8; SHA1_SIZE];
    sha1.copy_from_slice(&sha1_vec);

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < TRAILER_SIZE as u64 {
        return Err(DepotError::MalformedBlob(path.to_path_buf()));
    }

    file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
    let mut trailer = [0u8; TRAILER_SIZE];
    file.read_exact(&mut trailer)?;

    Ok(Hashes::from_trailer(&trailer, sha1))
}

/// Open a decompressing reader over a blob's payload
///
/// The returned reader yields the original payload bytes; the trailing
/// hash bytes after the gzip member are not part of the stream.
pub fn open_blob(path: &Path) -> Result<impl Read> {
    let file = File::open(path)?;
    Ok(GzDecoder::new(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{blob_path, GZIP_SUFFIX};
    use tempfile::TempDir;

    fn write_sample(dir: &Path, payload: &[u8]) -> (std::path::PathBuf, Hashes, u64) {
        let (hh, _) = Hashes::for_reader(payload).unwrap();
        let out = blob_path(dir, &hh.sha1_hex(), GZIP_SUFFIX);
        let size = archive_blob(&out, payload, &hh.md5crc()).unwrap();
        (out, hh, size)
    }

    #[test]
    fn test_blob_round_trip() {
        let dir = TempDir::new().unwrap();
        let payload = b"hello world\n";
        let (out, hh, size) = write_sample(dir.path(), payload);

        assert!(out.exists());
        assert_eq!(size, fs::metadata(&out).unwrap().len());
        assert!(size > TRAILER_SIZE as u64);

        let mut back = Vec::new();
        open_blob(&out).unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, payload);

        let trailer_hashes = hashes_for_blob(&out).unwrap();
        assert_eq!(trailer_hashes, hh);
    }

    #[test]
    fn test_blob_bytes_are_deterministic() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let payload = b"the same payload twice".repeat(100);

        let (out_a, _, _) = write_sample(dir_a.path(), &payload);
        let (out_b, _, _) = write_sample(dir_b.path(), &payload);
        assert_eq!(fs::read(out_a).unwrap(), fs::read(out_b).unwrap());
    }

    #[test]
    fn test_partial_output_removed_on_failure() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "simulated read failure"))
            }
        }

        let dir = TempDir::new().unwrap();
        let out = dir.path().join("aa").join("deadbeef.gz");
        let err = archive_blob(&out, FailingReader, &[0u8; TRAILER_SIZE]).unwrap_err();
        assert!(matches!(err, DepotError::Io(_)));
        assert!(!out.exists());
    }

    #[test]
    fn test_short_blob_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir
            .path()
            .join("22596363b3de40b06f981fb85d82312e8c0ed511.gz");
        fs::write(&path, [0u8; 5]).unwrap();
        assert!(matches!(
            hashes_for_blob(&path),
            Err(DepotError::MalformedBlob(_))
        ));
    }

    #[test]
    fn test_bad_file_name_is_malformed_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-a-digest.gz");
        fs::write(&path, [0u8; 32]).unwrap();
        assert!(matches!(
            hashes_for_blob(&path),
            Err(DepotError::MalformedPath(_))
        ));
    }
}
