//! Streaming digest computation
//!
//! Every payload entering the depot is identified by three digests: CRC32
//! (the weakest, what most catalogs carry), MD5, and SHA1 (the strong key
//! the depot is addressed by). All three are computed in a single buffered
//! pass over a reader; no seeking is required, so the same code path serves
//! loose files, zip entries and gzip streams.

use crate::error::Result;
use md5::Md5;
use sha1::{Digest, Sha1};
use std::io::Read;

/// Width of a CRC32 digest in bytes
pub const CRC_SIZE: usize = 4;
/// Width of an MD5 digest in bytes
pub const MD5_SIZE: usize = 16;
/// Width of a SHA1 digest in bytes
pub const SHA1_SIZE: usize = 20;

/// Width of the MD5+CRC blob trailer in bytes
pub const TRAILER_SIZE: usize = MD5_SIZE + CRC_SIZE;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// The digest triple of one payload
///
/// CRC bytes are stored big-endian, matching the byte order catalogs use
/// and the order the blob trailer is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hashes {
    /// CRC32 of the payload, big-endian
    pub crc: [u8; CRC_SIZE],
    /// MD5 of the payload
    pub md5: [u8; MD5_SIZE],
    /// SHA1 of the payload
    pub sha1: [u8; SHA1_SIZE],
}

impl Hashes {
    /// Compute all three digests over a reader in one pass
    ///
    /// The reader is consumed to EOF. Fails only if the underlying read
    /// fails.
    ///
    /// # Example
    ///
    /// ```rust
    /// use romdepot::hashes::Hashes;
    ///
    /// let (hh, size) = Hashes::for_reader(&b"hello world\n"[..]).unwrap();
    /// assert_eq!(size, 12);
    /// assert_eq!(hh.sha1_hex(), "22596363b3de40b06f981fb85d82312e8c0ed511");
    /// ```
    pub fn for_reader<R: Read>(mut reader: R) -> Result<(Hashes, u64)> {
        let mut crc = crc32fast::Hasher::new();
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();

        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            crc.update(chunk);
            md5.update(chunk);
            sha1.update(chunk);
            total += n as u64;
        }

        Ok((
            Hashes {
                crc: crc.finalize().to_be_bytes(),
                md5: md5.finalize().into(),
                sha1: sha1.finalize().into(),
            },
            total,
        ))
    }

    /// The 20-byte blob trailer: `md5(16) || crc32_be(4)`
    pub fn md5crc(&self) -> [u8; TRAILER_SIZE] {
        let mut trailer = [0u8; TRAILER_SIZE];
        trailer[..MD5_SIZE].copy_from_slice(&self.md5);
        trailer[MD5_SIZE..].copy_from_slice(&self.crc);
        trailer
    }

    /// Rebuild the MD5 and CRC parts from a blob trailer
    ///
    /// The SHA1 is not carried in the trailer (it is the file name); the
    /// caller supplies it.
    pub fn from_trailer(trailer: &[u8; TRAILER_SIZE], sha1: [u8; SHA1_SIZE]) -> Hashes {
        let mut md5 = [0u8; MD5_SIZE];
        let mut crc = [0u8; CRC_SIZE];
        md5.copy_from_slice(&trailer[..MD5_SIZE]);
        crc.copy_from_slice(&trailer[MD5_SIZE..]);
        Hashes { crc, md5, sha1 }
    }

    /// Lowercase hex encoding of the SHA1
    pub fn sha1_hex(&self) -> String {
        hex::encode(self.sha1)
    }
}

/// SHA1 over a byte slice
///
/// Used for Dat identity digests over their serialized form.
pub fn sha1_bytes(data: &[u8]) -> [u8; SHA1_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        // "hello world\n" is the payload scenario S1 is written against.
        let (hh, n) = Hashes::for_reader(&b"hello world\n"[..]).unwrap();
        assert_eq!(n, 12);
        assert_eq!(hh.sha1_hex(), "22596363b3de40b06f981fb85d82312e8c0ed511");
        assert_eq!(hex::encode(hh.md5), "6f5902ac237024bdd0c176cb93063dc4");
        assert_eq!(hex::encode(hh.crc), "af083b2d");
    }

    #[test]
    fn test_empty_reader() {
        let (hh, n) = Hashes::for_reader(&b""[..]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(hh.sha1_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_trailer_round_trip() {
        let (hh, _) = Hashes::for_reader(&b"some payload"[..]).unwrap();
        let trailer = hh.md5crc();
        let back = Hashes::from_trailer(&trailer, hh.sha1);
        assert_eq!(back, hh);
    }

    #[test]
    fn test_single_pass_matches_whole_buffer() {
        // Feed the same bytes through a chunk-starved reader.
        struct OneByte<'a>(&'a [u8]);
        impl Read for OneByte<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let data = b"chunked reads must not change digests";
        let (a, _) = Hashes::for_reader(&data[..]).unwrap();
        let (b, _) = Hashes::for_reader(OneByte(data)).unwrap();
        assert_eq!(a, b);
    }
}
