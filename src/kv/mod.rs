//! Key/value store abstraction
//!
//! The index persists through a small ordered key/value surface so that
//! multiple backends can coexist (the shipped backend is the append-log
//! store in [`log`]). Each store has a fixed key width (4 for CRC keys,
//! 16 for MD5, 20 for SHA1), validated on every call.
//!
//! Writes go through [`WriteBatch`]es. A batch is plain data: operations
//! accumulate with a running pending-byte count and are applied atomically
//! per store by [`KvStore::write_batch`]. `append` is the union operation
//! the index is built on: the store reads the current value, merges the
//! new digests on 20-byte boundaries with deduplication, and writes the
//! result back, all inside the batch application, so concurrent appends
//! to the same key are linearized by the store.

use crate::error::{DepotError, Result};
use crate::hashes::SHA1_SIZE;
use std::path::Path;

pub mod log;

pub use self::log::LogKv;

/// Key width of CRC-keyed stores
pub const KEY_SIZE_CRC: usize = 4;
/// Key width of MD5-keyed stores
pub const KEY_SIZE_MD5: usize = 16;
/// Key width of SHA1-keyed stores
pub const KEY_SIZE_SHA1: usize = 20;

/// An ordered, durable key/value map with fixed-width keys
pub trait KvStore: Send + Sync {
    /// The fixed key width of this store
    fn key_size(&self) -> usize;

    /// Look up a key; absent keys are `Ok(None)`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Overwrite a key
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key; removing an absent key is not an error
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Check for key presence without copying the value
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Apply a batch atomically with respect to other writers
    fn write_batch(&self, batch: &WriteBatch) -> Result<()>;

    /// Push buffered writes to durable storage
    fn flush(&self) -> Result<()>;

    /// Approximate on-disk size in bytes
    fn size(&self) -> u64;

    /// Mark the start of a full-rebuild window
    ///
    /// The catalog importer brackets a complete re-import with
    /// `begin_refresh`/`end_refresh`; the store may defer housekeeping
    /// until the bracket closes.
    fn begin_refresh(&self) -> Result<()>;

    /// Close the full-rebuild window (the shipped backend compacts here)
    fn end_refresh(&self) -> Result<()>;

    /// Flush and release the store
    fn close(&self) -> Result<()>;
}

/// Constructor hook for pluggable store backends
///
/// The index receives one of these and opens its six stores through it,
/// keeping the backend choice out of the index itself.
pub type StoreOpener = fn(&Path, usize) -> Result<Box<dyn KvStore>>;

/// The default opener: the append-log backend
pub fn default_store_opener(path: &Path, key_size: usize) -> Result<Box<dyn KvStore>> {
    Ok(Box::new(LogKv::open(path, key_size)?))
}

/// One buffered store operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Overwrite the key
    Set(Vec<u8>, Vec<u8>),
    /// Union-append 20-byte digests to the key's value
    Append(Vec<u8>, Vec<u8>),
    /// Remove the key
    Delete(Vec<u8>),
}

/// A buffered sequence of writes against one store
#[derive(Debug)]
pub struct WriteBatch {
    key_size: usize,
    ops: Vec<BatchOp>,
    pending: u64,
}

impl WriteBatch {
    /// Create an empty batch for a store with the given key width
    pub fn new(key_size: usize) -> WriteBatch {
        WriteBatch {
            key_size,
            ops: Vec::new(),
            pending: 0,
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(DepotError::KeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Buffer an overwrite
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.pending += (key.len() + value.len()) as u64;
        self.ops.push(BatchOp::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Buffer a union-append of one or more 20-byte digests
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if value.is_empty() || value.len() % SHA1_SIZE != 0 {
            return Err(DepotError::storage(format!(
                "append value must be a multiple of {SHA1_SIZE} bytes, got {}",
                value.len()
            )));
        }
        self.pending += (key.len() + value.len()) as u64;
        self.ops.push(BatchOp::Append(key.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Buffer a delete
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.pending += key.len() as u64;
        self.ops.push(BatchOp::Delete(key.to_vec()));
        Ok(())
    }

    /// Drop every buffered operation
    pub fn clear(&mut self) {
        self.ops.clear();
        self.pending = 0;
    }

    /// Bytes buffered so far (keys plus values)
    pub fn pending_bytes(&self) -> u64 {
        self.pending
    }

    /// True if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The buffered operations in insertion order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Merge `src` digests into `dst`, skipping ones already present
///
/// Both buffers are concatenations of 20-byte digests. Quadratic in the
/// digest counts, but `src` is almost always a single digest.
pub fn merge_union(dst: &mut Vec<u8>, src: &[u8]) {
    for digest in src.chunks_exact(SHA1_SIZE) {
        let present = dst
            .chunks_exact(SHA1_SIZE)
            .any(|existing| existing == digest);
        if !present {
            dst.extend_from_slice(digest);
        }
    }
}
