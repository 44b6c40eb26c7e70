//! Append-log store backend
//!
//! The shipped [`KvStore`] backend: an append-only record log replayed
//! into an in-memory ordered map on open. Every record carries a CRC32 so
//! a torn tail (power loss mid-append) is detected and truncated on the
//! next open instead of poisoning the map.
//!
//! ```text
//! <store_dir>/store.log       record*  (all live and superseded records)
//!
//! record := op(1) key(key_size) vlen(4, LE) value(vlen) crc32(4, LE)
//! ```
//!
//! Append-union operations are resolved to plain `set` records at batch
//! application time: the current value is read, merged on 20-byte
//! boundaries with deduplication, and the merged value is written. The
//! log therefore only ever contains `set` and `delete` records.
//!
//! The log grows with every overwrite; [`LogKv::end_refresh`] compacts it
//! by rewriting live state into a temporary file and atomically renaming
//! it over the log.

use crate::error::{DepotError, Result};
use crate::kv::{merge_union, BatchOp, KvStore, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const LOG_FILE: &str = "store.log";
const LOG_TMP_FILE: &str = "store.log.tmp";

const OP_SET: u8 = 1;
const OP_DELETE: u8 = 2;

/// Append-log key/value store with an in-memory ordered index
pub struct LogKv {
    dir: PathBuf,
    key_size: usize,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Mutex<BufWriter<File>>,
    refreshing: AtomicBool,
}

impl LogKv {
    /// Open or create a store at `dir` with the given fixed key width
    ///
    /// Replays the existing log into memory. A record with a bad checksum
    /// ends the replay; the log is truncated to the last good record.
    pub fn open(dir: &Path, key_size: usize) -> Result<LogKv> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);

        let mut map = BTreeMap::new();
        let mut valid_len = 0u64;
        if log_path.exists() {
            let data = fs::read(&log_path)?;
            valid_len = replay(&data, key_size, &mut map, &log_path)?;
            if valid_len < data.len() as u64 {
                warn!(
                    "truncating torn tail of {:?}: {} of {} bytes are valid",
                    log_path,
                    valid_len,
                    data.len()
                );
                let file = OpenOptions::new().write(true).open(&log_path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        debug!(
            "opened log store {:?}: {} keys, {} log bytes",
            dir,
            map.len(),
            valid_len
        );

        Ok(LogKv {
            dir: dir.to_path_buf(),
            key_size,
            map: RwLock::new(map),
            writer: Mutex::new(BufWriter::new(file)),
            refreshing: AtomicBool::new(false),
        })
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

    fn write_record(writer: &mut BufWriter<File>, op: u8, key: &[u8], value: &[u8]) -> Result<()> {
        let mut crc = crc32fast::Hasher::new();
        crc.update(&[op]);
        crc.update(key);
        crc.update(value);

        writer.write_all(&[op])?;
        writer.write_all(key)?;
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value)?;
        writer.write_all(&crc.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Rewrite the log so it holds exactly the live state
    fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let map = self.map.read();

        writer.flush()?;

        let tmp_path = self.dir.join(LOG_TMP_FILE);
        let tmp = File::create(&tmp_path)?;
        let mut tmp_writer = BufWriter::new(tmp);
        for (key, value) in map.iter() {
            Self::write_record(&mut tmp_writer, OP_SET, key, value)?;
        }
        tmp_writer.flush()?;
        tmp_writer
            .get_ref()
            .sync_all()
            .map_err(DepotError::Io)?;

        let log_path = self.dir.join(LOG_FILE);
        fs::rename(&tmp_path, &log_path)?;

        let file = OpenOptions::new().append(true).open(&log_path)?;
        *writer = BufWriter::new(file);
        debug!("compacted log store {:?} to {} keys", self.dir, map.len());
        Ok(())
    }
}

/// Replay records into `map`, returning the byte length of the valid prefix
fn replay(
    data: &[u8],
    key_size: usize,
    map: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    log_path: &Path,
) -> Result<u64> {
    let mut pos = 0usize;
    loop {
        let header = 1 + key_size + 4;
        if data.len() - pos < header {
            break;
        }
        let op = data[pos];
        let key = &data[pos + 1..pos + 1 + key_size];
        let vlen_at = pos + 1 + key_size;
        let vlen = u32::from_le_bytes([
            data[vlen_at],
            data[vlen_at + 1],
            data[vlen_at + 2],
            data[vlen_at + 3],
        ]) as usize;
        if data.len() - pos < header + vlen + 4 {
            break;
        }
        let value = &data[pos + header..pos + header + vlen];
        let crc_at = pos + header + vlen;
        let stored_crc = u32::from_le_bytes([
            data[crc_at],
            data[crc_at + 1],
            data[crc_at + 2],
            data[crc_at + 3],
        ]);

        let mut crc = crc32fast::Hasher::new();
        crc.update(&[op]);
        crc.update(key);
        crc.update(value);
        if crc.finalize() != stored_crc {
            break;
        }

        match op {
            OP_SET => {
                map.insert(key.to_vec(), value.to_vec());
            }
            OP_DELETE => {
                map.remove(key);
            }
            other => {
                warn!("unknown record op {} in {:?}, stopping replay", other, log_path);
                break;
            }
        }
        pos += header + vlen + 4;
    }
    Ok(pos as u64)
}

impl KvStore for LogKv {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let mut writer = self.writer.lock();
        let mut map = self.map.write();
        Self::write_record(&mut writer, OP_SET, key, value)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let mut writer = self.writer.lock();
        let mut map = self.map.write();
        Self::write_record(&mut writer, OP_DELETE, key, &[])?;
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        Ok(self.map.read().contains_key(key))
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Holding both locks across the batch makes the read-merge-write of
        // each append atomic with respect to every other writer.
        let mut writer = self.writer.lock();
        let mut map = self.map.write();

        for op in batch.ops() {
            match op {
                BatchOp::Set(key, value) => {
                    self.check_key(key)?;
                    Self::write_record(&mut writer, OP_SET, key, value)?;
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Append(key, value) => {
                    self.check_key(key)?;
                    let mut merged = map.get(key).cloned().unwrap_or_default();
                    let before = merged.len();
                    merge_union(&mut merged, value);
                    if merged.len() != before {
                        Self::write_record(&mut writer, OP_SET, key, &merged)?;
                        map.insert(key.clone(), merged);
                    }
                }
                BatchOp::Delete(key) => {
                    self.check_key(key)?;
                    Self::write_record(&mut writer, OP_DELETE, key, &[])?;
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        fs::metadata(self.dir.join(LOG_FILE))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn begin_refresh(&self) -> Result<()> {
        self.refreshing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end_refresh(&self) -> Result<()> {
        self.refreshing.store(false, Ordering::SeqCst);
        self.compact()
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::SHA1_SIZE;
    use crate::kv::KEY_SIZE_CRC;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();

        let key = [0xde, 0xad, 0xbe, 0xef];
        assert_eq!(store.get(&key).unwrap(), None);
        assert!(!store.exists(&key).unwrap());

        store.set(&key, b"value one").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"value one".to_vec()));
        assert!(store.exists(&key).unwrap());

        store.set(&key, b"value two").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"value two".to_vec()));

        store.delete(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn test_key_size_enforced() {
        let dir = TempDir::new().unwrap();
        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
        assert!(matches!(
            store.get(&[1, 2, 3]),
            Err(DepotError::KeySize { .. })
        ));
        assert!(store.set(&[1u8; 5], b"v").is_err());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
            store.set(&[1, 2, 3, 4], b"kept").unwrap();
            store.set(&[5, 6, 7, 8], b"dropped").unwrap();
            store.delete(&[5, 6, 7, 8]).unwrap();
            store.close().unwrap();
        }

        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
        assert_eq!(store.get(&[1, 2, 3, 4]).unwrap(), Some(b"kept".to_vec()));
        assert_eq!(store.get(&[5, 6, 7, 8]).unwrap(), None);
    }

    #[test]
    fn test_batch_append_union() {
        let dir = TempDir::new().unwrap();
        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
        let key = [9u8; 4];
        let a = [1u8; SHA1_SIZE];
        let b = [2u8; SHA1_SIZE];

        let mut batch = WriteBatch::new(KEY_SIZE_CRC);
        batch.append(&key, &a).unwrap();
        batch.append(&key, &b).unwrap();
        batch.append(&key, &a).unwrap(); // duplicate, must not grow the value
        store.write_batch(&batch).unwrap();

        let value = store.get(&key).unwrap().unwrap();
        assert_eq!(value.len(), 2 * SHA1_SIZE);
        assert_eq!(&value[..SHA1_SIZE], &a);
        assert_eq!(&value[SHA1_SIZE..], &b);

        // A second identical batch is a no-op: ingest is idempotent.
        let mut again = WriteBatch::new(KEY_SIZE_CRC);
        again.append(&key, &a).unwrap();
        again.append(&key, &b).unwrap();
        store.write_batch(&again).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().len(), 2 * SHA1_SIZE);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
            store.set(&[1, 1, 1, 1], b"good").unwrap();
            store.close().unwrap();
        }

        // Simulate a torn append.
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[OP_SET, 9, 9]).unwrap();
        drop(file);

        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
        assert_eq!(store.get(&[1, 1, 1, 1]).unwrap(), Some(b"good".to_vec()));

        // The store keeps working after truncation.
        store.set(&[2, 2, 2, 2], b"after").unwrap();
        store.close().unwrap();
        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();
        assert_eq!(store.get(&[2, 2, 2, 2]).unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn test_end_refresh_compacts() {
        let dir = TempDir::new().unwrap();
        let store = LogKv::open(dir.path(), KEY_SIZE_CRC).unwrap();

        let key = [3u8; 4];
        for i in 0..50u8 {
            store.set(&key, &vec![i; 100]).unwrap();
        }
        store.flush().unwrap();
        let before = store.size();

        store.begin_refresh().unwrap();
        store.end_refresh().unwrap();
        let after = store.size();
        assert!(after < before, "compaction must shrink the log ({after} >= {before})");
        assert_eq!(store.get(&key).unwrap(), Some(vec![49u8; 100]));
    }
}
