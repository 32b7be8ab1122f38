//! Append-only, file-backed key-value store.
//!
//! Every `apply` appends one framed batch to `store.log` and syncs it. On
//! open the log is replayed into memory; a trailing batch that is torn or
//! fails its checksum is cut off, so a batch is visible entirely or not at
//! all.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|  magic "TAGDB\0KV" | version:u32 | zero padding
//! +------------------+
//! | Batch 1          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Batch Format
//!
//! ```text
//! +-----------+---------------------------------------------+-----------+
//! |len:u32    | count:u32 | { key_len:u32 key op:u8 [val_len:u32 val] }* | crc32:u32 |
//! +-----------+---------------------------------------------+-----------+
//! ```
//!
//! `op` is 1 for a put and 0 for a remove. The checksum covers the payload.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::flock::FileLock;
use super::kv::{KvStore, WriteBatch};
use crate::encoding::CRC32;
use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"TAGDB\0KV";
const VERSION: u32 = 1;
const LOG_FILE: &str = "store.log";
const LOCK_FILE: &str = "LOCK";

const OP_REMOVE: u8 = 0;
const OP_PUT: u8 = 1;

fn encode_header() -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[0..8].copy_from_slice(MAGIC);
    (&mut buf[8..12]).write_u32::<BigEndian>(VERSION).unwrap();
    buf
}

fn validate_header(buf: &[u8; HEADER_SIZE]) -> Result<()> {
    if &buf[0..8] != MAGIC {
        return Err(Error::CorruptedLog("invalid store magic".to_string()));
    }
    let version = (&buf[8..12]).read_u32::<BigEndian>()?;
    if version != VERSION {
        return Err(Error::CorruptedLog(format!(
            "unsupported store version {}",
            version
        )));
    }
    Ok(())
}

fn encode_batch(batch: &WriteBatch) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.write_u32::<BigEndian>(batch.len() as u32).unwrap();
    for (key, value) in batch.iter() {
        payload.write_u32::<BigEndian>(key.len() as u32).unwrap();
        payload.extend_from_slice(key.as_bytes());
        match value {
            Some(value) => {
                payload.write_u8(OP_PUT).unwrap();
                payload.write_u32::<BigEndian>(value.len() as u32).unwrap();
                payload.extend_from_slice(value);
            }
            None => payload.write_u8(OP_REMOVE).unwrap(),
        }
    }

    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    frame.extend_from_slice(&payload);
    frame.write_u32::<BigEndian>(CRC32.checksum(&payload)).unwrap();
    frame
}

fn decode_batch(payload: &[u8]) -> Result<WriteBatch> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut batch = WriteBatch::new();

    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let key = String::from_utf8(key)
            .map_err(|_| Error::CorruptedLog("non utf-8 key".to_string()))?;

        match cursor.read_u8()? {
            OP_PUT => {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut value = vec![0u8; len];
                cursor.read_exact(&mut value)?;
                batch.put(key, value);
            }
            OP_REMOVE => batch.remove(key),
            op => return Err(Error::CorruptedLog(format!("unknown op {}", op))),
        }
    }
    Ok(batch)
}

/// Reads the next complete batch. `None` at a clean end of log or at a
/// torn or corrupt frame.
fn read_batch<R: Read>(reader: &mut R) -> Option<(WriteBatch, u64)> {
    let len = reader.read_u32::<BigEndian>().ok()? as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).ok()?;
    let stored = reader.read_u32::<BigEndian>().ok()?;
    if CRC32.checksum(&payload) != stored {
        return None;
    }
    let batch = decode_batch(&payload).ok()?;
    Some((batch, len as u64 + 8))
}

fn apply_to(data: &mut BTreeMap<String, Vec<u8>>, batch: &WriteBatch) {
    for (key, value) in batch.iter() {
        match value {
            Some(value) => data.insert(key.clone(), value.clone()),
            None => data.remove(key),
        };
    }
}

pub struct FileStore {
    dir: PathBuf,
    log: Mutex<File>,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    _lock: FileLock,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("dir", &self.dir).finish()
    }
}

impl FileStore {
    /// Opens or creates a store in `dir`, taking an exclusive lock on it.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut data = BTreeMap::new();
        if file.metadata()?.len() == 0 {
            file.write_all(&encode_header())?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            validate_header(&header)?;

            let (batches, valid_len) = Self::replay(&file, &mut data)?;
            let file_len = file.metadata()?.len();
            if valid_len < file_len {
                tracing::warn!(
                    path = %path.display(),
                    dropped_bytes = file_len - valid_len,
                    "Dropping torn batch at end of store log"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            tracing::info!(
                path = %path.display(),
                batches,
                keys = data.len(),
                "Store opened"
            );
        }

        Ok(Self {
            dir,
            log: Mutex::new(file),
            data: RwLock::new(data),
            _lock: lock,
        })
    }

    fn replay(file: &File, data: &mut BTreeMap<String, Vec<u8>>) -> Result<(usize, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut valid_len = HEADER_SIZE as u64;
        let mut batches = 0;
        while let Some((batch, frame_len)) = read_batch(&mut reader) {
            apply_to(data, &batch);
            valid_len += frame_len;
            batches += 1;
        }
        Ok((batches, valid_len))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrites the log as a single batch holding the live keys.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock()?;
        let data = self.data.read()?;

        let snapshot: WriteBatch = data
            .iter()
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();

        let path = self.dir.join(LOG_FILE);
        let tmp_path = self.dir.join(format!("{}.compact", LOG_FILE));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encode_header())?;
            if !snapshot.is_empty() {
                tmp.write_all(&encode_batch(&snapshot))?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        *log = OpenOptions::new().read(true).write(true).open(&path)?;
        tracing::info!(path = %path.display(), keys = data.len(), "Store log compacted");
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read()?.get(key).cloned())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let frame = encode_batch(batch);
        let mut log = self.log.lock()?;
        let end = log.seek(SeekFrom::End(0))?;

        let written = log.write_all(&frame).and_then(|_| log.sync_data());
        if let Err(e) = written {
            // Cut the partial frame so later batches stay readable
            log.set_len(end)?;
            return Err(e.into());
        }

        apply_to(&mut *self.data.write()?, batch);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.data.read()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ops: &[(&str, Option<&[u8]>)]) -> WriteBatch {
        ops.iter()
            .map(|(k, v)| (k.to_string(), v.map(|v| v.to_vec())))
            .collect()
    }

    #[test]
    fn test_reopen_replays_batches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FileStore::open(dir.path())?;
            store.apply(&batch(&[("a", Some(b"1")), ("b", Some(b"2"))]))?;
            store.apply(&batch(&[("a", None), ("c", Some(b"3"))]))?;
        }

        let store = FileStore::open(dir.path())?;
        assert_eq!(store.get("a")?, None);
        assert_eq!(store.get("b")?, Some(b"2".to_vec()));
        assert_eq!(store.get("c")?, Some(b"3".to_vec()));
        assert_eq!(store.len()?, 2);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_dropped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FileStore::open(dir.path())?;
            store.apply(&batch(&[("kept", Some(b"yes"))]))?;
            store.apply(&batch(&[("torn", Some(b"no")), ("kept", None)]))?;
        }

        // Chop the last few bytes off the second batch
        let log_path = dir.path().join(LOG_FILE);
        let len = fs::metadata(&log_path)?.len();
        OpenOptions::new().write(true).open(&log_path)?.set_len(len - 3)?;

        let store = FileStore::open(dir.path())?;
        assert_eq!(store.get("kept")?, Some(b"yes".to_vec()));
        assert_eq!(store.get("torn")?, None);

        // The log is writable again after the cut
        store.apply(&batch(&[("after", Some(b"ok"))]))?;
        drop(store);
        let store = FileStore::open(dir.path())?;
        assert_eq!(store.get("after")?, Some(b"ok".to_vec()));
        assert_eq!(store.get("kept")?, Some(b"yes".to_vec()));
        Ok(())
    }

    #[test]
    fn test_corrupt_batch_is_dropped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FileStore::open(dir.path())?;
            store.apply(&batch(&[("first", Some(b"1"))]))?;
            store.apply(&batch(&[("second", Some(b"2"))]))?;
        }

        let log_path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&log_path)?;
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        fs::write(&log_path, &bytes)?;

        let store = FileStore::open(dir.path())?;
        assert_eq!(store.get("first")?, Some(b"1".to_vec()));
        assert_eq!(store.get("second")?, None);
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(LOG_FILE), vec![7u8; HEADER_SIZE])?;
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(Error::CorruptedLog(_))
        ));
        Ok(())
    }

    #[test]
    fn test_compact_keeps_live_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = FileStore::open(dir.path())?;
            for i in 0..10 {
                store.apply(&batch(&[("churn", Some(format!("{}", i).as_bytes()))]))?;
            }
            store.apply(&batch(&[("gone", Some(b"x"))]))?;
            store.apply(&batch(&[("gone", None)]))?;

            let before = fs::metadata(dir.path().join(LOG_FILE))?.len();
            store.compact()?;
            let after = fs::metadata(dir.path().join(LOG_FILE))?.len();
            assert!(after < before);

            store.apply(&batch(&[("new", Some(b"n"))]))?;
        }

        let store = FileStore::open(dir.path())?;
        assert_eq!(store.get("churn")?, Some(b"9".to_vec()));
        assert_eq!(store.get("gone")?, None);
        assert_eq!(store.get("new")?, Some(b"n".to_vec()));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_second_open_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _store = FileStore::open(dir.path())?;
        assert!(FileStore::open(dir.path()).is_err());
        Ok(())
    }
}
