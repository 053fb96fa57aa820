//! Append-only log of catalog mutations.
//!
//! The journal is the authoritative record; the catalog's KV store is a
//! cache of state derived from replaying it. On-disk, it is a flat file of
//! length-prefixed, CRC32-framed `serde_json` records:
//!
//! ```text
//! [ u32 LE frame_len | u32 LE crc32(frame_bytes) | frame_bytes ] *
//! ```
//!
//! A frame whose stored CRC doesn't match its bytes marks the end of the
//! valid log — the tail of a file truncated mid-append by a crash. `iter`
//! stops there instead of raising an error.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::item::Item;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    Append,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub record_id: u64,
    pub op: JournalOp,
    pub item: Item,
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    journal_key: Uuid,
    last_id: Mutex<u64>,
}

impl Journal {
    /// Open (creating if missing) and establish the journal key — a random
    /// UUID stamped as the file's first frame when the journal is new, and
    /// read back from frame 0 otherwise.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let journal_key = if is_new {
            let key = Uuid::new_v4();
            write_frame(&mut file, &key.as_bytes()[..])?;
            key
        } else {
            let mut reader = BufReader::new(File::open(&path)?);
            match read_frame(&mut reader)? {
                Some(bytes) if bytes.len() == 16 => {
                    Uuid::from_slice(&bytes).unwrap_or_else(|_| Uuid::new_v4())
                }
                _ => Uuid::new_v4(),
            }
        };

        let last_id = Self::scan_last_id(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            journal_key,
            last_id: Mutex::new(last_id),
        })
    }

    pub fn journal_key(&self) -> Uuid {
        self.journal_key
    }

    pub fn get_last_id(&self) -> u64 {
        *self.last_id.lock()
    }

    pub fn append(&self, op: JournalOp, item: &Item) -> Result<u64> {
        let mut last_id = self.last_id.lock();
        let record_id = *last_id + 1;
        let record = JournalRecord {
            record_id,
            op,
            item: item.clone(),
        };
        let payload = serde_json::to_vec(&record)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        write_frame(&mut *file, &payload)?;
        file.flush()?;
        *last_id = record_id;
        Ok(record_id)
    }

    /// Replay every valid record whose `record_id > from_id`, in ascending
    /// order. Stops silently at the first corrupt/truncated frame.
    pub fn iter(&self, from_id: u64) -> Result<Vec<JournalRecord>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        // Skip the journal-key frame (frame 0, raw bytes, not JSON).
        read_frame(&mut reader)?;

        let mut out = Vec::new();
        while let Some(bytes) = read_frame(&mut reader)? {
            let record: JournalRecord = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(_) => break,
            };
            if record.record_id > from_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn scan_last_id(path: &Path) -> Result<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        read_frame(&mut reader)?;
        let mut last = 0u64;
        while let Some(bytes) = read_frame(&mut reader)? {
            let record: JournalRecord = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(_) => break,
            };
            last = record.record_id;
        }
        Ok(last)
    }
}

fn write_frame(w: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let mut h = Hasher::new();
    h.update(payload);
    let crc = h.finalize();
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = r.read_exact(&mut len_buf) {
        return if e.kind() == io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }
    let mut crc_buf = [0u8; 4];
    if r.read_exact(&mut crc_buf).is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let stored_crc = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    if r.read_exact(&mut payload).is_err() {
        return Ok(None);
    }

    let mut h = Hasher::new();
    h.update(&payload);
    if h.finalize() != stored_crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_item(id: u64) -> Item {
        Item::new_directory(id, 0, format!("dir-{id}"))
    }

    #[test]
    fn append_and_iter_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let j = Journal::open(&path).unwrap();

        j.append(JournalOp::Append, &test_item(1)).unwrap();
        j.append(JournalOp::Append, &test_item(2)).unwrap();
        j.append(JournalOp::Remove, &test_item(1)).unwrap();

        let records = j.iter(0).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, JournalOp::Append);
        assert_eq!(records[2].op, JournalOp::Remove);
        assert_eq!(j.get_last_id(), 3);
    }

    #[test]
    fn journal_key_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let key1 = Journal::open(&path).unwrap().journal_key();
        let key2 = Journal::open(&path).unwrap().journal_key();
        assert_eq!(key1, key2);
    }

    #[test]
    fn iter_from_id_skips_earlier_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let j = Journal::open(&path).unwrap();
        j.append(JournalOp::Append, &test_item(1)).unwrap();
        j.append(JournalOp::Append, &test_item(2)).unwrap();
        let records = j.iter(1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, 2);
    }

    #[test]
    fn truncated_tail_is_ignored_not_fatal() {
        use std::io::Write as _;
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let j = Journal::open(&path).unwrap();
            j.append(JournalOp::Append, &test_item(1)).unwrap();
        }
        // Simulate a crash mid-append: a dangling length prefix with no payload.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&999u32.to_le_bytes()).unwrap();
        f.write_all(&0u32.to_le_bytes()).unwrap();

        let j = Journal::open(&path).unwrap();
        let records = j.iter(0).unwrap();
        assert_eq!(records.len(), 1);
    }
}
