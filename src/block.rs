//! Data Block: one on-disk file holding a contiguous ciphertext range of a
//! logical file, with a running SHA-1 digest over the bytes it carries.
//!
//! Concurrent readers may tail a block that another thread is still
//! appending to: [`DataBlock::read`]/[`DataBlock::read_raw`] re-open the
//! file handle and retry up to `read_try_count` times, sleeping
//! `read_sleep_time` between attempts, before giving up with
//! [`FabnetError::Timeout`].

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::error::{FabnetError, Result};
use crate::lock::LockRegistry;
use crate::security::{Decoder, Encoder, SecurityManager};

struct ReadState {
    seek: u64,
    rest: Vec<u8>,
}

/// One data block file. `raw_len`, when known, is the expected cleartext
/// length; it is required to compute `expected_len` for tailing reads.
pub struct DataBlock {
    path: PathBuf,
    raw_len: Option<u64>,
    checksum: Sha1,
    file: Option<File>,
    encoder: Option<Box<dyn Encoder>>,
    decoder: Option<Box<dyn Decoder>>,
    expected_len: Option<u64>,
    seek: Arc<Mutex<u64>>,
    read_state: Mutex<ReadState>,
    locks: Arc<LockRegistry>,
    locked: bool,
    read_try_count: u32,
    read_sleep_time: Duration,
    buf_len: usize,
}

impl DataBlock {
    pub fn create(
        path: impl Into<PathBuf>,
        raw_len: Option<u64>,
        locks: Arc<LockRegistry>,
        security: Option<&dyn SecurityManager>,
        read_try_count: u32,
        read_sleep_time: Duration,
        buf_len: usize,
    ) -> Result<Self> {
        let path = path.into();
        let (encoder, decoder, expected_len) = match security {
            Some(mgr) => {
                let enc = mgr.encoder(raw_len);
                let expected_len = raw_len.map(|l| enc.expected_data_len(l));
                (Some(enc), Some(mgr.decoder(raw_len)), expected_len)
            }
            None => (None, None, raw_len),
        };

        locks.acquire(&path);
        if !path.exists() {
            File::create(&path)?;
        }

        Ok(Self {
            path,
            raw_len,
            checksum: Sha1::new(),
            file: None,
            encoder,
            decoder,
            expected_len,
            seek: Arc::new(Mutex::new(0)),
            read_state: Mutex::new(ReadState {
                seek: 0,
                rest: Vec::new(),
            }),
            locks,
            locked: true,
            read_try_count,
            read_sleep_time,
            buf_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn get_progress(&self) -> (u64, Option<u64>) {
        (*self.seek.lock(), self.expected_len)
    }

    pub fn checksum(&self) -> String {
        hex::encode(self.checksum.clone().finalize())
    }

    /// Write `data`, optionally routing it through the block's encoder.
    /// Returns the number of bytes actually appended to the file (the
    /// ciphertext length, which may be 0 for a buffering encoder that only
    /// emits on `finalize`).
    pub fn write(&mut self, data: &[u8], finalize: bool) -> Result<usize> {
        let out = match &mut self.encoder {
            Some(enc) => enc.encrypt(data, finalize),
            None => data.to_vec(),
        };
        self.write_raw_bytes(&out)
    }

    /// Append already-encrypted bytes verbatim, bypassing the encoder.
    /// Used by [`crate::gateway::Gateway::get`] to materialize a downloaded
    /// block's ciphertext locally; the decoder in [`DataBlock::read`] is
    /// still applied when the caller actually reads the cleartext.
    pub fn write_raw_bytes(&mut self, out: &[u8]) -> Result<usize> {
        self.checksum.update(out);

        if self.file.is_none() {
            self.file = Some(
                fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&self.path)?,
            );
        }
        if !out.is_empty() {
            self.file.as_mut().unwrap().write_all(out)?;
        }
        *self.seek.lock() += out.len() as u64;
        Ok(out.len())
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.write(&[], true)?;
        if let Some(f) = self.file.take() {
            drop(f);
        }
        Ok(())
    }

    pub fn get_actual_size(&self) -> u64 {
        *self.seek.lock()
    }

    pub fn close(&mut self) {
        self.file = None;
        if self.locked {
            self.locks.release(&self.path);
            self.locked = false;
        }
    }

    pub fn remove(&mut self) {
        self.close();
        let _ = fs::remove_file(&self.path);
    }

    pub fn read_raw(&mut self, rlen: Option<usize>) -> Result<Vec<u8>> {
        let mut ret = Vec::new();
        match rlen {
            None => loop {
                let buf = self.read_buf(self.buf_len)?;
                if buf.is_empty() {
                    break;
                }
                ret.extend_from_slice(&buf);
            },
            Some(n) => ret = self.read_buf(n)?,
        }
        if !ret.is_empty() {
            self.checksum.update(&ret);
        }
        Ok(ret)
    }

    pub fn read(&mut self, rlen: Option<usize>) -> Result<Vec<u8>> {
        let mut ret = {
            let mut st = self.read_state.lock();
            std::mem::take(&mut st.rest)
        };
        loop {
            if let Some(n) = rlen {
                if ret.len() >= n {
                    let mut st = self.read_state.lock();
                    st.rest = ret.split_off(n);
                    break;
                }
            }
            let data = self.read_raw(Some(self.buf_len))?;
            if data.is_empty() {
                break;
            }
            let data = match &mut self.decoder {
                Some(dec) => dec.decrypt(&data),
                None => data,
            };
            ret.extend_from_slice(&data);
        }
        Ok(ret)
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn current_read_seek(&self) -> u64 {
        self.read_state.lock().seek
    }

    fn read_buf(&mut self, read_buf_len: usize) -> Result<Vec<u8>> {
        let expected_len = self
            .expected_len
            .ok_or_else(|| FabnetError::NoMetadata("unknown data block size".into()))?;
        if expected_len <= self.current_read_seek() {
            return Ok(Vec::new());
        }

        let mut ret = Vec::new();
        let mut remaining = read_buf_len;

        for _ in 0..self.read_try_count {
            if self.is_closed() {
                let mut f = File::open(&self.path)?;
                f.seek(SeekFrom::Start(self.current_read_seek()))?;
                self.file = Some(f);
            }

            let mut chunk = vec![0u8; remaining];
            let n = self.file.as_mut().unwrap().read(&mut chunk)?;
            chunk.truncate(n);

            {
                let mut st = self.read_state.lock();
                st.seek += n as u64;
            }
            ret.extend_from_slice(&chunk);
            remaining -= n;

            if remaining == 0 {
                return Ok(ret);
            }

            self.file = None;
            if expected_len <= self.current_read_seek() {
                return Ok(ret);
            }
            std::thread::sleep(self.read_sleep_time);
        }

        Err(FabnetError::Timeout(self.path.display().to_string()))
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::NullSecurityManager;
    use tempfile::tempdir;

    fn block(path: &Path, raw_len: Option<u64>, locks: Arc<LockRegistry>) -> DataBlock {
        DataBlock::create(
            path,
            raw_len,
            locks,
            Some(&NullSecurityManager),
            3,
            Duration::from_millis(10),
            64,
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block-0");
        let locks = Arc::new(LockRegistry::new());

        let mut w = block(&path, Some(11), locks.clone());
        w.write(b"hello ", false).unwrap();
        w.write(b"world", false).unwrap();
        w.finalize().unwrap();
        assert_eq!(w.checksum().len(), 40);
        w.close();

        let mut r = block(&path, Some(11), locks);
        let data = r.read(None).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn tailing_read_times_out_when_writer_never_finishes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block-stuck");
        let locks = Arc::new(LockRegistry::new());
        fs::write(&path, b"abc").unwrap();

        let mut r = block(&path, Some(100), locks);
        let err = r.read(None).unwrap_err();
        assert!(matches!(err, FabnetError::Timeout(_)));
    }

    #[test]
    fn lock_registry_tracks_open_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("block-locked");
        let locks = Arc::new(LockRegistry::new());
        let b = block(&path, Some(0), locks.clone());
        assert!(locks.is_locked(&path));
        drop(b);
        assert!(!locks.is_locked(&path));
    }
}
