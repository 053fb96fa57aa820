//! A stream-like handle over one logical file, splitting writes into
//! [`crate::block::DataBlock`]s at `Config::max_data_block_size` and
//! lazily pulling read-side blocks through a download transaction.
//!
//! Opened exclusively for reading or writing — never both, matching the
//! split `open_file`/`create_file` surface on [`crate::client::Client`].

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::block::DataBlock;
use crate::error::{FabnetError, Result};
use crate::transactions::{Transaction, TransactionState, TransactionsManager};

pub struct SmartFileObject {
    tm: Arc<TransactionsManager>,
    file_path: String,
    for_write: bool,
    closed: bool,
    failed_flag: bool,
    is_tmp_file: bool,

    write_transaction: Option<Arc<Transaction>>,
    write_seek: u64,
    cur_db_seek: u64,
    cur_write_block: Option<DataBlock>,
    unsync: bool,

    read_transaction: Option<Arc<Transaction>>,
    read_pos: u64,
    cur_read_block: Option<DataBlock>,
    cur_read_block_next_seek: Option<u64>,
}

impl SmartFileObject {
    pub fn open(tm: Arc<TransactionsManager>, file_path: impl Into<String>, for_write: bool) -> Self {
        let file_path = file_path.into();
        let is_tmp_file = is_tmp_file(&tm, &file_path);
        debug!(file_path = %file_path, for_write, "opening smart file object");
        Self {
            tm,
            file_path,
            for_write,
            closed: false,
            failed_flag: false,
            is_tmp_file,
            write_transaction: None,
            write_seek: 0,
            cur_db_seek: 0,
            cur_write_block: None,
            unsync: false,
            read_transaction: None,
            read_pos: 0,
            cur_read_block: None,
            cur_read_block_next_seek: None,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.for_write {
            return Err(FabnetError::Permissions(format!("{} is open for read", self.file_path)));
        }
        if self.closed {
            return Err(FabnetError::ClosedFile(self.file_path.clone()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let result = self.write_inner(data);
        if result.is_err() {
            self.fail_transaction();
        }
        result
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<()> {
        if self.write_transaction.is_none() {
            self.write_transaction = Some(
                self.tm
                    .start_upload_transaction(&self.file_path, self.is_tmp_file),
            );
        }
        let tx = self.write_transaction.clone().unwrap();
        if self.cur_write_block.is_none() {
            self.cur_write_block = Some(self.tm.new_write_block(&tx, self.write_seek)?);
        }

        let data_len = data.len() as i64;
        let rest = if self.is_tmp_file {
            0
        } else {
            self.cur_db_seek as i64 + data_len - self.tm.config().max_data_block_size as i64
        };

        let (now, rest_data) = if rest > 0 {
            let split_at = (data_len - rest) as usize;
            (&data[..split_at], &data[split_at..])
        } else {
            (data, &b""[..])
        };

        self.cur_write_block.as_mut().unwrap().write(now, false)?;
        self.cur_db_seek += now.len() as u64;
        self.unsync = true;

        if !rest_data.is_empty() {
            self.send_data_block()?;
            self.write_inner(rest_data)?;
        }
        Ok(())
    }

    fn send_data_block(&mut self) -> Result<()> {
        let mut block = self.cur_write_block.take().expect("send_data_block called with no open block");
        block.finalize()?;
        let actual_size = block.get_actual_size();
        let tx = self.write_transaction.clone().expect("write transaction started before first block");

        if actual_size > 0 {
            self.tm.transfer_data_block(&tx, self.write_seek, self.cur_db_seek)?;
        }

        self.write_seek += self.cur_db_seek;
        self.cur_db_seek = 0;
        self.unsync = false;
        Ok(())
    }

    fn fail_transaction(&mut self) {
        self.failed_flag = true;
        if let Some(block) = self.cur_write_block.take() {
            let mut block = block;
            block.remove();
        }
        if let Some(tx) = &self.write_transaction {
            let _ = self.tm.update_transaction_state(tx, TransactionState::Failed);
        }
    }

    /// Position the read cursor so that the next `read` call starts at
    /// `seek_v`, downloading chunks along the way as needed.
    pub fn seek(&mut self, seek_v: u64) -> Result<()> {
        if self.read_transaction.is_none() {
            self.read_transaction = Some(self.tm.start_download_transaction(&self.file_path)?);
        }
        if seek_v == 0 {
            return Ok(());
        }

        let tx = self.read_transaction.clone().unwrap();
        loop {
            let cur_seek = self.read_pos;
            let (path, next_seek, _, _) = self.tm.get_data_block(&tx, self.read_pos)?;
            let Some(path) = path else {
                self.cur_read_block = None;
                return Ok(());
            };
            self.cur_read_block = Some(self.tm.open_read_block(&tx, cur_seek, &path)?);
            self.cur_read_block_next_seek = next_seek;
            let at_last_chunk = next_seek.is_none();
            self.read_pos = next_seek.unwrap_or(cur_seek);

            if at_last_chunk || (seek_v <= self.read_pos && seek_v >= cur_seek) {
                let skip = (seek_v - cur_seek) as usize;
                self.read_inner(Some(skip))?;
                return Ok(());
            }
        }
    }

    pub fn read(&mut self, read_len: Option<usize>) -> Result<Vec<u8>> {
        if self.for_write {
            return Err(FabnetError::Permissions(format!("{} is open for write", self.file_path)));
        }
        if self.closed {
            return Err(FabnetError::ClosedFile(self.file_path.clone()));
        }
        self.seek(0)?;
        let result = self.read_inner(read_len);
        if result.is_err() {
            self.fail_transaction();
        }
        result
    }

    fn read_inner(&mut self, read_len: Option<usize>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if self.cur_read_block.is_none() {
                let Some(tx) = self.read_transaction.clone() else { break };
                let (path, next_seek, _, chunk_seek) = self.tm.get_data_block(&tx, self.read_pos)?;
                let Some(path) = path else { break };
                self.cur_read_block = Some(self.tm.open_read_block(&tx, chunk_seek, &path)?);
                self.cur_read_block_next_seek = next_seek;
            }

            let block = self.cur_read_block.as_mut().unwrap();
            let data = block.read(read_len.map(|n| n.saturating_sub(out.len())))?;
            if !data.is_empty() {
                out.extend_from_slice(&data);
            }
            if let Some(n) = read_len {
                if out.len() >= n {
                    break;
                }
            }

            self.cur_read_block.as_mut().unwrap().close();
            self.cur_read_block = None;
            match self.cur_read_block_next_seek {
                Some(next) => self.read_pos = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.close_inner();
        self.closed = true;
        debug!(file_path = %self.file_path, "smart file object closed");
        result
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.failed_flag {
            return Ok(());
        }

        if self.for_write {
            if self.unsync && self.cur_write_block.is_some() {
                if let Err(err) = self.send_data_block() {
                    self.fail_transaction();
                    return Err(err);
                }
            } else if self.write_transaction.is_none() {
                self.tm.save_empty_file(&self.file_path)?;
                return Ok(());
            }

            let status = if self.is_tmp_file {
                TransactionState::Finished
            } else {
                TransactionState::LocalSaved
            };
            if let Some(tx) = &self.write_transaction {
                self.tm.update_transaction_state(tx, status)?;
            }
        } else if let Some(block) = self.cur_read_block.as_mut() {
            block.close();
        }
        Ok(())
    }
}

impl Drop for SmartFileObject {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn is_tmp_file(tm: &TransactionsManager, file_path: &str) -> bool {
    let name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tm.config().tmp_file_patterns.iter().any(|pat| {
        Regex::new(&pat.name_regex)
            .map(|re| re.is_match(&name))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::Config;
    use crate::lock::LockRegistry;
    use crate::security::NullSecurityManager;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> Arc<TransactionsManager> {
        let catalog = Arc::new(Catalog::open(dir.join("catalog"), None).unwrap());
        let locks = Arc::new(LockRegistry::new());
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        config.max_data_block_size = 8;
        Arc::new(TransactionsManager::new(catalog, locks, Arc::new(NullSecurityManager), config))
    }

    #[test]
    fn write_close_produces_local_saved_transaction_with_chunks() {
        let dir = tempdir().unwrap();
        let tm = manager(dir.path());
        let mut f = SmartFileObject::open(tm.clone(), "/big.bin", true);
        f.write(b"0123456789abcdef").unwrap();
        f.close().unwrap();

        let tx = f.write_transaction.clone().unwrap();
        assert_eq!(tx.state(), TransactionState::LocalSaved);
    }

    #[test]
    fn close_without_any_write_saves_empty_file() {
        let dir = tempdir().unwrap();
        let tm = manager(dir.path());
        let mut f = SmartFileObject::open(tm.clone(), "/empty.bin", true);
        f.close().unwrap();
        let item = tm.catalog().find("/empty.bin").unwrap();
        assert_eq!(item.size(), 0);
    }
}
