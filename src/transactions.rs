//! Per-file transaction state machine and the bounded queues the worker
//! pool drains.
//!
//! Writers: `Init -> Active -> LocalSaved -> Uploading -> Finished|Failed`.
//! Readers: `Init -> Active -> Downloading -> Finished`. Once a chunk's
//! status is `Failed` it stays `Failed` — a later success for the same
//! `(transaction, seek)` does not revive it, and the whole transaction is
//! moved to `Failed` the first time any of its chunks fails.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::catalog::item::{ChunkRef, Item, ItemKind};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{FabnetError, Result};
use crate::lock::LockRegistry;
use crate::security::SecurityManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Init,
    Active,
    LocalSaved,
    Uploading,
    Downloading,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Inflight,
    Done,
    Failed,
}

pub struct ChunkEntry {
    pub seek: u64,
    pub size: u64,
    pub status: ChunkStatus,
    pub remote_key: Option<String>,
    pub block_path: PathBuf,
}

pub struct Transaction {
    pub id: u64,
    pub file_path: String,
    pub kind: TransactionKind,
    pub item_id: Mutex<Option<u64>>,
    pub replica_count: u8,
    pub is_local: bool,
    state: Mutex<TransactionState>,
    chunks: Mutex<BTreeMap<u64, ChunkEntry>>,
    download_cv: Condvar,
}

impl Transaction {
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TransactionState::Failed
    }

    fn chunk_statuses(&self) -> Vec<ChunkStatus> {
        self.chunks.lock().values().map(|c| c.status).collect()
    }
}

/// Ties the catalog, lock registry, and security manager together with the
/// three bounded work queues the put/get/delete worker pools drain.
pub struct TransactionsManager {
    next_id: AtomicU64,
    transactions: Mutex<std::collections::HashMap<u64, Arc<Transaction>>>,
    catalog: Arc<Catalog>,
    locks: Arc<LockRegistry>,
    security: Arc<dyn SecurityManager>,
    config: Config,

    upload_tx: Sender<UploadJob>,
    upload_rx: Receiver<UploadJob>,
    download_tx: Sender<DownloadJob>,
    download_rx: Receiver<DownloadJob>,
    delete_tx: Sender<DeleteJob>,
    delete_rx: Receiver<DeleteJob>,
}

pub struct UploadJob {
    pub transaction: Arc<Transaction>,
    pub seek: u64,
}

pub struct DownloadJob {
    pub transaction: Arc<Transaction>,
    pub seek: u64,
}

pub struct DeleteJob {
    pub remote_key: String,
    pub replica_count: u8,
}

const QUEUE_CAPACITY: usize = 256;

impl TransactionsManager {
    pub fn new(
        catalog: Arc<Catalog>,
        locks: Arc<LockRegistry>,
        security: Arc<dyn SecurityManager>,
        config: Config,
    ) -> Self {
        let (upload_tx, upload_rx) = bounded(QUEUE_CAPACITY);
        let (download_tx, download_rx) = bounded(QUEUE_CAPACITY);
        let (delete_tx, delete_rx) = bounded(QUEUE_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(std::collections::HashMap::new()),
            catalog,
            locks,
            security,
            config,
            upload_tx,
            upload_rx,
            download_tx,
            download_rx,
            delete_tx,
            delete_rx,
        }
    }

    pub fn upload_receiver(&self) -> Receiver<UploadJob> {
        self.upload_rx.clone()
    }
    pub fn upload_sender(&self) -> Sender<UploadJob> {
        self.upload_tx.clone()
    }
    pub fn download_receiver(&self) -> Receiver<DownloadJob> {
        self.download_rx.clone()
    }
    pub fn download_sender(&self) -> Sender<DownloadJob> {
        self.download_tx.clone()
    }
    pub fn delete_receiver(&self) -> Receiver<DeleteJob> {
        self.delete_rx.clone()
    }
    pub fn delete_sender(&self) -> Sender<DeleteJob> {
        self.delete_tx.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
    pub fn security(&self) -> &Arc<dyn SecurityManager> {
        &self.security
    }
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_transaction(&self, id: u64) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(&id).cloned()
    }

    pub fn start_upload_transaction(&self, file_path: &str, is_local: bool) -> Arc<Transaction> {
        let tx = Arc::new(Transaction {
            id: self.alloc_id(),
            file_path: file_path.to_string(),
            kind: TransactionKind::Write,
            item_id: Mutex::new(None),
            replica_count: self.config.replica_count,
            is_local,
            state: Mutex::new(TransactionState::Active),
            chunks: Mutex::new(BTreeMap::new()),
            download_cv: Condvar::new(),
        });
        self.transactions.lock().insert(tx.id, tx.clone());
        tx
    }

    pub fn start_download_transaction(&self, file_path: &str) -> Result<Arc<Transaction>> {
        let item = self.catalog.find(file_path)?;
        let tx = Arc::new(Transaction {
            id: self.alloc_id(),
            file_path: file_path.to_string(),
            kind: TransactionKind::Read,
            item_id: Mutex::new(Some(item.item_id)),
            replica_count: self.config.replica_count,
            is_local: item.is_local,
            state: Mutex::new(TransactionState::Downloading),
            chunks: Mutex::new(BTreeMap::new()),
            download_cv: Condvar::new(),
        });
        {
            let mut chunks = tx.chunks.lock();
            for cr in item.chunks() {
                chunks.insert(
                    cr.seek,
                    ChunkEntry {
                        seek: cr.seek,
                        size: cr.chunk_size,
                        status: ChunkStatus::Pending,
                        remote_key: cr.remote_key.clone(),
                        block_path: self.block_path(tx.id, cr.seek),
                    },
                );
            }
        }
        self.transactions.lock().insert(tx.id, tx.clone());
        Ok(tx)
    }

    fn block_path(&self, tx_id: u64, seek: u64) -> PathBuf {
        self.config.data_dir.join("blocks").join(format!("{tx_id}-{seek}"))
    }

    /// Allocate a fresh block file for a write transaction at `seek` and
    /// register its (initially pending) chunk entry.
    pub fn new_data_block_path(&self, tx: &Arc<Transaction>, seek: u64) -> Result<PathBuf> {
        std::fs::create_dir_all(self.config.data_dir.join("blocks"))?;
        let path = self.block_path(tx.id, seek);
        tx.chunks.lock().insert(
            seek,
            ChunkEntry {
                seek,
                size: 0,
                status: ChunkStatus::Pending,
                remote_key: None,
                block_path: path.clone(),
            },
        );
        Ok(path)
    }

    pub fn chunk_block_path(&self, tx: &Arc<Transaction>, seek: u64) -> Option<PathBuf> {
        tx.chunks.lock().get(&seek).map(|c| c.block_path.clone())
    }

    pub fn chunk_remote_key(&self, tx: &Arc<Transaction>, seek: u64) -> Option<String> {
        tx.chunks.lock().get(&seek).and_then(|c| c.remote_key.clone())
    }

    /// Cleartext length of the chunk owning `seek`, the `raw_len` a reader
    /// must hand [`crate::block::DataBlock::create`] to decode it correctly.
    pub fn chunk_size(&self, tx: &Arc<Transaction>, seek: u64) -> Option<u64> {
        tx.chunks.lock().get(&seek).map(|c| c.size)
    }

    /// Set a write transaction's lifecycle state, committing it to the
    /// catalog immediately if every chunk already finished uploading (the
    /// common case when uploads race ahead of the writer calling `close`).
    pub fn update_transaction_state(&self, tx: &Arc<Transaction>, state: TransactionState) -> Result<()> {
        tx.set_state(state);
        if tx.kind == TransactionKind::Write
            && state == TransactionState::LocalSaved
            && tx.chunk_statuses().iter().all(|s| *s == ChunkStatus::Done)
        {
            self.commit_write_transaction(tx)?;
        }
        Ok(())
    }

    /// Open a fresh block file for writing at `seek`, registering its
    /// (pending) chunk entry.
    pub fn new_write_block(&self, tx: &Arc<Transaction>, seek: u64) -> Result<crate::block::DataBlock> {
        let path = self.new_data_block_path(tx, seek)?;
        crate::block::DataBlock::create(
            path,
            None,
            self.locks.clone(),
            Some(self.security.as_ref()),
            self.config.read_try_count,
            self.config.read_sleep_time,
            self.config.buf_len,
        )
    }

    /// Open an existing chunk's block file for reading its cleartext.
    pub fn open_read_block(&self, tx: &Arc<Transaction>, chunk_seek: u64, path: &std::path::Path) -> Result<crate::block::DataBlock> {
        let raw_len = self.chunk_size(tx, chunk_seek);
        crate::block::DataBlock::create(
            path,
            raw_len,
            self.locks.clone(),
            Some(self.security.as_ref()),
            self.config.read_try_count,
            self.config.read_sleep_time,
            self.config.buf_len,
        )
    }

    /// Enqueue a finalized block for upload.
    pub fn transfer_data_block(&self, tx: &Arc<Transaction>, seek: u64, size: u64) -> Result<()> {
        {
            let mut chunks = tx.chunks.lock();
            if let Some(entry) = chunks.get_mut(&seek) {
                entry.size = size;
                entry.status = ChunkStatus::Inflight;
            }
        }
        self.upload_tx
            .send(UploadJob {
                transaction: tx.clone(),
                seek,
            })
            .map_err(|_| FabnetError::NoMetadata("upload queue closed".into()))
    }

    /// Called by a get-worker to materialize a chunk download.
    fn enqueue_download(&self, tx: &Arc<Transaction>, seek: u64) -> Result<()> {
        {
            let mut chunks = tx.chunks.lock();
            if let Some(entry) = chunks.get_mut(&seek) {
                if entry.status == ChunkStatus::Pending {
                    entry.status = ChunkStatus::Inflight;
                } else {
                    return Ok(());
                }
            }
        }
        self.download_tx
            .send(DownloadJob {
                transaction: tx.clone(),
                seek,
            })
            .map_err(|_| FabnetError::NoMetadata("download queue closed".into()))
    }

    /// Returns `(block_path, next_chunk_seek, remote_key, this_chunk_seek)`,
    /// blocking until the chunk covering `seek` is downloaded or the
    /// transaction fails.
    pub fn get_data_block(
        &self,
        tx: &Arc<Transaction>,
        seek: u64,
    ) -> Result<(Option<PathBuf>, Option<u64>, Option<String>, u64)> {
        let chunk_seek = {
            let chunks = tx.chunks.lock();
            chunks
                .range(..=seek)
                .next_back()
                .map(|(k, _)| *k)
        };
        let Some(chunk_seek) = chunk_seek else {
            return Ok((None, None, None, seek));
        };

        self.enqueue_download(tx, chunk_seek)?;

        let mut chunks = tx.chunks.lock();
        loop {
            let status = chunks.get(&chunk_seek).map(|c| c.status);
            match status {
                Some(ChunkStatus::Done) => break,
                Some(ChunkStatus::Failed) | None => {
                    return Err(FabnetError::TransactionFailed(tx.id));
                }
                _ => {
                    tx.download_cv.wait_for(&mut chunks, Duration::from_secs(30));
                }
            }
        }

        let entry = chunks.get(&chunk_seek).unwrap();
        let next_seek = chunks.range((chunk_seek + 1)..).next().map(|(k, _)| *k);
        Ok((Some(entry.block_path.clone()), next_seek, entry.remote_key.clone(), chunk_seek))
    }

    /// Record the outcome of a put/get for `(transaction_id, seek)`. Sticky
    /// on failure: a chunk already `Failed` is never moved back to `Done`.
    pub fn update_transaction(
        &self,
        transaction_id: u64,
        seek: u64,
        is_failed: bool,
        foreign_name: Option<String>,
    ) -> Result<()> {
        let Some(tx) = self.get_transaction(transaction_id) else {
            return Ok(());
        };

        {
            let mut chunks = tx.chunks.lock();
            if let Some(entry) = chunks.get_mut(&seek) {
                if entry.status != ChunkStatus::Failed {
                    if is_failed {
                        entry.status = ChunkStatus::Failed;
                    } else {
                        entry.status = ChunkStatus::Done;
                        if foreign_name.is_some() {
                            entry.remote_key = foreign_name;
                        }
                    }
                }
            }
        }
        tx.download_cv.notify_all();

        if is_failed {
            tx.set_state(TransactionState::Failed);
            warn!(transaction_id, seek, "chunk failed, transaction marked failed");
            return Ok(());
        }

        if tx.kind == TransactionKind::Write
            && tx.state() == TransactionState::LocalSaved
            && tx.chunk_statuses().iter().all(|s| *s == ChunkStatus::Done)
        {
            self.commit_write_transaction(&tx)?;
        }

        Ok(())
    }

    fn commit_write_transaction(&self, tx: &Arc<Transaction>) -> Result<()> {
        tx.set_state(TransactionState::Uploading);
        let chunks = tx.chunks.lock();
        let chunk_refs: Vec<ChunkRef> = chunks
            .values()
            .map(|c| ChunkRef {
                seek: c.seek,
                chunk_size: c.size,
                remote_key: c.remote_key.clone(),
                replica_count: tx.replica_count,
            })
            .collect();
        let total_size = chunk_refs.iter().map(|c| c.chunk_size).sum();
        drop(chunks);

        let (parent, name) = split_path(&tx.file_path);
        let item_id = *tx.item_id.lock();
        let mut item = match item_id {
            Some(id) => Item::new_file(id, 0, name),
            None => Item::new_file(0, 0, name),
        };
        item.is_local = tx.is_local;
        item.kind = ItemKind::File {
            size: total_size,
            chunks: chunk_refs,
        };

        let saved = self.catalog.append(Some(&parent), item, item_id)?;
        *tx.item_id.lock() = Some(saved.item_id);
        tx.set_state(TransactionState::Finished);
        debug!(transaction_id = tx.id, item_id = saved.item_id, "transaction committed");
        Ok(())
    }

    /// Used when a writer closes without ever writing a byte.
    pub fn save_empty_file(&self, file_path: &str) -> Result<()> {
        let (parent, name) = split_path(file_path);
        let item = Item::new_file(0, 0, name);
        self.catalog.append(Some(&parent), item, None)?;
        Ok(())
    }
}

/// Split `"/a/b/c.txt"` into `("/a/b", "c.txt")`.
pub fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = &trimmed[..idx];
            let parent = if parent.is_empty() { "/" } else { parent };
            (parent.to_string(), trimmed[idx + 1..].to_string())
        }
        None => ("/".to_string(), trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_handles_nested_and_root() {
        assert_eq!(split_path("/a/b/c.txt"), ("/a/b".into(), "c.txt".into()));
        assert_eq!(split_path("/a.txt"), ("/".into(), "a.txt".into()));
    }
}
