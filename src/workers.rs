//! Put/get/delete worker pools draining the queues a [`TransactionsManager`]
//! exposes.
//!
//! Threaded, not async, matching the original design. Each pool is a fixed
//! number of OS threads polling its channel with a timeout so `stop()` can
//! ask them to exit without relying on the channel disconnecting (the
//! manager keeps its own sender alive for the lifetime of the [`Client`]).
//!
//! [`Client`]: crate::client::Client

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::block::DataBlock;
use crate::gateway::Gateway;
use crate::transactions::{DeleteJob, DownloadJob, Transaction, TransactionsManager, UploadJob};

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

fn open_existing_block(
    tm: &TransactionsManager,
    tx: &Arc<Transaction>,
    seek: u64,
) -> crate::error::Result<Option<DataBlock>> {
    let Some(path) = tm.chunk_block_path(tx, seek) else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let size = std::fs::metadata(&path)?.len();
    let block = DataBlock::create(
        path,
        Some(size),
        tm.locks().clone(),
        None,
        tm.config().read_try_count,
        tm.config().read_sleep_time,
        tm.config().buf_len,
    )?;
    Ok(Some(block))
}

fn new_local_block(
    tm: &TransactionsManager,
    tx: &Arc<Transaction>,
    seek: u64,
) -> crate::error::Result<DataBlock> {
    let path = tm
        .chunk_block_path(tx, seek)
        .unwrap_or_else(|| tm.new_data_block_path(tx, seek).expect("block dir creatable"));
    DataBlock::create(
        path,
        None,
        tm.locks().clone(),
        Some(tm.security().as_ref()),
        tm.config().read_try_count,
        tm.config().read_sleep_time,
        tm.config().buf_len,
    )
}

/// Uploads finalized local blocks; retries forever (or up to
/// `Config::max_put_retries`) with `Config::fg_error_timeout` backoff,
/// matching the original gateway's "never give up" put semantics.
pub struct PutWorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl PutWorkerPool {
    pub fn start(tm: Arc<TransactionsManager>, gateway: Arc<dyn Gateway>, count: usize) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for idx in 0..count {
            let tm = tm.clone();
            let gateway = gateway.clone();
            let stop_flag = stop_flag.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("PutWorker#{idx}"))
                    .spawn(move || put_worker_loop(tm, gateway, stop_flag))
                    .expect("spawn put worker"),
            );
        }
        Self { handles, stop_flag }
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn put_worker_loop(tm: Arc<TransactionsManager>, gateway: Arc<dyn Gateway>, stop_flag: Arc<AtomicBool>) {
    let rx = tm.upload_receiver();
    let tx_retry = tm.upload_sender();
    let mut attempts: std::collections::HashMap<(u64, u64), u32> = std::collections::HashMap::new();

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let job = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(job) => job,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };

        if job.transaction.is_failed() {
            continue;
        }

        let UploadJob { transaction, seek } = job;
        let mut block = match open_existing_block(&tm, &transaction, seek) {
            Ok(Some(block)) => block,
            Ok(None) => {
                error!(transaction_id = transaction.id, seek, "data block missing from local cache, failing transaction");
                let _ = tm.update_transaction(transaction.id, seek, true, None);
                continue;
            }
            Err(err) => {
                // Opening failed for a reason other than "not there" (e.g. a
                // transient I/O error) — fall through to the ordinary retry path.
                let tries = attempts.entry((transaction.id, seek)).or_insert(0);
                *tries += 1;
                let retry_limit = tm.config().max_put_retries;
                error!(transaction_id = transaction.id, seek, %err, tries = *tries, "opening data block for upload failed");
                if retry_limit.is_some_and(|max| *tries >= max) {
                    warn!(transaction_id = transaction.id, seek, "put retry limit reached, failing transaction");
                    let _ = tm.update_transaction(transaction.id, seek, true, None);
                    continue;
                }
                std::thread::sleep(tm.config().fg_error_timeout);
                if tx_retry.send(UploadJob { transaction, seek }).is_err() {
                    return;
                }
                continue;
            }
        };

        let result = (|| -> crate::error::Result<String> {
            let key = gateway
                .put(&mut block, transaction.replica_count, false)
                .map_err(crate::error::FabnetError::Gateway)?;
            block.close();
            Ok(key)
        })();

        match result {
            Ok(key) => {
                attempts.remove(&(transaction.id, seek));
                let _ = tm.update_transaction(transaction.id, seek, false, Some(key));
            }
            Err(err) => {
                let tries = attempts.entry((transaction.id, seek)).or_insert(0);
                *tries += 1;
                let retry_limit = tm.config().max_put_retries;
                error!(transaction_id = transaction.id, seek, %err, tries = *tries, "put data block failed");
                if retry_limit.is_some_and(|max| *tries >= max) {
                    warn!(transaction_id = transaction.id, seek, "put retry limit reached, failing transaction");
                    let _ = tm.update_transaction(transaction.id, seek, true, None);
                    continue;
                }
                std::thread::sleep(tm.config().fg_error_timeout);
                if tx_retry.send(UploadJob { transaction, seek }).is_err() {
                    return;
                }
            }
        }
    }
}

/// Downloads blocks on demand for [`crate::smart_file::SmartFileObject`]
/// reads. One retry, then the transaction is failed — callers waiting in
/// `get_data_block` are unblocked either way.
pub struct GetWorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl GetWorkerPool {
    pub fn start(tm: Arc<TransactionsManager>, gateway: Arc<dyn Gateway>, count: usize) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for idx in 0..count {
            let tm = tm.clone();
            let gateway = gateway.clone();
            let stop_flag = stop_flag.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("GetWorker#{idx}"))
                    .spawn(move || get_worker_loop(tm, gateway, stop_flag))
                    .expect("spawn get worker"),
            );
        }
        Self { handles, stop_flag }
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn get_worker_loop(tm: Arc<TransactionsManager>, gateway: Arc<dyn Gateway>, stop_flag: Arc<AtomicBool>) {
    let rx = tm.download_receiver();

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let job = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(job) => job,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };

        let DownloadJob { transaction, seek } = job;
        if transaction.is_failed() {
            debug!(transaction_id = transaction.id, "transaction already failed, skipping download");
            continue;
        }

        let remote_key = tm.chunk_remote_key(&transaction, seek);
        let Some(remote_key) = remote_key else {
            warn!(transaction_id = transaction.id, seek, "no remote key for chunk");
            let _ = tm.update_transaction(transaction.id, seek, true, None);
            continue;
        };

        let mut last_err = None;
        let mut local_name = None;
        for attempt in 0..2 {
            if attempt > 0 {
                std::thread::sleep(tm.config().fg_error_timeout);
            }
            let attempt_result = (|| -> crate::error::Result<String> {
                let mut block = new_local_block(&tm, &transaction, seek)?;
                gateway
                    .get(&remote_key, transaction.replica_count, &mut block)
                    .map_err(crate::error::FabnetError::Gateway)?;
                let name = block.name();
                block.close();
                Ok(name)
            })();
            match attempt_result {
                Ok(name) => {
                    local_name = Some(name);
                    last_err = None;
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }

        match local_name {
            Some(name) => {
                let _ = tm.update_transaction(transaction.id, seek, false, Some(name));
            }
            None => {
                if let Some(err) = last_err {
                    error!(transaction_id = transaction.id, seek, %err, "get data block failed after retry");
                }
                if let Some(path) = tm.chunk_block_path(&transaction, seek) {
                    let _ = std::fs::remove_file(path);
                }
                let _ = tm.update_transaction(transaction.id, seek, true, None);
            }
        }
    }
}

/// Fire-and-forget remote object deletion. Failures are logged, never
/// retried — a leaked remote object is cheaper than blocking shutdown.
pub struct DeleteWorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl DeleteWorkerPool {
    pub fn start(tm: Arc<TransactionsManager>, gateway: Arc<dyn Gateway>, count: usize) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for idx in 0..count {
            let rx = tm.delete_receiver();
            let gateway = gateway.clone();
            let stop_flag = stop_flag.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("DeleteWorker#{idx}"))
                    .spawn(move || delete_worker_loop(rx, gateway, stop_flag))
                    .expect("spawn delete worker"),
            );
        }
        Self { handles, stop_flag }
    }

    pub fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn delete_worker_loop(
    rx: crossbeam_channel::Receiver<DeleteJob>,
    gateway: Arc<dyn Gateway>,
    stop_flag: Arc<AtomicBool>,
) {
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let job = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(job) => job,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        if let Err(err) = gateway.remove(&job.remote_key, job.replica_count) {
            warn!(remote_key = %job.remote_key, %err, "delete worker failed, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::Config;
    use crate::gateway::MockGateway;
    use crate::lock::LockRegistry;
    use crate::security::NullSecurityManager;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> Arc<TransactionsManager> {
        let catalog = Arc::new(Catalog::open(dir.join("catalog"), None).unwrap());
        let locks = Arc::new(LockRegistry::new());
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        config.fg_error_timeout = Duration::from_millis(5);
        Arc::new(TransactionsManager::new(catalog, locks, Arc::new(NullSecurityManager), config))
    }

    #[test]
    fn put_worker_uploads_and_commits_transaction() {
        let dir = tempdir().unwrap();
        let tm = manager(dir.path());
        let gateway: Arc<dyn Gateway> = Arc::new(MockGateway::new());

        let tx = tm.start_upload_transaction("/a.bin", false);
        let path = tm.new_data_block_path(&tx, 0).unwrap();
        std::fs::write(&path, b"payload").unwrap();
        tm.transfer_data_block(&tx, 0, 7).unwrap();
        tx.set_state(crate::transactions::TransactionState::LocalSaved);

        let pool = PutWorkerPool::start(tm.clone(), gateway.clone(), 1);
        for _ in 0..50 {
            if tx.state() == crate::transactions::TransactionState::Finished {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(tx.state(), crate::transactions::TransactionState::Finished);
        pool.stop();
    }
}
