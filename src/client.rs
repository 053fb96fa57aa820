//! Top-level handle wiring the catalog, lock registry, transactions
//! manager, and worker pools into one object.

use std::sync::Arc;

use tracing::info;

use crate::catalog::item::Item;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{FabnetError, Result};
use crate::gateway::Gateway;
use crate::journal::Journal;
use crate::lock::LockRegistry;
use crate::security::SecurityManager;
use crate::smart_file::SmartFileObject;
use crate::transactions::{split_path, TransactionsManager};
use crate::workers::{DeleteWorkerPool, GetWorkerPool, PutWorkerPool};

pub struct Client {
    transactions: Arc<TransactionsManager>,
    put_pool: Option<PutWorkerPool>,
    get_pool: Option<GetWorkerPool>,
    delete_pool: Option<DeleteWorkerPool>,
}

impl Client {
    /// Open (or create) the local catalog and journal under
    /// `config.data_dir` and start the worker pools against `gateway`.
    pub fn open(config: Config, gateway: Arc<dyn Gateway>, security: Arc<dyn SecurityManager>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let journal = Arc::new(Journal::open(config.data_dir.join("journal.log"))?);
        let catalog = Arc::new(Catalog::open(config.data_dir.join("catalog"), Some(journal))?);
        let locks = Arc::new(LockRegistry::new());

        let put_count = config.parallel_put_count;
        let get_count = config.parallel_get_count;
        let transactions = Arc::new(TransactionsManager::new(catalog, locks, security, config));

        let put_pool = PutWorkerPool::start(transactions.clone(), gateway.clone(), put_count);
        let get_pool = GetWorkerPool::start(transactions.clone(), gateway.clone(), get_count);
        let delete_pool = DeleteWorkerPool::start(transactions.clone(), gateway, 1);

        info!("client opened");
        Ok(Self {
            transactions,
            put_pool: Some(put_pool),
            get_pool: Some(get_pool),
            delete_pool: Some(delete_pool),
        })
    }

    pub fn create_file(&self, path: &str) -> SmartFileObject {
        SmartFileObject::open(self.transactions.clone(), path, true)
    }

    pub fn open_file(&self, path: &str) -> SmartFileObject {
        SmartFileObject::open(self.transactions.clone(), path, false)
    }

    pub fn mkdir(&self, path: &str) -> Result<Item> {
        let (parent, name) = split_path(path);
        self.transactions
            .catalog()
            .append(Some(&parent), Item::new_directory(0, 0, name), None)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let item = self.transactions.catalog().find(path)?;
        if item.item_id == 0 {
            return Err(FabnetError::Permissions("cannot remove the root directory".into()));
        }
        for chunk in item.chunks() {
            if let Some(key) = &chunk.remote_key {
                let _ = self.transactions.delete_sender().send(crate::transactions::DeleteJob {
                    remote_key: key.clone(),
                    replica_count: chunk.replica_count,
                });
            }
        }
        self.transactions.catalog().remove(&item)
    }

    pub fn listdir(&self, path: &str) -> Result<Vec<Item>> {
        self.transactions.catalog().listdir(path)
    }

    pub fn stat(&self, path: &str) -> Result<Item> {
        self.transactions.catalog().find(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.transactions.catalog().exists(path)
    }

    pub fn close(mut self) -> Result<()> {
        if let Some(p) = self.put_pool.take() {
            p.stop();
        }
        if let Some(p) = self.get_pool.take() {
            p.stop();
        }
        if let Some(p) = self.delete_pool.take() {
            p.stop();
        }
        self.transactions.catalog().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::security::NullSecurityManager;
    use tempfile::tempdir;

    fn client(dir: &std::path::Path) -> Client {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        Client::open(config, Arc::new(MockGateway::new()), Arc::new(NullSecurityManager)).unwrap()
    }

    #[test]
    fn write_then_read_round_trips_through_worker_pools() {
        let dir = tempdir().unwrap();
        let c = client(dir.path());

        let mut w = c.create_file("/hello.txt");
        w.write(b"hello, fabnet").unwrap();
        w.close().unwrap();

        // Give the background put workers a moment to finish uploading.
        for _ in 0..100 {
            if matches!(c.stat("/hello.txt"), Ok(item) if item.size() == 13) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let item = c.stat("/hello.txt").unwrap();
        assert_eq!(item.size(), 13);

        let mut r = c.open_file("/hello.txt");
        let data = r.read(None).unwrap();
        assert_eq!(data, b"hello, fabnet");
        r.close().unwrap();

        c.close().unwrap();
    }

    #[test]
    fn mkdir_and_listdir() {
        let dir = tempdir().unwrap();
        let c = client(dir.path());
        c.mkdir("/docs").unwrap();
        let listing = c.listdir("/").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "docs");
        c.close().unwrap();
    }
}
