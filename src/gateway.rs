//! The remote content-addressed store, abstracted behind a trait.
//!
//! The wire protocol and transport security of the real "fabnet" gateway
//! are out of scope; callers supply any [`Gateway`] implementation. A
//! [`MockGateway`] (in-memory) is provided for tests and the CLI.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::block::DataBlock;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("remote key not found: {0}")]
    NotFound(String),
    #[error("transient gateway failure: {0}")]
    Transient(String),
}

pub trait Gateway: Send + Sync {
    /// Upload the data block's ciphertext, returning its remote key
    /// (normally the block's own checksum). `allow_rewrite` controls
    /// whether an existing object at that key may be overwritten.
    fn put(&self, block: &mut DataBlock, replica_count: u8, allow_rewrite: bool) -> Result<String, GatewayError>;
    fn get(&self, remote_key: &str, replica_count: u8, block_out: &mut DataBlock) -> Result<(), GatewayError>;
    fn remove(&self, remote_key: &str, replica_count: u8) -> Result<(), GatewayError>;
}

/// In-memory stand-in for the remote store, keyed by checksum.
#[derive(Default)]
pub struct MockGateway {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Gateway for MockGateway {
    fn put(&self, block: &mut DataBlock, _replica_count: u8, allow_rewrite: bool) -> Result<String, GatewayError> {
        let data = block
            .read_raw(None)
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        let key = block.checksum();
        let mut objects = self.objects.lock().unwrap();
        if !allow_rewrite && objects.contains_key(&key) {
            return Ok(key);
        }
        objects.insert(key.clone(), data);
        Ok(key)
    }

    fn get(&self, remote_key: &str, _replica_count: u8, block_out: &mut DataBlock) -> Result<(), GatewayError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(remote_key)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(remote_key.to_string()))?;
        block_out
            .write_raw_bytes(&data)
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, remote_key: &str, _replica_count: u8) -> Result<(), GatewayError> {
        self.objects.lock().unwrap().remove(remote_key);
        Ok(())
    }
}
