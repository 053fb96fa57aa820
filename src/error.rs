//! Error taxonomy shared by every component.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabnetError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("item {0} not found")]
    NotFound(u64),

    #[error("item already exists: {0}")]
    AlreadyExists(String),

    #[error("directory is not empty: {0}")]
    NotEmpty(String),

    #[error("no free item identifier available")]
    NoFreeIdentificator,

    #[error("timed out reading data block at {0}")]
    Timeout(String),

    #[error("file opened in the wrong mode: {0}")]
    Permissions(String),

    #[error("operation on closed file: {0}")]
    ClosedFile(String),

    #[error("metadata inconsistency: {0}")]
    NoMetadata(String),

    #[error("transaction {0} has failed")]
    TransactionFailed(u64),

    #[error("gateway error: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),

    #[error("catalog store error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FabnetError>;
