//! # fabnet-client — distributed content-addressed object store client
//!
//! Design invariants:
//! - A data block's remote key is the SHA-1 digest of its ciphertext; the
//!   gateway is a pure content-addressed store, never told a logical path
//! - The catalog (directory tree) is local-only state rebuilt by replaying
//!   the append-only journal; the journal, not the KV cache, is authoritative
//! - Every catalog mutation holds the single process-wide "MD-Lock" for its
//!   duration — correctness over throughput
//! - A chunk transitions `Failed` at most once and never recovers; a
//!   transaction fails permanently the moment any of its chunks does

pub mod block;
pub mod catalog;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod journal;
pub mod lock;
pub mod security;
pub mod smart_file;
pub mod transactions;
pub mod workers;

pub use client::Client;
pub use config::Config;
pub use error::{FabnetError, Result};
pub use gateway::{Gateway, GatewayError, MockGateway};
pub use security::{AesGcmSecurityManager, NullSecurityManager, SecurityManager};
