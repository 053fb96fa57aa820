//! In-process configuration knobs.
//!
//! There is no config-file format here — callers build a [`Config`] in code
//! and hand it to [`crate::client::Client::open`]. Field defaults mirror the
//! values the storage engine was tuned against.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TmpFilePattern {
    pub name_regex: String,
    pub max_size: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Local cache root for block files and the catalog KV store.
    pub data_dir: PathBuf,
    /// Upper bound on a single data block's cleartext size.
    pub max_data_block_size: u64,
    /// Read buffer size used when tailing a block file.
    pub buf_len: usize,
    /// Number of re-open-and-retry attempts before a tailing read times out.
    pub read_try_count: u32,
    /// Delay between tailing-read retries.
    pub read_sleep_time: Duration,
    /// Delay before a failed gateway put/get is requeued.
    pub fg_error_timeout: Duration,
    pub parallel_put_count: usize,
    pub parallel_get_count: usize,
    /// 0 means unlimited local cache size. Accepted for forward compatibility;
    /// nothing currently evicts blocks once this is exceeded (see DESIGN.md).
    pub cache_size: u64,
    pub replica_count: u8,
    /// Files matching one of these patterns never leave the local cache.
    pub tmp_file_patterns: Vec<TmpFilePattern>,
    /// Cap on put-worker retries. `None` preserves the original unconditional
    /// retry-until-success behavior.
    pub max_put_retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            max_data_block_size: 16 * 1024 * 1024,
            buf_len: 64 * 1024,
            read_try_count: 5,
            read_sleep_time: Duration::from_secs(2),
            fg_error_timeout: Duration::from_secs(5),
            parallel_put_count: 3,
            parallel_get_count: 3,
            cache_size: 0,
            replica_count: 2,
            tmp_file_patterns: vec![TmpFilePattern {
                name_regex: r"^\._.+".to_string(),
                max_size: 4096,
            }],
            max_put_retries: None,
        }
    }
}
