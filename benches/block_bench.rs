use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fabnet_client::lock::LockRegistry;
use fabnet_client::security::NullSecurityManager;
use fabnet_client::block::DataBlock;
use tempfile::tempdir;

fn bench_block_write(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024];
    let dir = tempdir().unwrap();
    let locks = Arc::new(LockRegistry::new());

    c.bench_function("data_block_write_1mb", |b| {
        b.iter(|| {
            let path = dir.path().join(format!("bench-{}", rand_suffix()));
            let mut block = DataBlock::create(
                path,
                Some(data.len() as u64),
                locks.clone(),
                Some(&NullSecurityManager),
                3,
                Duration::from_millis(10),
                64 * 1024,
            )
            .unwrap();
            block.write(black_box(&data), true).unwrap();
            block.close();
        })
    });
}

// criterion::black_box-friendly unique suffix without relying on Instant/random
// crates the harness can't provide; a thread-local counter is sufficient here
// since this benchmark only needs distinct file names, not true randomness.
fn rand_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

criterion_group!(benches, bench_block_write);
criterion_main!(benches);
