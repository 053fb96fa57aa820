use std::sync::Arc;

use fabnet_client::{Client, Config, MockGateway, NullSecurityManager};
use tempfile::tempdir;

fn client(dir: &std::path::Path) -> Client {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.max_data_block_size = 16;
    Client::open(config, Arc::new(MockGateway::new()), Arc::new(NullSecurityManager)).unwrap()
}

fn wait_for_size(client: &Client, path: &str, size: u64) {
    for _ in 0..200 {
        if matches!(client.stat(path), Ok(item) if item.size() == size) {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("timed out waiting for {path} to reach size {size}");
}

#[test]
fn round_trips_a_file_spanning_multiple_blocks() {
    let dir = tempdir().unwrap();
    let c = client(dir.path());

    let payload: Vec<u8> = (0..100u8).collect();
    let mut w = c.create_file("/spans.bin");
    w.write(&payload).unwrap();
    w.close().unwrap();

    wait_for_size(&c, "/spans.bin", payload.len() as u64);

    let mut r = c.open_file("/spans.bin");
    let read_back = r.read(None).unwrap();
    r.close().unwrap();
    assert_eq!(read_back, payload);

    c.close().unwrap();
}

#[test]
fn closing_without_writing_creates_a_zero_byte_file() {
    let dir = tempdir().unwrap();
    let c = client(dir.path());

    let mut w = c.create_file("/empty.bin");
    w.close().unwrap();

    let item = c.stat("/empty.bin").unwrap();
    assert_eq!(item.size(), 0);
    assert!(item.chunks().is_empty());
    c.close().unwrap();
}

#[test]
fn directory_tree_navigates_and_rejects_duplicate_names() {
    let dir = tempdir().unwrap();
    let c = client(dir.path());

    c.mkdir("/docs").unwrap();
    let mut w = c.create_file("/docs/readme.txt");
    w.write(b"hi").unwrap();
    w.close().unwrap();
    wait_for_size(&c, "/docs/readme.txt", 2);

    let listing = c.listdir("/docs").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "readme.txt");

    let err = c.mkdir("/docs").unwrap_err();
    assert!(matches!(err, fabnet_client::FabnetError::AlreadyExists(_)));

    c.close().unwrap();
}

#[test]
fn removing_a_non_empty_directory_fails_until_emptied() {
    let dir = tempdir().unwrap();
    let c = client(dir.path());

    c.mkdir("/docs").unwrap();
    let mut w = c.create_file("/docs/a.txt");
    w.write(b"x").unwrap();
    w.close().unwrap();
    wait_for_size(&c, "/docs/a.txt", 1);

    assert!(c.remove("/docs").is_err());
    c.remove("/docs/a.txt").unwrap();
    c.remove("/docs").unwrap();
    assert!(!c.exists("/docs"));

    c.close().unwrap();
}

#[test]
fn catalog_survives_local_cache_loss_by_replaying_the_journal() {
    let dir = tempdir().unwrap();
    {
        let c = client(dir.path());
        c.mkdir("/a").unwrap();
        c.mkdir("/b").unwrap();
        c.close().unwrap();
    }

    std::fs::remove_dir_all(dir.path().join("catalog")).unwrap();

    let c2 = client(dir.path());
    let names: Vec<_> = c2.listdir("/").unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"a".to_string()));
    assert!(names.contains(&"b".to_string()));
    c2.close().unwrap();
}

#[test]
fn tmp_pattern_files_never_enter_the_catalog() {
    let dir = tempdir().unwrap();
    let c = client(dir.path());

    let mut w = c.create_file("/._cache.tmp");
    w.write(b"scratch").unwrap();
    w.close().unwrap();

    // is_local items are never journaled or committed to the catalog.
    assert!(!c.exists("/._cache.tmp"));

    c.close().unwrap();
}
