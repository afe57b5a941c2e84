//! Integration tests for the driver lifecycle and dirent operations.

mod common;

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use tempfile::TempDir;

use common::{create_filesystem, put_bytes, read_bytes, test_hash, ROOT_PASSWORD};
use elfs::dirent::DirentId;
use elfs::identity::ROOT_USER_ID;
use elfs::DriverError;

#[test]
fn test_create_filesystem_and_authenticate() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let root = driver.user_auth("root", &test_hash(ROOT_PASSWORD)).unwrap();
    assert_eq!(root.id, ROOT_USER_ID);
    assert_eq!(root.name, "root");

    assert!(matches!(
        driver.user_auth("root", &test_hash("bad")),
        Err(DriverError::AuthFailed)
    ));
    assert!(matches!(
        driver.user_auth("nobody", &test_hash(ROOT_PASSWORD)),
        Err(DriverError::AuthFailed)
    ));

    driver.close().unwrap();
}

#[test]
fn test_put_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let id = put_bytes(&driver, ROOT_USER_ID, "f", b"hello", &DirentId::root());

    let entries = driver.list(ROOT_USER_ID, &DirentId::root()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "f");
    assert_eq!(entries[0].size(), 5);
    assert_eq!(
        entries[0].content_md5().map(hex::encode).as_deref(),
        // MD5("hello")
        Some("5d41402abc4b2a76b9719d911017c592")
    );

    assert_eq!(read_bytes(&driver, ROOT_USER_ID, &id), b"hello");
    driver.close().unwrap();
}

#[test]
fn test_large_put_round_trips_and_seeks() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let content: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 253) as u8).collect();
    let id = put_bytes(&driver, ROOT_USER_ID, "big", &content, &DirentId::root());

    assert_eq!(read_bytes(&driver, ROOT_USER_ID, &id), content);

    let mut reader = driver.read(ROOT_USER_ID, &id).unwrap();
    let offset = 2 * 1024 * 1024 + 5;
    reader.seek(SeekFrom::Start(offset as u64)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &content[offset..]);

    driver.close().unwrap();
}

#[test]
fn test_put_replaces_existing_file() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let first = put_bytes(&driver, ROOT_USER_ID, "f", b"old contents", &DirentId::root());
    let second = put_bytes(&driver, ROOT_USER_ID, "f", b"new", &DirentId::root());

    // Replacement is delete + recreate: the id changes and the old id is gone.
    assert_ne!(first, second);
    assert!(matches!(
        driver.read(ROOT_USER_ID, &first),
        Err(DriverError::NotFound { .. })
    ));

    let entries = driver.list(ROOT_USER_ID, &DirentId::root()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].size(), 3);
    assert_eq!(read_bytes(&driver, ROOT_USER_ID, &second), b"new");

    driver.close().unwrap();
}

#[test]
fn test_put_does_not_replace_directory() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    driver
        .make_dir(ROOT_USER_ID, "x", &DirentId::root(), HashMap::new())
        .unwrap();
    let mut content = Cursor::new(b"data".to_vec());
    assert!(matches!(
        driver.put(ROOT_USER_ID, "x", &mut content, HashMap::new(), &DirentId::root()),
        Err(DriverError::IsADirectory { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_mkdir_rejects_duplicate_names() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    assert!(matches!(
        driver.make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new()),
        Err(DriverError::NameExists { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_move_rejects_cycles_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    let b = driver.make_dir(ROOT_USER_ID, "b", &a, HashMap::new()).unwrap();

    // Moving a into its own descendant would form a cycle.
    assert!(matches!(
        driver.move_dirent(ROOT_USER_ID, &a, &b),
        Err(DriverError::CycleWouldForm { .. })
    ));

    // b is already under a; the move is an idempotent no-op.
    driver.move_dirent(ROOT_USER_ID, &b, &a).unwrap();

    // Moving into itself is also a cycle.
    assert!(matches!(
        driver.move_dirent(ROOT_USER_ID, &a, &a),
        Err(DriverError::CycleWouldForm { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_move_between_directories() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"x", &DirentId::root());

    driver.move_dirent(ROOT_USER_ID, &f, &a).unwrap();

    let root_entries = driver.list(ROOT_USER_ID, &DirentId::root()).unwrap();
    assert_eq!(root_entries.len(), 1);
    assert_eq!(root_entries[0].id, a);

    let a_entries = driver.list(ROOT_USER_ID, &a).unwrap();
    assert_eq!(a_entries.len(), 1);
    assert_eq!(a_entries[0].id, f);
    assert_eq!(a_entries[0].parent, a);

    driver.close().unwrap();
}

#[test]
fn test_move_rejects_name_collision() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    put_bytes(&driver, ROOT_USER_ID, "f", b"inside", &a);
    let f2 = put_bytes(&driver, ROOT_USER_ID, "f", b"outside", &DirentId::root());

    assert!(matches!(
        driver.move_dirent(ROOT_USER_ID, &f2, &a),
        Err(DriverError::NameExists { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_rename() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let f = put_bytes(&driver, ROOT_USER_ID, "old", b"x", &DirentId::root());
    let g = put_bytes(&driver, ROOT_USER_ID, "other", b"y", &DirentId::root());

    driver.rename(ROOT_USER_ID, &f, "new").unwrap();
    let info = driver.get_dirent(ROOT_USER_ID, &f).unwrap();
    assert_eq!(info.name, "new");

    assert!(matches!(
        driver.rename(ROOT_USER_ID, &g, "new"),
        Err(DriverError::NameExists { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_remove_file_and_shape_mismatches() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"x", &DirentId::root());
    let d = driver
        .make_dir(ROOT_USER_ID, "d", &DirentId::root(), HashMap::new())
        .unwrap();

    assert!(matches!(
        driver.remove_file(ROOT_USER_ID, &d),
        Err(DriverError::IsADirectory { .. })
    ));
    assert!(matches!(
        driver.remove_dir(ROOT_USER_ID, &f),
        Err(DriverError::NotADirectory { .. })
    ));

    driver.remove_file(ROOT_USER_ID, &f).unwrap();
    assert!(matches!(
        driver.read(ROOT_USER_ID, &f),
        Err(DriverError::NotFound { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_recursive_remove() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    let b = driver.make_dir(ROOT_USER_ID, "b", &a, HashMap::new()).unwrap();
    put_bytes(&driver, ROOT_USER_ID, "f1", b"1", &a);
    put_bytes(&driver, ROOT_USER_ID, "f2", b"2", &b);

    driver.remove_dir(ROOT_USER_ID, &a).unwrap();

    assert!(driver.list(ROOT_USER_ID, &DirentId::root()).unwrap().is_empty());
    assert!(matches!(
        driver.get_dirent(ROOT_USER_ID, &b),
        Err(DriverError::NotFound { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_root_cannot_be_moved_or_removed() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();

    assert!(matches!(
        driver.move_dirent(ROOT_USER_ID, &DirentId::root(), &a),
        Err(DriverError::BadParameter(_))
    ));
    assert!(matches!(
        driver.remove_dir(ROOT_USER_ID, &DirentId::root()),
        Err(DriverError::BadParameter(_))
    ));

    driver.close().unwrap();
}

#[test]
fn test_reader_survives_removal() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"still readable", &DirentId::root());
    let mut reader = driver.read(ROOT_USER_ID, &f).unwrap();

    driver.remove_file(ROOT_USER_ID, &f).unwrap();

    // The open handle keeps working; new operations on the id fail.
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes, b"still readable");
    assert!(matches!(
        driver.read(ROOT_USER_ID, &f),
        Err(DriverError::NotFound { .. })
    ));

    driver.close().unwrap();
}

#[test]
fn test_change_owner() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let alice = driver.add_user(ROOT_USER_ID, "alice", test_hash("a")).unwrap();
    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"x", &DirentId::root());

    assert!(matches!(
        driver.change_owner(ROOT_USER_ID, &f, 999),
        Err(DriverError::NotFound { .. })
    ));

    driver.change_owner(ROOT_USER_ID, &f, alice).unwrap();
    assert_eq!(driver.get_dirent(ROOT_USER_ID, &f).unwrap().owner, alice);

    // The new owner has full access without any group permissions.
    assert_eq!(read_bytes(&driver, alice, &f), b"x");

    driver.close().unwrap();
}
