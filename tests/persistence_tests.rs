//! Integration tests for persistence: close/open cycles, journal replay,
//! flush policy, and locking.

mod common;

use std::collections::HashMap;
use std::fs;

use tempfile::TempDir;

use common::{create_filesystem, open_driver, put_bytes, read_bytes, test_hash, TEST_IV, TEST_KEY};
use elfs::dirent::DirentId;
use elfs::identity::{Permission, EVERYONE_GROUP_ID, ROOT_USER_ID};
use elfs::{Driver, DriverError};

#[test]
fn test_close_then_open_preserves_state() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"persisted", &a);
    let alice = driver.add_user(ROOT_USER_ID, "alice", test_hash("pw")).unwrap();
    let g = driver.add_group(alice, "grp").unwrap();
    driver
        .put_group_access(ROOT_USER_ID, &f, g, Permission::new(true, false))
        .unwrap();
    driver.close().unwrap();

    let driver = open_driver(dir.path());
    driver.sync_from_disk().unwrap();

    let entries = driver.list(ROOT_USER_ID, &a).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, f);
    assert_eq!(entries[0].size(), 9);
    assert_eq!(read_bytes(&driver, ROOT_USER_ID, &f), b"persisted");
    assert_eq!(read_bytes(&driver, alice, &f), b"persisted");

    let users = driver.users();
    assert_eq!(users.len(), 2);
    assert!(users.iter().any(|u| u.name == "alice"));
    assert!(driver.groups().iter().any(|gr| gr.id == g));

    driver.close().unwrap();
}

#[test]
fn test_second_create_fails() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());
    driver.close().unwrap();

    let driver = open_driver(dir.path());
    assert!(matches!(
        driver.create_filesystem(test_hash("other")),
        Err(DriverError::FilesystemExists)
    ));
    driver.close().unwrap();
}

#[test]
fn test_journal_replays_after_unclean_shutdown() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let a = driver
        .make_dir(ROOT_USER_ID, "a", &DirentId::root(), HashMap::new())
        .unwrap();
    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"journaled", &a);
    let (users_v, _, fat_v) = driver.table_versions();

    // Drop without close: the journal holds the mutations, the tables on
    // the backend are still at their creation versions, and the lock file
    // is left behind.
    drop(driver);

    let driver = Driver::open_local(&TEST_KEY, &TEST_IV, dir.path(), true).unwrap();
    driver.sync_from_disk().unwrap();

    assert_eq!(read_bytes(&driver, ROOT_USER_ID, &f), b"journaled");
    let (users_after, _, fat_after) = driver.table_versions();
    assert_eq!(users_after, users_v);
    assert_eq!(fat_after, fat_v);

    driver.close().unwrap();
}

#[test]
fn test_versions_are_monotonic_across_cycles() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());
    let mut last = driver.table_versions();
    assert_eq!(last, (1, 1, 1));

    for round in 0..3 {
        driver
            .make_dir(ROOT_USER_ID, &format!("d{round}"), &DirentId::root(), HashMap::new())
            .unwrap();
        driver
            .add_user(ROOT_USER_ID, &format!("u{round}"), test_hash("pw"))
            .unwrap();
        let current = driver.table_versions();
        assert!(current.0 > last.0 && current.2 > last.2);
        last = current;
    }
    driver.close().unwrap();

    let driver = open_driver(dir.path());
    driver.sync_from_disk().unwrap();
    assert_eq!(driver.table_versions(), last);
    driver.close().unwrap();
}

#[test]
fn test_journal_flushes_past_threshold() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    // Enough mutations that their journal entries far exceed the flush
    // threshold; the driver must rewrite the tables and truncate the
    // journal along the way.
    for i in 0..1500 {
        driver
            .make_dir(
                ROOT_USER_ID,
                &format!("directory-{i:04}"),
                &DirentId::root(),
                HashMap::new(),
            )
            .unwrap();
    }

    let cache_len = fs::metadata(dir.path().join("admin").join("cache"))
        .unwrap()
        .len();
    // Without any flush the journal would be well past 140 KiB; after the
    // threshold logic runs it never sits far above one threshold's worth.
    assert!(
        cache_len < 80 * 1024,
        "journal was never truncated: {cache_len} bytes"
    );

    driver.close().unwrap();

    let driver = open_driver(dir.path());
    driver.sync_from_disk().unwrap();
    assert_eq!(driver.list(ROOT_USER_ID, &DirentId::root()).unwrap().len(), 1500);
    driver.close().unwrap();
}

#[test]
fn test_stale_lock_requires_force() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());
    drop(driver);

    // The lock file survived the unclean shutdown.
    assert!(matches!(
        Driver::open_local(&TEST_KEY, &TEST_IV, dir.path(), false),
        Err(DriverError::Connector(_))
    ));

    let driver = Driver::open_local(&TEST_KEY, &TEST_IV, dir.path(), true).unwrap();
    driver.sync_from_disk().unwrap();
    driver.close().unwrap();
}

#[test]
fn test_everyone_permission_survives_reload() {
    let dir = TempDir::new().unwrap();
    let driver = create_filesystem(dir.path());

    let u = driver.add_user(ROOT_USER_ID, "u", test_hash("p")).unwrap();
    let f = put_bytes(&driver, ROOT_USER_ID, "f", b"x", &DirentId::root());
    driver
        .put_group_access(ROOT_USER_ID, &f, EVERYONE_GROUP_ID, Permission::new(true, false))
        .unwrap();
    driver.close().unwrap();

    let driver = open_driver(dir.path());
    driver.sync_from_disk().unwrap();
    assert_eq!(read_bytes(&driver, u, &f), b"x");
    driver.close().unwrap();
}
