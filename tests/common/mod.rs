//! Shared fixtures for the integration tests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use elfs::dirent::DirentId;
use elfs::identity::{GroupId, Permission, UserId, PASSWORD_HASH_SIZE};
use elfs::Driver;

pub const TEST_KEY: [u8; 16] = [0x11; 16];
pub const TEST_IV: [u8; 16] = [0x22; 16];
pub const ROOT_PASSWORD: &str = "rootpw";

pub fn test_hash(password: &str) -> [u8; PASSWORD_HASH_SIZE] {
    Sha256::digest(password.as_bytes()).into()
}

/// Attach a driver to the backend directory without loading anything.
pub fn open_driver(path: &Path) -> Driver {
    Driver::open_local(&TEST_KEY, &TEST_IV, path, false).unwrap()
}

/// Attach and create a fresh filesystem with the standard root password.
pub fn create_filesystem(path: &Path) -> Driver {
    let driver = open_driver(path);
    driver.create_filesystem(test_hash(ROOT_PASSWORD)).unwrap();
    driver
}

pub fn put_bytes(
    driver: &Driver,
    user: UserId,
    name: &str,
    bytes: &[u8],
    parent: &DirentId,
) -> DirentId {
    put_bytes_with_perms(driver, user, name, bytes, parent, HashMap::new())
}

pub fn put_bytes_with_perms(
    driver: &Driver,
    user: UserId,
    name: &str,
    bytes: &[u8],
    parent: &DirentId,
    perms: HashMap<GroupId, Permission>,
) -> DirentId {
    let mut content = Cursor::new(bytes.to_vec());
    driver.put(user, name, &mut content, perms, parent).unwrap()
}

pub fn read_bytes(driver: &Driver, user: UserId, id: &DirentId) -> Vec<u8> {
    let mut reader = driver.read(user, id).unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).unwrap();
    bytes
}
