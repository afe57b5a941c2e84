//! Filesystem lifecycle: creation, loading, and invariant validation.

use std::collections::{HashMap, HashSet};
use std::io;

use tracing::{debug, info, instrument};

use super::{Driver, DriverError, DriverState};
use crate::cache::MetadataCache;
use crate::connector::ConnectorError;
use crate::dirent::Dirent;
use crate::identity::{User, ROOT_USER_ID, ROOT_USER_NAME, PASSWORD_HASH_SIZE};
use crate::metadata::{self, CacheOp, TableKind, FAT_BLOB, GROUPS_BLOB, USERS_BLOB};

impl Driver {
    /// Initialize a fresh filesystem on the backend.
    ///
    /// Fails with [`DriverError::FilesystemExists`] if any metadata blob is
    /// already present. Seeds the ROOT user with the given password digest
    /// and an empty root directory owned by ROOT, and persists all three
    /// tables at version 1. No cache journal is written.
    #[instrument(level = "info", skip(self, root_password_hash))]
    pub fn create_filesystem(
        &self,
        root_password_hash: [u8; PASSWORD_HASH_SIZE],
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        for (name, iv) in [
            (USERS_BLOB, &self.users_iv),
            (GROUPS_BLOB, &self.groups_iv),
            (FAT_BLOB, &self.fat_iv),
        ] {
            match self.connector.metadata_reader(name, &self.key, iv) {
                Ok(_) => return Err(DriverError::FilesystemExists),
                Err(ConnectorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.connector.prepare_storage()?;

        let mut fresh = DriverState::empty();
        let root_user = User::new(ROOT_USER_ID, ROOT_USER_NAME, root_password_hash);
        fresh.users.insert(root_user.id, root_user);
        let root_dirent = Dirent::root_directory(ROOT_USER_ID);
        fresh.fat.insert(root_dirent.id.clone(), root_dirent);
        fresh.users_version = 1;
        fresh.groups_version = 1;
        fresh.fat_version = 1;
        fresh.rebuild_dirs();

        self.write_tables(&fresh)?;
        *state = fresh;

        info!("created filesystem");
        Ok(())
    }

    /// Load the filesystem from the backend: decrypt the tables, replay
    /// the cache journal, rebuild the child index, and validate the
    /// invariants. Fails fast on any inconsistency.
    #[instrument(level = "info", skip(self))]
    pub fn sync_from_disk(&self) -> Result<(), DriverError> {
        let mut loaded = DriverState::empty();

        let mut reader = self.read_metadata(USERS_BLOB, &self.users_iv)?;
        (loaded.users_version, loaded.users) = metadata::read_users_table(&mut reader)?;

        let mut reader = self.read_metadata(GROUPS_BLOB, &self.groups_iv)?;
        (loaded.groups_version, loaded.groups) = metadata::read_groups_table(&mut reader)?;

        let mut reader = self.read_metadata(FAT_BLOB, &self.fat_iv)?;
        (loaded.fat_version, loaded.fat) = metadata::read_fat_table(&mut reader)?;

        loaded.cache = MetadataCache::load(self.connector.as_ref(), &self.key, &self.cache_iv)?;
        replay_journal(&mut loaded)?;
        loaded.rebuild_dirs();
        validate_invariants(&loaded)?;

        debug!(
            users = loaded.users.len(),
            groups = loaded.groups.len(),
            dirents = loaded.fat.len(),
            journal = loaded.cache.entries().len(),
            "loaded filesystem"
        );

        *self.state.lock() = loaded;
        Ok(())
    }

    fn read_metadata(
        &self,
        name: &'static str,
        iv: &crate::crypto::Iv,
    ) -> Result<crate::cipherio::CipherReader, DriverError> {
        self.connector
            .metadata_reader(name, &self.key, iv)
            .map_err(|e| match e {
                ConnectorError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                    DriverError::NotFound {
                        what: "metadata blob",
                        id: name.to_string(),
                    }
                }
                other => other.into(),
            })
    }
}

/// Apply every journal entry newer than its table's loaded version, in
/// journal order, bumping versions to the max seen.
fn replay_journal(state: &mut DriverState) -> Result<(), DriverError> {
    let DriverState {
        cache,
        users,
        users_version,
        groups,
        groups_version,
        fat,
        fat_version,
        ..
    } = state;

    for entry in cache.entries() {
        let mut payload = entry.payload.as_slice();
        match entry.table {
            TableKind::Users => {
                if entry.version <= *users_version {
                    continue;
                }
                match entry.op {
                    CacheOp::Upsert => {
                        let user = metadata::decode_user(&mut payload)?;
                        users.insert(user.id, user);
                    }
                    CacheOp::Delete => {
                        let id = metadata::decode_user_id(&mut payload)?;
                        users.remove(&id);
                    }
                }
                *users_version = entry.version;
            }
            TableKind::Groups => {
                if entry.version <= *groups_version {
                    continue;
                }
                match entry.op {
                    CacheOp::Upsert => {
                        let group = metadata::decode_group(&mut payload)?;
                        groups.insert(group.id, group);
                    }
                    CacheOp::Delete => {
                        let id = metadata::decode_group_id(&mut payload)?;
                        groups.remove(&id);
                    }
                }
                *groups_version = entry.version;
            }
            TableKind::Fat => {
                if entry.version <= *fat_version {
                    continue;
                }
                match entry.op {
                    CacheOp::Upsert => {
                        let dirent = metadata::decode_dirent(&mut payload)?;
                        fat.insert(dirent.id.clone(), dirent);
                    }
                    CacheOp::Delete => {
                        let id = metadata::decode_dirent_id(&mut payload)?;
                        fat.remove(&id);
                    }
                }
                *fat_version = entry.version;
            }
        }
    }

    Ok(())
}

/// Consistency checks run after load. Any failure is fatal: the driver
/// refuses to operate on tables that do not validate.
fn validate_invariants(state: &DriverState) -> Result<(), DriverError> {
    let violation = |message: String| Err(DriverError::InvariantViolation(message));

    if !state.users.contains_key(&ROOT_USER_ID) {
        return violation("ROOT user is missing".to_string());
    }

    let root = match state.fat.values().find(|d| d.id.is_root()) {
        Some(root) => root,
        None => return violation("root dirent is missing".to_string()),
    };
    if !root.is_directory() {
        return violation("root dirent is not a directory".to_string());
    }
    if root.parent != root.id {
        return violation("root dirent's parent is not itself".to_string());
    }

    for dirent in state.fat.values() {
        if dirent.id.is_root() {
            continue;
        }
        match state.fat.get(&dirent.parent) {
            None => {
                return violation(format!(
                    "dirent {} references missing parent {}",
                    dirent.id, dirent.parent
                ));
            }
            Some(parent) if !parent.is_directory() => {
                return violation(format!(
                    "dirent {} has non-directory parent {}",
                    dirent.id, dirent.parent
                ));
            }
            Some(_) => {}
        }
        if !state.users.contains_key(&dirent.owner) {
            return violation(format!(
                "dirent {} is owned by missing user {}",
                dirent.id, dirent.owner
            ));
        }

        // Walk to the root; a chain longer than the table is a cycle.
        let mut current = &dirent.parent;
        let mut steps = 0usize;
        while !current.is_root() {
            steps += 1;
            if steps > state.fat.len() {
                return violation(format!("dirent {} is part of a parent cycle", dirent.id));
            }
            current = match state.fat.get(current) {
                Some(parent) => &parent.parent,
                None => break,
            };
        }
    }

    let mut names: HashMap<&crate::dirent::DirentId, HashSet<&str>> = HashMap::new();
    for dirent in state.fat.values() {
        if dirent.id.is_root() {
            continue;
        }
        if !names
            .entry(&dirent.parent)
            .or_default()
            .insert(dirent.name.as_str())
        {
            return violation(format!(
                "directory {} has two children named '{}'",
                dirent.parent, dirent.name
            ));
        }
    }

    for group in state.groups.values() {
        if !group.admins.is_subset(&group.members) {
            return violation(format!("group {} has admins who are not members", group.id));
        }
    }

    Ok(())
}
