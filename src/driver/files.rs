//! Dirent operations: streaming file I/O, directory manipulation, and
//! per-dirent permission management.

use std::collections::HashMap;
use std::io::{self, Read};

use tracing::{debug, instrument, warn};

use super::authorize::{require_access, require_owner, Access};
use super::{Driver, DriverError, DriverState};
use crate::cipherio::CipherReader;
use crate::crypto::random_iv;
use crate::dirent::{Dirent, DirentId, DirentKind, MD5_SIZE};
use crate::identity::{GroupId, Permission, UserId, EVERYONE_GROUP_ID};
use crate::metadata::{self, CacheEntry, CacheOp, TableKind};

fn get_dirent<'a>(state: &'a DriverState, id: &DirentId) -> Result<&'a Dirent, DriverError> {
    state.fat.get(id).ok_or_else(|| DriverError::NotFound {
        what: "dirent",
        id: id.to_string(),
    })
}

fn get_directory<'a>(state: &'a DriverState, id: &DirentId) -> Result<&'a Dirent, DriverError> {
    let dirent = get_dirent(state, id)?;
    if !dirent.is_directory() {
        return Err(DriverError::NotADirectory { id: id.to_string() });
    }
    Ok(dirent)
}

fn validate_name(name: &str) -> Result<(), DriverError> {
    if name.is_empty() {
        return Err(DriverError::BadParameter("name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_permission_groups(
    state: &DriverState,
    permissions: &HashMap<GroupId, Permission>,
) -> Result<(), DriverError> {
    for &group in permissions.keys() {
        if group != EVERYONE_GROUP_ID && !state.groups.contains_key(&group) {
            return Err(DriverError::NotFound {
                what: "group",
                id: group.to_string(),
            });
        }
    }
    Ok(())
}

impl Driver {
    /// Stat a dirent.
    pub fn get_dirent(&self, user: UserId, id: &DirentId) -> Result<Dirent, DriverError> {
        let state = self.state.lock();
        let dirent = get_dirent(&state, id)?;
        require_access(&state, user, dirent, Access::Read, "read")?;
        Ok(dirent.clone())
    }

    /// List a directory's children, sorted by name.
    pub fn list(&self, user: UserId, id: &DirentId) -> Result<Vec<Dirent>, DriverError> {
        let state = self.state.lock();
        let directory = get_directory(&state, id)?;
        require_access(&state, user, directory, Access::Read, "list")?;

        let mut children: Vec<Dirent> = state
            .dirs
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| state.fat.get(c)).cloned().collect())
            .unwrap_or_default();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Open a file for reading. The returned reader owns its backend
    /// handle and stays valid even if the dirent is later removed.
    #[instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn read(&self, user: UserId, id: &DirentId) -> Result<CipherReader, DriverError> {
        let state = self.state.lock();
        let dirent = get_dirent(&state, id)?;
        if !dirent.is_file() {
            return Err(DriverError::IsADirectory { id: id.to_string() });
        }
        require_access(&state, user, dirent, Access::Read, "read")?;
        Ok(self.connector.cipher_reader(dirent, &self.key)?)
    }

    /// Stream `content` into a new file under `parent`.
    ///
    /// The stream is encrypted under a fresh random IV into a fresh dirent
    /// id. An existing child with the same name is replaced: the old
    /// dirent is deleted and a new one created, so its id and IV change.
    #[instrument(level = "debug", skip(self, content, group_permissions), fields(name = %name, parent = %parent))]
    pub fn put(
        &self,
        user: UserId,
        name: &str,
        content: &mut dyn Read,
        group_permissions: HashMap<GroupId, Permission>,
        parent: &DirentId,
    ) -> Result<DirentId, DriverError> {
        let mut state = self.state.lock();
        validate_name(name)?;
        validate_permission_groups(&state, &group_permissions)?;

        let parent_dirent = get_directory(&state, parent)?;
        require_access(&state, user, parent_dirent, Access::Write, "create entries in")?;

        let replaced = match state.child_named(parent, name) {
            Some(existing) if existing.is_directory() => {
                return Err(DriverError::IsADirectory {
                    id: existing.id.to_string(),
                });
            }
            Some(existing) => {
                require_access(&state, user, existing, Access::Write, "replace")?;
                Some(existing.clone())
            }
            None => None,
        };

        let id = DirentId::random();
        let mut dirent = Dirent::new_file(
            id.clone(),
            name,
            parent.clone(),
            user,
            group_permissions,
            0,
            [0u8; MD5_SIZE],
            random_iv(),
        );

        // Stream the content out before touching the tables; a failure
        // here leaves the tables untouched (the partial blob may leak).
        let mut writer = self.connector.cipher_writer(&dirent, &self.key)?;
        io::copy(content, &mut writer)?;
        let summary = writer.finalize()?;
        if let DirentKind::File { size, md5, .. } = &mut dirent.kind {
            *size = summary.plaintext_len;
            *md5 = summary.md5;
        }

        if let Some(old) = replaced {
            self.remove_entry(&mut state, &old)?;
        }

        state.fat.insert(id.clone(), dirent.clone());
        state.add_child(parent, id.clone());
        state.fat_version += 1;
        if let Err(e) = self.journal_fat_upsert(&mut state, &dirent) {
            state.fat.remove(&id);
            state.remove_child(parent, &id);
            state.fat_version -= 1;
            return Err(e);
        }

        debug!(id = %id, size = summary.plaintext_len, "stored file");
        self.maybe_flush(&mut state);
        Ok(id)
    }

    /// Create an empty directory under `parent`.
    #[instrument(level = "debug", skip(self, group_permissions), fields(name = %name, parent = %parent))]
    pub fn make_dir(
        &self,
        user: UserId,
        name: &str,
        parent: &DirentId,
        group_permissions: HashMap<GroupId, Permission>,
    ) -> Result<DirentId, DriverError> {
        let mut state = self.state.lock();
        validate_name(name)?;
        validate_permission_groups(&state, &group_permissions)?;

        let parent_dirent = get_directory(&state, parent)?;
        require_access(&state, user, parent_dirent, Access::Write, "create entries in")?;

        if state.child_named(parent, name).is_some() {
            return Err(DriverError::NameExists {
                name: name.to_string(),
                parent: parent.to_string(),
            });
        }

        let id = DirentId::random();
        let dirent = Dirent::new_directory(id.clone(), name, parent.clone(), user, group_permissions);

        state.fat.insert(id.clone(), dirent.clone());
        state.dirs.entry(id.clone()).or_default();
        state.add_child(parent, id.clone());
        state.fat_version += 1;
        if let Err(e) = self.journal_fat_upsert(&mut state, &dirent) {
            state.fat.remove(&id);
            state.dirs.remove(&id);
            state.remove_child(parent, &id);
            state.fat_version -= 1;
            return Err(e);
        }

        self.maybe_flush(&mut state);
        Ok(id)
    }

    /// Move a dirent under a new parent directory.
    ///
    /// Moving a dirent to the parent it is already under is an idempotent
    /// no-op. Moving a directory into itself or any of its descendants is
    /// refused.
    #[instrument(level = "debug", skip(self), fields(target = %target, new_parent = %new_parent))]
    pub fn move_dirent(
        &self,
        user: UserId,
        target: &DirentId,
        new_parent: &DirentId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if target.is_root() {
            return Err(DriverError::BadParameter(
                "the root directory cannot be moved".to_string(),
            ));
        }

        let target_dirent = get_dirent(&state, target)?.clone();
        require_owner(user, &target_dirent, "move")?;
        let new_parent_dirent = get_directory(&state, new_parent)?;
        require_access(&state, user, new_parent_dirent, Access::Write, "create entries in")?;

        if target_dirent.parent == *new_parent {
            return Ok(());
        }

        // Reject if the target is an ancestor-or-equal of the new parent.
        let mut cursor = new_parent.clone();
        loop {
            if cursor == *target {
                return Err(DriverError::CycleWouldForm {
                    target: target.to_string(),
                    new_parent: new_parent.to_string(),
                });
            }
            if cursor.is_root() {
                break;
            }
            cursor = get_dirent(&state, &cursor)?.parent.clone();
        }

        if state.child_named(new_parent, &target_dirent.name).is_some() {
            return Err(DriverError::NameExists {
                name: target_dirent.name.clone(),
                parent: new_parent.to_string(),
            });
        }

        let old_parent = target_dirent.parent.clone();
        let mut updated = target_dirent.clone();
        updated.parent = new_parent.clone();
        updated.touch();

        state.remove_child(&old_parent, target);
        state.add_child(new_parent, target.clone());
        state.fat.insert(target.clone(), updated.clone());
        state.fat_version += 1;
        if let Err(e) = self.journal_fat_upsert(&mut state, &updated) {
            state.remove_child(new_parent, target);
            state.add_child(&old_parent, target.clone());
            state.fat.insert(target.clone(), target_dirent);
            state.fat_version -= 1;
            return Err(e);
        }

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Rename a dirent in place.
    #[instrument(level = "debug", skip(self), fields(id = %id, new_name = %new_name))]
    pub fn rename(&self, user: UserId, id: &DirentId, new_name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        validate_name(new_name)?;
        if id.is_root() {
            return Err(DriverError::BadParameter(
                "the root directory cannot be renamed".to_string(),
            ));
        }

        let dirent = get_dirent(&state, id)?.clone();
        require_access(&state, user, &dirent, Access::Write, "rename")?;
        if dirent.name == new_name {
            return Ok(());
        }
        if state.child_named(&dirent.parent, new_name).is_some() {
            return Err(DriverError::NameExists {
                name: new_name.to_string(),
                parent: dirent.parent.to_string(),
            });
        }

        let mut updated = dirent.clone();
        updated.name = new_name.to_string();
        updated.touch();
        self.update_dirent(&mut state, dirent, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Remove a file.
    #[instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn remove_file(&self, user: UserId, id: &DirentId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let dirent = get_dirent(&state, id)?;
        if !dirent.is_file() {
            return Err(DriverError::IsADirectory { id: id.to_string() });
        }
        let dirent = dirent.clone();
        require_access(&state, user, &dirent, Access::Write, "remove")?;

        self.remove_entry(&mut state, &dirent)?;
        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Recursively remove a directory.
    ///
    /// Children are removed post-order and each node is authorized
    /// independently. A failure partway leaves the already-deleted subtree
    /// gone; the first error is reported and nothing is rolled back.
    #[instrument(level = "debug", skip(self), fields(id = %id))]
    pub fn remove_dir(&self, user: UserId, id: &DirentId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if id.is_root() {
            return Err(DriverError::BadParameter(
                "the root directory cannot be removed".to_string(),
            ));
        }
        let dirent = get_dirent(&state, id)?;
        if !dirent.is_directory() {
            return Err(DriverError::NotADirectory { id: id.to_string() });
        }

        self.remove_tree(&mut state, user, id)?;
        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Reassign a dirent's owner. Owner-or-ROOT only.
    #[instrument(level = "debug", skip(self), fields(id = %id, new_owner = new_owner))]
    pub fn change_owner(
        &self,
        user: UserId,
        id: &DirentId,
        new_owner: UserId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let dirent = get_dirent(&state, id)?.clone();
        require_owner(user, &dirent, "change ownership of")?;
        if !state.users.contains_key(&new_owner) {
            return Err(DriverError::NotFound {
                what: "user",
                id: new_owner.to_string(),
            });
        }

        let mut updated = dirent.clone();
        updated.owner = new_owner;
        updated.touch();
        self.update_dirent(&mut state, dirent, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Grant or update a group's access to a dirent. Owner-or-ROOT only.
    #[instrument(level = "debug", skip(self), fields(id = %id, group = group))]
    pub fn put_group_access(
        &self,
        user: UserId,
        id: &DirentId,
        group: GroupId,
        permission: Permission,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let dirent = get_dirent(&state, id)?.clone();
        require_owner(user, &dirent, "modify permissions of")?;
        if group != EVERYONE_GROUP_ID && !state.groups.contains_key(&group) {
            return Err(DriverError::NotFound {
                what: "group",
                id: group.to_string(),
            });
        }

        let mut updated = dirent.clone();
        updated.group_permissions.insert(group, permission);
        updated.touch();
        self.update_dirent(&mut state, dirent, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Revoke a group's access to a dirent. Owner-or-ROOT only.
    #[instrument(level = "debug", skip(self), fields(id = %id, group = group))]
    pub fn remove_group_access(
        &self,
        user: UserId,
        id: &DirentId,
        group: GroupId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let dirent = get_dirent(&state, id)?.clone();
        require_owner(user, &dirent, "modify permissions of")?;
        if !dirent.group_permissions.contains_key(&group) {
            return Err(DriverError::NotFound {
                what: "group permission",
                id: group.to_string(),
            });
        }

        let mut updated = dirent.clone();
        updated.group_permissions.remove(&group);
        updated.touch();
        self.update_dirent(&mut state, dirent, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn journal_fat_upsert(
        &self,
        state: &mut DriverState,
        dirent: &Dirent,
    ) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Fat,
            version: state.fat_version,
            op: CacheOp::Upsert,
            payload: metadata::encode_dirent(dirent),
        };
        self.journal(state, entry)
    }

    fn journal_fat_delete(
        &self,
        state: &mut DriverState,
        id: &DirentId,
    ) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Fat,
            version: state.fat_version,
            op: CacheOp::Delete,
            payload: metadata::encode_dirent_id(id),
        };
        self.journal(state, entry)
    }

    /// Replace a fat entry, journal the new value, and roll back on a
    /// failed journal append.
    fn update_dirent(
        &self,
        state: &mut DriverState,
        old: Dirent,
        updated: Dirent,
    ) -> Result<(), DriverError> {
        state.fat.insert(updated.id.clone(), updated.clone());
        state.fat_version += 1;
        if let Err(e) = self.journal_fat_upsert(state, &updated) {
            state.fat.insert(old.id.clone(), old);
            state.fat_version -= 1;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a single dirent from the tables, journal the deletion, and
    /// delete its backend blob. The in-memory change is rolled back only if
    /// the journal append fails; a backend blob that cannot be removed is
    /// reported but leaves the metadata deleted.
    fn remove_entry(&self, state: &mut DriverState, dirent: &Dirent) -> Result<(), DriverError> {
        state.fat.remove(&dirent.id);
        state.remove_child(&dirent.parent, &dirent.id);
        state.fat_version += 1;
        if let Err(e) = self.journal_fat_delete(state, &dirent.id) {
            state.fat.insert(dirent.id.clone(), dirent.clone());
            state.add_child(&dirent.parent, dirent.id.clone());
            state.fat_version -= 1;
            return Err(e);
        }

        if dirent.is_file() {
            if let Err(e) = self.connector.remove_file(dirent) {
                warn!(id = %dirent.id, error = %e, "metadata removed but content blob remains");
                return Err(e.into());
            }
        } else {
            state.dirs.remove(&dirent.id);
        }
        Ok(())
    }

    /// Post-order removal of a subtree.
    fn remove_tree(
        &self,
        state: &mut DriverState,
        user: UserId,
        id: &DirentId,
    ) -> Result<(), DriverError> {
        let dirent = get_dirent(state, id)?.clone();

        if dirent.is_directory() {
            let children: Vec<DirentId> = state.dirs.get(id).cloned().unwrap_or_default();
            for child in &children {
                self.remove_tree(state, user, child)?;
            }
        }

        require_access(state, user, &dirent, Access::Write, "remove")?;
        self.remove_entry(state, &dirent)
    }
}
