//! Identity operations: authentication, user administration, and the
//! group lifecycle.

use subtle::ConstantTimeEq;
use tracing::{debug, instrument};

use super::authorize::require_root;
use super::{Driver, DriverError, DriverState};
use crate::identity::{
    Group, GroupId, User, UserId, EVERYONE_GROUP_ID, PASSWORD_HASH_SIZE, ROOT_USER_ID,
};
use crate::metadata::{self, CacheEntry, CacheOp, TableKind};

fn get_group<'a>(state: &'a DriverState, id: GroupId) -> Result<&'a Group, DriverError> {
    if id == EVERYONE_GROUP_ID {
        return Err(DriverError::BadParameter(
            "the EVERYONE group cannot be modified".to_string(),
        ));
    }
    state.groups.get(&id).ok_or_else(|| DriverError::NotFound {
        what: "group",
        id: id.to_string(),
    })
}

fn require_group_admin(actor: UserId, group: &Group) -> Result<(), DriverError> {
    if actor == ROOT_USER_ID || group.is_admin(actor) {
        Ok(())
    } else {
        Err(DriverError::PermissionDenied {
            user: actor,
            action: format!("administer group {}", group.id),
        })
    }
}

fn require_user_exists(state: &DriverState, id: UserId) -> Result<(), DriverError> {
    if state.users.contains_key(&id) {
        Ok(())
    } else {
        Err(DriverError::NotFound {
            what: "user",
            id: id.to_string(),
        })
    }
}

impl Driver {
    /// Authenticate by name and password digest.
    ///
    /// The digest comparison is constant time over the hash bytes; both a
    /// missing name and a wrong digest report the same [`DriverError::AuthFailed`].
    pub fn user_auth(
        &self,
        name: &str,
        password_hash: &[u8; PASSWORD_HASH_SIZE],
    ) -> Result<User, DriverError> {
        let state = self.state.lock();
        let user = state
            .users
            .values()
            .find(|u| u.name == name)
            .ok_or(DriverError::AuthFailed)?;

        if bool::from(user.password_hash.ct_eq(password_hash)) {
            Ok(user.clone())
        } else {
            Err(DriverError::AuthFailed)
        }
    }

    /// All users, sorted by id.
    pub fn users(&self) -> Vec<User> {
        let state = self.state.lock();
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// All groups, sorted by id.
    pub fn groups(&self) -> Vec<Group> {
        let state = self.state.lock();
        let mut groups: Vec<Group> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    /// Create a user. ROOT only.
    #[instrument(level = "debug", skip(self, password_hash), fields(name = %name))]
    pub fn add_user(
        &self,
        actor: UserId,
        name: &str,
        password_hash: [u8; PASSWORD_HASH_SIZE],
    ) -> Result<UserId, DriverError> {
        let mut state = self.state.lock();
        require_root(actor, "add users")?;
        if name.is_empty() {
            return Err(DriverError::BadParameter("user name must not be empty".to_string()));
        }
        if state.users.values().any(|u| u.name == name) {
            return Err(DriverError::BadParameter(format!(
                "user name '{name}' is already taken"
            )));
        }

        let id = state.users.keys().max().map_or(1, |&max| max + 1);
        let user = User::new(id, name, password_hash);

        state.users.insert(id, user.clone());
        state.users_version += 1;
        if let Err(e) = self.journal_user_upsert(&mut state, &user) {
            state.users.remove(&id);
            state.users_version -= 1;
            return Err(e);
        }

        debug!(id, "added user");
        self.maybe_flush(&mut state);
        Ok(id)
    }

    /// Remove a user. ROOT only.
    ///
    /// Refused while the user still owns dirents, or is the last admin of
    /// a group that still has other members. Their group memberships are
    /// stripped; groups where they were the sole member are deleted.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_user(&self, actor: UserId, target: UserId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        require_root(actor, "remove users")?;
        if target == ROOT_USER_ID {
            return Err(DriverError::BadParameter("ROOT cannot be removed".to_string()));
        }
        require_user_exists(&state, target)?;

        if state.fat.values().any(|d| d.owner == target) {
            return Err(DriverError::BadParameter(format!(
                "user {target} still owns dirents; reassign or remove them first"
            )));
        }
        for group in state.groups.values() {
            if group.is_admin(target) && group.admins.len() == 1 && group.members.len() > 1 {
                return Err(DriverError::BadParameter(format!(
                    "user {target} is the last admin of group {}; promote another admin first",
                    group.id
                )));
            }
        }

        // Strip group memberships. Each change is journaled on its own;
        // like recursive delete, a failure partway leaves the earlier
        // changes committed and reports the first error.
        let memberships: Vec<GroupId> = state
            .groups
            .values()
            .filter(|g| g.is_member(target))
            .map(|g| g.id)
            .collect();
        for group_id in memberships {
            let group = &state.groups[&group_id];
            if group.members.len() == 1 {
                self.delete_group_entry(&mut state, group_id)?;
            } else {
                let mut updated = group.clone();
                updated.members.remove(&target);
                updated.admins.remove(&target);
                self.update_group(&mut state, updated)?;
            }
        }

        let removed = match state.users.remove(&target) {
            Some(user) => user,
            None => {
                return Err(DriverError::NotFound {
                    what: "user",
                    id: target.to_string(),
                })
            }
        };
        state.users_version += 1;
        if let Err(e) = self.journal_user_delete(&mut state, target) {
            state.users.insert(target, removed);
            state.users_version -= 1;
            return Err(e);
        }

        debug!(target, "removed user");
        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Create a group; the creator becomes its sole admin and member.
    #[instrument(level = "debug", skip(self), fields(name = %name))]
    pub fn add_group(&self, actor: UserId, name: &str) -> Result<GroupId, DriverError> {
        let mut state = self.state.lock();
        require_user_exists(&state, actor)?;
        if name.is_empty() {
            return Err(DriverError::BadParameter("group name must not be empty".to_string()));
        }

        let id = state.groups.keys().max().map_or(1, |&max| max + 1);
        let group = Group::new(id, name, actor);

        state.groups.insert(id, group.clone());
        state.groups_version += 1;
        if let Err(e) = self.journal_group_upsert(&mut state, &group) {
            state.groups.remove(&id);
            state.groups_version -= 1;
            return Err(e);
        }

        debug!(id, "added group");
        self.maybe_flush(&mut state);
        Ok(id)
    }

    /// Delete a group. Group admin or ROOT; the group must have no members
    /// other than the acting admin.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_group(&self, actor: UserId, group_id: GroupId) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let group = get_group(&state, group_id)?;
        require_group_admin(actor, group)?;
        if group.members.iter().any(|&m| m != actor) {
            return Err(DriverError::BadParameter(format!(
                "group {group_id} still has members"
            )));
        }

        self.delete_group_entry(&mut state, group_id)?;
        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Add a user to a group. Group admin or ROOT; idempotent.
    #[instrument(level = "debug", skip(self))]
    pub fn join_group(
        &self,
        actor: UserId,
        user: UserId,
        group_id: GroupId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let group = get_group(&state, group_id)?;
        require_group_admin(actor, group)?;
        require_user_exists(&state, user)?;

        let group = &state.groups[&group_id];
        if group.is_member(user) {
            return Ok(());
        }
        let mut updated = group.clone();
        updated.members.insert(user);
        self.update_group(&mut state, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Remove a member from a group. Group admin, ROOT, or the member
    /// themselves (self-kick). Admins must be demoted before being kicked.
    #[instrument(level = "debug", skip(self))]
    pub fn kick_user(
        &self,
        actor: UserId,
        user: UserId,
        group_id: GroupId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let group = get_group(&state, group_id)?;
        if actor != user {
            require_group_admin(actor, group)?;
        }
        if !group.is_member(user) {
            return Err(DriverError::BadParameter(format!(
                "user {user} is not a member of group {group_id}"
            )));
        }
        if group.is_admin(user) {
            return Err(DriverError::BadParameter(format!(
                "user {user} is an admin of group {group_id}; demote them first"
            )));
        }

        let mut updated = group.clone();
        updated.members.remove(&user);
        self.update_group(&mut state, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Promote a member to group admin. Group admin or ROOT; idempotent.
    #[instrument(level = "debug", skip(self))]
    pub fn promote_user(
        &self,
        actor: UserId,
        user: UserId,
        group_id: GroupId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let group = get_group(&state, group_id)?;
        require_group_admin(actor, group)?;
        if !group.is_member(user) {
            return Err(DriverError::BadParameter(format!(
                "user {user} is not a member of group {group_id}"
            )));
        }
        if group.is_admin(user) {
            return Ok(());
        }

        let mut updated = group.clone();
        updated.admins.insert(user);
        self.update_group(&mut state, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    /// Demote a group admin back to plain member. Group admin or ROOT;
    /// the last admin cannot be demoted.
    #[instrument(level = "debug", skip(self))]
    pub fn demote_user(
        &self,
        actor: UserId,
        user: UserId,
        group_id: GroupId,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let group = get_group(&state, group_id)?;
        require_group_admin(actor, group)?;
        if !group.is_admin(user) {
            return Err(DriverError::BadParameter(format!(
                "user {user} is not an admin of group {group_id}"
            )));
        }
        if group.admins.len() == 1 {
            return Err(DriverError::BadParameter(format!(
                "cannot demote the last admin of group {group_id}"
            )));
        }

        let mut updated = group.clone();
        updated.admins.remove(&user);
        self.update_group(&mut state, updated)?;

        self.maybe_flush(&mut state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn journal_user_upsert(&self, state: &mut DriverState, user: &User) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Users,
            version: state.users_version,
            op: CacheOp::Upsert,
            payload: metadata::encode_user(user),
        };
        self.journal(state, entry)
    }

    fn journal_user_delete(&self, state: &mut DriverState, id: UserId) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Users,
            version: state.users_version,
            op: CacheOp::Delete,
            payload: metadata::encode_user_id(id),
        };
        self.journal(state, entry)
    }

    fn journal_group_upsert(
        &self,
        state: &mut DriverState,
        group: &Group,
    ) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Groups,
            version: state.groups_version,
            op: CacheOp::Upsert,
            payload: metadata::encode_group(group),
        };
        self.journal(state, entry)
    }

    fn journal_group_delete(
        &self,
        state: &mut DriverState,
        id: GroupId,
    ) -> Result<(), DriverError> {
        let entry = CacheEntry {
            table: TableKind::Groups,
            version: state.groups_version,
            op: CacheOp::Delete,
            payload: metadata::encode_group_id(id),
        };
        self.journal(state, entry)
    }

    /// Replace a groups-table entry, journal it, roll back on failure.
    fn update_group(&self, state: &mut DriverState, updated: Group) -> Result<(), DriverError> {
        let old = state.groups.insert(updated.id, updated.clone());
        state.groups_version += 1;
        if let Err(e) = self.journal_group_upsert(state, &updated) {
            match old {
                Some(old) => {
                    state.groups.insert(old.id, old);
                }
                None => {
                    state.groups.remove(&updated.id);
                }
            }
            state.groups_version -= 1;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a groups-table entry, journal it, roll back on failure.
    fn delete_group_entry(
        &self,
        state: &mut DriverState,
        group_id: GroupId,
    ) -> Result<(), DriverError> {
        let removed = match state.groups.remove(&group_id) {
            Some(group) => group,
            None => {
                return Err(DriverError::NotFound {
                    what: "group",
                    id: group_id.to_string(),
                })
            }
        };
        state.groups_version += 1;
        if let Err(e) = self.journal_group_delete(state, group_id) {
            state.groups.insert(group_id, removed);
            state.groups_version -= 1;
            return Err(e);
        }
        Ok(())
    }
}
