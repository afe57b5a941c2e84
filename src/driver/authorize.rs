//! Authorization rules.
//!
//! ROOT may do anything; the owner of a dirent may do anything to it. All
//! other access flows through the dirent's per-group permissions, with
//! EVERYONE treated as containing every user. Mutating a dirent's
//! permission map, owner, or location is reserved to the owner (or ROOT).

use super::{DriverError, DriverState};
use crate::dirent::Dirent;
use crate::identity::{UserId, EVERYONE_GROUP_ID, ROOT_USER_ID};

/// Kind of access being requested on a dirent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

impl DriverState {
    pub(crate) fn can_access(&self, user: UserId, dirent: &Dirent, access: Access) -> bool {
        if user == ROOT_USER_ID || dirent.owner == user {
            return true;
        }

        for (&group, &permission) in &dirent.group_permissions {
            let allowed = match access {
                Access::Read => permission.read,
                Access::Write => permission.write,
            };
            if !allowed {
                continue;
            }
            if group == EVERYONE_GROUP_ID {
                return true;
            }
            if self.groups.get(&group).is_some_and(|g| g.is_member(user)) {
                return true;
            }
        }

        false
    }
}

pub(crate) fn require_access(
    state: &DriverState,
    user: UserId,
    dirent: &Dirent,
    access: Access,
    action: &str,
) -> Result<(), DriverError> {
    if state.can_access(user, dirent, access) {
        Ok(())
    } else {
        Err(DriverError::PermissionDenied {
            user,
            action: format!("{action} {}", dirent.id),
        })
    }
}

/// Owner-or-ROOT check for permission, ownership, and location changes.
pub(crate) fn require_owner(user: UserId, dirent: &Dirent, action: &str) -> Result<(), DriverError> {
    if user == ROOT_USER_ID || dirent.owner == user {
        Ok(())
    } else {
        Err(DriverError::PermissionDenied {
            user,
            action: format!("{action} {}", dirent.id),
        })
    }
}

pub(crate) fn require_root(user: UserId, action: &str) -> Result<(), DriverError> {
    if user == ROOT_USER_ID {
        Ok(())
    } else {
        Err(DriverError::PermissionDenied {
            user,
            action: action.to_string(),
        })
    }
}
