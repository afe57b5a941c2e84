//! Groups and their per-dirent permissions.

use std::collections::HashSet;

use super::user::UserId;

/// Integer group identifier; 0 is reserved for EVERYONE.
pub type GroupId = u32;

/// The implicit group every user belongs to. It is never stored in the
/// groups table and cannot be mutated; authorization treats it as
/// containing all users.
pub const EVERYONE_GROUP_ID: GroupId = 0;

/// A user group.
///
/// Invariant: admins are a subset of members. A freshly created group has
/// its creator as the sole member and admin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: HashSet<UserId>,
    pub admins: HashSet<UserId>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, creator: UserId) -> Self {
        Group {
            id,
            name: name.into(),
            members: HashSet::from([creator]),
            admins: HashSet::from([creator]),
        }
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }
}

/// Read/write access a group holds on a dirent.
///
/// Wire encoding is the UNIX-style digit: 4 = read, 2 = write, 6 = both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permission {
    pub read: bool,
    pub write: bool,
}

impl Permission {
    const WIRE_READ: u8 = 4;
    const WIRE_WRITE: u8 = 2;

    pub fn new(read: bool, write: bool) -> Self {
        Permission { read, write }
    }

    /// Decode the 4/2/6 wire byte; anything else is invalid.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            b if b == Self::WIRE_READ => Some(Permission::new(true, false)),
            b if b == Self::WIRE_WRITE => Some(Permission::new(false, true)),
            b if b == (Self::WIRE_READ | Self::WIRE_WRITE) => Some(Permission::new(true, true)),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        let mut byte = 0;
        if self.read {
            byte |= Self::WIRE_READ;
        }
        if self.write {
            byte |= Self::WIRE_WRITE;
        }
        byte
    }
}
