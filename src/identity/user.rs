//! User accounts.

use std::fmt;

/// Integer user identifier; 0 is reserved for ROOT.
pub type UserId = u32;

/// The privileged user. ROOT always exists and cannot be removed.
pub const ROOT_USER_ID: UserId = 0;

/// Name the ROOT user is created with.
pub const ROOT_USER_NAME: &str = "root";

/// Size of the stored password digest (SHA-256).
pub const PASSWORD_HASH_SIZE: usize = 32;

/// A user account.
///
/// Names are unique across the filesystem and non-empty. The password is
/// never stored; only a deterministic 256-bit digest of it is, computed by
/// the caller before it reaches the driver.
#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub password_hash: [u8; PASSWORD_HASH_SIZE],
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, password_hash: [u8; PASSWORD_HASH_SIZE]) -> Self {
        User {
            id,
            name: name.into(),
            password_hash,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_USER_ID
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("password_hash", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_predicate() {
        let root = User::new(ROOT_USER_ID, ROOT_USER_NAME, [0u8; PASSWORD_HASH_SIZE]);
        assert!(root.is_root());
        let user = User::new(7, "alice", [0u8; PASSWORD_HASH_SIZE]);
        assert!(!user.is_root());
    }

    #[test]
    fn test_debug_redacts_hash() {
        let user = User::new(1, "alice", [0xAB; PASSWORD_HASH_SIZE]);
        let debug = format!("{user:?}");
        assert!(debug.contains("alice"));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }
}
