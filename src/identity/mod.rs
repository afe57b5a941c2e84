//! Users, groups, and group permissions.

pub mod group;
pub mod user;

pub use group::{Group, GroupId, Permission, EVERYONE_GROUP_ID};
pub use user::{User, UserId, PASSWORD_HASH_SIZE, ROOT_USER_ID, ROOT_USER_NAME};
