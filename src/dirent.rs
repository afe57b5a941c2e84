//! Directory entries: the file and directory nodes of the tree.
//!
//! The tree is stored as a flat map of `DirentId -> Dirent` with the parent
//! held as an id rather than a pointer; the child index is derived state
//! rebuilt on load. A dirent is either a file (with size, content MD5, and
//! its own encryption IV) or a directory; shared metadata lives on the
//! `Dirent` itself.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::crypto::Iv;
use crate::identity::{GroupId, Permission, UserId};

/// Reserved id of the root directory.
pub const ROOT_DIRENT_ID: &str = "ROOT";

/// Length of generated dirent ids.
pub const DIRENT_ID_LEN: usize = 16;

/// Alphabet dirent ids are drawn from. The first character of an id selects
/// the data partition on the backend, so this is also the set of partition
/// directory names.
pub const ID_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Size of a content MD5 digest.
pub const MD5_SIZE: usize = 16;

/// Opaque URL-safe dirent identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirentId(String);

impl DirentId {
    /// The reserved root directory id.
    pub fn root() -> Self {
        DirentId(ROOT_DIRENT_ID.to_string())
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..DIRENT_ID_LEN)
            .map(|_| ID_CHARS[rng.random_range(0..ID_CHARS.len())] as char)
            .collect();
        DirentId(id)
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_DIRENT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First character of the id, used for backend data partitioning.
    pub fn prefix(&self) -> char {
        self.0.chars().next().unwrap_or('0')
    }
}

impl fmt::Display for DirentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DirentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirentId({})", self.0)
    }
}

impl From<&str> for DirentId {
    fn from(value: &str) -> Self {
        DirentId(value.to_string())
    }
}

impl From<String> for DirentId {
    fn from(value: String) -> Self {
        DirentId(value)
    }
}

/// What a dirent is: a file with content metadata, or a directory.
#[derive(Clone, PartialEq, Eq)]
pub enum DirentKind {
    File {
        /// Plaintext size in bytes.
        size: u64,
        /// MD5 of the plaintext content.
        md5: [u8; MD5_SIZE],
        /// IV of the content stream; unique per file, never reused.
        iv: Iv,
    },
    Directory,
}

impl fmt::Debug for DirentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirentKind::File { size, md5, .. } => f
                .debug_struct("File")
                .field("size", size)
                .field("md5", &hex::encode(md5))
                .finish(),
            DirentKind::Directory => f.write_str("Directory"),
        }
    }
}

/// A node of the directory tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Dirent {
    pub id: DirentId,
    pub name: String,
    pub parent: DirentId,
    pub owner: UserId,
    pub create_timestamp: i64,
    pub mod_timestamp: i64,
    pub group_permissions: HashMap<GroupId, Permission>,
    pub kind: DirentKind,
}

impl Dirent {
    pub fn new_file(
        id: DirentId,
        name: impl Into<String>,
        parent: DirentId,
        owner: UserId,
        group_permissions: HashMap<GroupId, Permission>,
        size: u64,
        md5: [u8; MD5_SIZE],
        iv: Iv,
    ) -> Self {
        let now = unix_timestamp();
        Dirent {
            id,
            name: name.into(),
            parent,
            owner,
            create_timestamp: now,
            mod_timestamp: now,
            group_permissions,
            kind: DirentKind::File { size, md5, iv },
        }
    }

    pub fn new_directory(
        id: DirentId,
        name: impl Into<String>,
        parent: DirentId,
        owner: UserId,
        group_permissions: HashMap<GroupId, Permission>,
    ) -> Self {
        let now = unix_timestamp();
        Dirent {
            id,
            name: name.into(),
            parent,
            owner,
            create_timestamp: now,
            mod_timestamp: now,
            group_permissions,
            kind: DirentKind::Directory,
        }
    }

    /// The root directory: a directory owned by ROOT whose parent is itself.
    pub fn root_directory(owner: UserId) -> Self {
        Dirent::new_directory(DirentId::root(), "", DirentId::root(), owner, HashMap::new())
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, DirentKind::File { .. })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, DirentKind::Directory)
    }

    /// Plaintext size; 0 for directories.
    pub fn size(&self) -> u64 {
        match self.kind {
            DirentKind::File { size, .. } => size,
            DirentKind::Directory => 0,
        }
    }

    /// IV of the content stream, if this is a file.
    pub fn content_iv(&self) -> Option<&Iv> {
        match &self.kind {
            DirentKind::File { iv, .. } => Some(iv),
            DirentKind::Directory => None,
        }
    }

    /// Content MD5, if this is a file.
    pub fn content_md5(&self) -> Option<&[u8; MD5_SIZE]> {
        match &self.kind {
            DirentKind::File { md5, .. } => Some(md5),
            DirentKind::Directory => None,
        }
    }

    /// Update the modification timestamp.
    pub fn touch(&mut self) {
        self.mod_timestamp = unix_timestamp();
    }
}

/// Current time as unix seconds.
pub fn unix_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
