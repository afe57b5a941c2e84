//! Backend-neutral storage abstraction.
//!
//! A connector turns a storage backend (a local directory, an object store
//! bucket) into two namespaces of encrypted blobs: data blobs addressed by
//! dirent id under `data/<prefix>/`, where `prefix` is the first character
//! of the id, and named metadata blobs under `admin/`. The connector also
//! owns the backend-wide advisory lock that enforces single-process access.
//!
//! A process-wide registry refuses a second connector to the same backend;
//! the backend lock covers other processes.

pub mod local;

use std::collections::HashSet;
use std::io;
use std::sync::LazyLock;

use parking_lot::Mutex;
use thiserror::Error;

use crate::cipherio::{CipherReader, CipherWriter};
use crate::crypto::{FsKey, Iv};
use crate::dirent::Dirent;

pub use local::LocalConnector;

/// Backend directory holding the metadata blobs and the lock file.
pub const ADMIN_DIR: &str = "admin";

/// Backend directory holding encrypted file content, partitioned by the
/// first character of the dirent id.
pub const DATA_DIR: &str = "data";

/// Name of the lock blob under `admin/`. Its content is the plaintext pid
/// of the owning process, for diagnostics.
pub const LOCK_BLOB: &str = "lock";

/// Errors from backend connectors.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error(
        "backend already owned by process [{owner}]; \
         ensure that process is dead and remove the lock, or force the connection"
    )]
    AlreadyLocked { owner: String },

    #[error("a connection to '{id}' already exists in this process")]
    DuplicateConnection { id: String },

    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Contract every storage backend implements.
///
/// Readers and writers returned here are already wired through the cipher
/// layer: callers see plaintext, the backend sees ciphertext.
pub trait Connector: Send + Sync {
    /// Stable identifier for this backend, unique per target; used by the
    /// in-process registry to refuse duplicate connections.
    fn id(&self) -> &str;

    /// Create any backend-side containers needed. Idempotent.
    fn prepare_storage(&self) -> Result<(), ConnectorError>;

    /// Take the backend-wide advisory lock; `force` overrides a stale one.
    fn lock(&self, force: bool) -> Result<(), ConnectorError>;

    /// Release the backend-wide advisory lock.
    fn unlock(&self) -> Result<(), ConnectorError>;

    /// Decrypting reader for a file dirent's content blob.
    fn cipher_reader(&self, dirent: &Dirent, key: &FsKey) -> Result<CipherReader, ConnectorError>;

    /// Encrypting writer for a file dirent's content blob.
    fn cipher_writer(&self, dirent: &Dirent, key: &FsKey) -> Result<CipherWriter, ConnectorError>;

    /// Decrypting reader for a named metadata blob.
    fn metadata_reader(
        &self,
        name: &str,
        key: &FsKey,
        iv: &Iv,
    ) -> Result<CipherReader, ConnectorError>;

    /// Encrypting writer for a named metadata blob. The blob becomes
    /// visible under its canonical name only once the writer is finalized.
    fn metadata_writer(
        &self,
        name: &str,
        key: &FsKey,
        iv: &Iv,
    ) -> Result<CipherWriter, ConnectorError>;

    /// Remove a file dirent's content blob.
    fn remove_file(&self, dirent: &Dirent) -> Result<(), ConnectorError>;

    /// Remove a named metadata blob.
    fn remove_metadata_file(&self, name: &str) -> Result<(), ConnectorError>;

    /// Release the lock and deregister from the in-process registry.
    fn close(&self) -> Result<(), ConnectorError>;
}

static ACTIVE_CONNECTIONS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Claim a connector id; fails if a live connector already holds it.
pub(crate) fn register_connection(id: &str) -> Result<(), ConnectorError> {
    let mut active = ACTIVE_CONNECTIONS.lock();
    if !active.insert(id.to_string()) {
        return Err(ConnectorError::DuplicateConnection { id: id.to_string() });
    }
    Ok(())
}

pub(crate) fn release_connection(id: &str) {
    ACTIVE_CONNECTIONS.lock().remove(id);
}
