//! The filesystem driver: the in-memory state machine that owns the
//! metadata tables, enforces authorization, and coordinates encrypted I/O
//! through a connector.
//!
//! All mutating operations are serialized under one coarse lock and follow
//! the same protocol: validate, mutate the in-memory table, bump the
//! table's version, journal the mutation. A failed journal append rolls the
//! mutation back, so state is never visible that is not also persisted.
//! File-content readers handed out by [`Driver::read`] own their backend
//! handle and run concurrently with mutators.

mod authorize;
mod files;
mod init;
mod users;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::cache::{CacheError, MetadataCache};
use crate::cipherio::CipherError;
use crate::connector::{Connector, ConnectorError, LocalConnector};
use crate::crypto::{self, CryptoError, FsKey, Iv};
use crate::dirent::{Dirent, DirentId};
use crate::identity::{Group, GroupId, User, UserId};
use crate::metadata::{self, CacheEntry, MetadataError, TableKind, CACHE_IV_TAG, FAT_BLOB, GROUPS_BLOB, USERS_BLOB};

/// Errors reported by driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no {what} with id {id}")]
    NotFound { what: &'static str, id: String },

    #[error("dirent {id} is not a directory")]
    NotADirectory { id: String },

    #[error("dirent {id} is a directory")]
    IsADirectory { id: String },

    #[error("name '{name}' already exists in directory {parent}")]
    NameExists { name: String, parent: String },

    #[error("moving {target} into {new_parent} would form a cycle")]
    CycleWouldForm { target: String, new_parent: String },

    #[error("user {user} is not permitted to {action}")]
    PermissionDenied { user: UserId, action: String },

    #[error("authentication failed")]
    AuthFailed,

    #[error("filesystem metadata failed validation: {0}")]
    InvariantViolation(String),

    #[error("a filesystem already exists on this backend")]
    FilesystemExists,

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("bad key material: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The tables and derived state guarded by the driver's lock.
pub(crate) struct DriverState {
    pub(crate) fat: HashMap<DirentId, Dirent>,
    pub(crate) fat_version: u64,
    pub(crate) users: HashMap<UserId, User>,
    pub(crate) users_version: u64,
    pub(crate) groups: HashMap<GroupId, Group>,
    pub(crate) groups_version: u64,
    /// Derived child index: directory id to child dirent ids.
    pub(crate) dirs: HashMap<DirentId, Vec<DirentId>>,
    pub(crate) cache: MetadataCache,
}

impl DriverState {
    fn empty() -> Self {
        DriverState {
            fat: HashMap::new(),
            fat_version: 0,
            users: HashMap::new(),
            users_version: 0,
            groups: HashMap::new(),
            groups_version: 0,
            dirs: HashMap::new(),
            cache: MetadataCache::new(),
        }
    }

    pub(crate) fn add_child(&mut self, parent: &DirentId, child: DirentId) {
        self.dirs.entry(parent.clone()).or_default().push(child);
    }

    pub(crate) fn remove_child(&mut self, parent: &DirentId, child: &DirentId) {
        if let Some(children) = self.dirs.get_mut(parent) {
            children.retain(|c| c != child);
        }
    }

    /// Child of `parent` with the given name, if any.
    pub(crate) fn child_named(&self, parent: &DirentId, name: &str) -> Option<&Dirent> {
        self.dirs.get(parent)?.iter().find_map(|id| {
            let dirent = self.fat.get(id)?;
            (dirent.name == name).then_some(dirent)
        })
    }

    /// Rebuild the child index from the parent pointers in the fat.
    pub(crate) fn rebuild_dirs(&mut self) {
        self.dirs.clear();
        for dirent in self.fat.values() {
            if dirent.is_directory() {
                self.dirs.entry(dirent.id.clone()).or_default();
            }
        }
        for dirent in self.fat.values() {
            if !dirent.id.is_root() {
                self.dirs
                    .entry(dirent.parent.clone())
                    .or_default()
                    .push(dirent.id.clone());
            }
        }
    }
}

/// The filesystem orchestrator.
pub struct Driver {
    connector: Arc<dyn Connector>,
    key: FsKey,
    users_iv: Iv,
    groups_iv: Iv,
    fat_iv: Iv,
    cache_iv: Iv,
    state: Mutex<DriverState>,
}

impl Driver {
    /// Build a driver over an already-connected backend.
    ///
    /// The driver starts with empty tables; call
    /// [`Driver::create_filesystem`] for a fresh backend or
    /// [`Driver::sync_from_disk`] to load an existing one.
    pub fn new(key: FsKey, base_iv: Iv, connector: Arc<dyn Connector>) -> Self {
        Driver {
            users_iv: crypto::derive_table_iv(&base_iv, TableKind::Users.tag()),
            groups_iv: crypto::derive_table_iv(&base_iv, TableKind::Groups.tag()),
            fat_iv: crypto::derive_table_iv(&base_iv, TableKind::Fat.tag()),
            cache_iv: crypto::derive_table_iv(&base_iv, CACHE_IV_TAG),
            connector,
            key,
            state: Mutex::new(DriverState::empty()),
        }
    }

    /// Connect to a local-disk backend and build a driver over it.
    pub fn open_local(
        key: &[u8],
        base_iv: &[u8],
        path: impl AsRef<Path>,
        force: bool,
    ) -> Result<Self, DriverError> {
        let key = FsKey::from_slice(key)?;
        let base_iv = crypto::keys::iv_from_slice(base_iv)?;
        let connector = Arc::new(LocalConnector::connect(path, force)?);
        Ok(Driver::new(key, base_iv, connector))
    }

    /// Flush pending journal entries and release the backend.
    pub fn close(self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let flush_result = if state.cache.is_empty() {
            Ok(())
        } else {
            self.flush_tables(&mut state)
        };
        drop(state);

        let close_result = self.connector.close();
        flush_result?;
        close_result?;
        Ok(())
    }

    /// Current versions of the (users, groups, fat) tables.
    pub fn table_versions(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (state.users_version, state.groups_version, state.fat_version)
    }

    /// Serialize the full tables out, then truncate the journal.
    fn flush_tables(&self, state: &mut DriverState) -> Result<(), DriverError> {
        self.write_tables(state)?;
        state
            .cache
            .truncate(self.connector.as_ref(), &self.key, &self.cache_iv)?;
        Ok(())
    }

    fn write_tables(&self, state: &DriverState) -> Result<(), DriverError> {
        let mut writer = self
            .connector
            .metadata_writer(USERS_BLOB, &self.key, &self.users_iv)?;
        metadata::write_users_table(&mut writer, state.users_version, &state.users)?;
        writer.finalize()?;

        let mut writer = self
            .connector
            .metadata_writer(GROUPS_BLOB, &self.key, &self.groups_iv)?;
        metadata::write_groups_table(&mut writer, state.groups_version, &state.groups)?;
        writer.finalize()?;

        let mut writer = self
            .connector
            .metadata_writer(FAT_BLOB, &self.key, &self.fat_iv)?;
        metadata::write_fat_table(&mut writer, state.fat_version, &state.fat)?;
        writer.finalize()?;

        Ok(())
    }

    /// Append a journal entry; the caller rolls its mutation back on error.
    fn journal(&self, state: &mut DriverState, entry: CacheEntry) -> Result<(), DriverError> {
        state
            .cache
            .append(self.connector.as_ref(), &self.key, &self.cache_iv, entry)?;
        Ok(())
    }

    /// Rewrite the tables if the journal has outgrown its threshold. The
    /// triggering operation has already been journaled, so a failed flush
    /// only defers the rewrite.
    fn maybe_flush(&self, state: &mut DriverState) {
        if state.cache.should_flush() {
            if let Err(e) = self.flush_tables(state) {
                warn!(error = %e, "deferred table flush failed; journal retained");
            }
        }
    }
}
