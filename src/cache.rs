//! Append-only journal of metadata mutations.
//!
//! Between full table rewrites, small mutations (a rename, a permission
//! change) are appended here instead of rewriting entire tables. Each entry
//! carries the table it belongs to, the table version the mutation
//! produced, and the serialized record (or id, for deletes). On load the
//! driver replays every entry newer than the loaded table version.
//!
//! The journal blob is rewritten on every append: the entry list lives in
//! memory, and backends without native append get the same semantics.

use std::io;

use thiserror::Error;
use tracing::{debug, trace};

use crate::cipherio::CipherError;
use crate::connector::{Connector, ConnectorError};
use crate::crypto::{FsKey, Iv};
use crate::metadata::{self, CacheEntry, MetadataError, CACHE_BLOB};

/// Serialized journal size beyond which the driver rewrites the full
/// tables and truncates the journal.
pub const CACHE_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Errors from journal persistence.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("journal backend error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("journal stream error: {0}")]
    Cipher(#[from] CipherError),

    #[error("journal codec error: {0}")]
    Metadata(#[from] MetadataError),
}

/// The in-memory journal and its persistence logic.
pub struct MetadataCache {
    entries: Vec<CacheEntry>,
    encoded_size: usize,
}

impl MetadataCache {
    pub fn new() -> Self {
        MetadataCache {
            entries: Vec::new(),
            encoded_size: 0,
        }
    }

    /// Load the journal from the backend; a missing blob is an empty
    /// journal (fresh filesystem, or just flushed).
    pub fn load(connector: &dyn Connector, key: &FsKey, iv: &Iv) -> Result<Self, CacheError> {
        let mut reader = match connector.metadata_reader(CACHE_BLOB, key, iv) {
            Ok(reader) => reader,
            Err(ConnectorError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(MetadataCache::new());
            }
            Err(e) => return Err(e.into()),
        };

        let entries = metadata::read_journal(&mut reader)?;
        let encoded_size = entries.iter().map(CacheEntry::encoded_len).sum();
        debug!(entries = entries.len(), "loaded metadata journal");
        Ok(MetadataCache {
            entries,
            encoded_size,
        })
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the journal has grown past the full-rewrite threshold.
    pub fn should_flush(&self) -> bool {
        self.encoded_size >= CACHE_FLUSH_THRESHOLD
    }

    /// Append an entry and persist the journal. If persistence fails the
    /// entry is dropped again, so the caller can roll back its in-memory
    /// mutation and the journal matches what is on the backend.
    pub fn append(
        &mut self,
        connector: &dyn Connector,
        key: &FsKey,
        iv: &Iv,
        entry: CacheEntry,
    ) -> Result<(), CacheError> {
        let entry_size = entry.encoded_len();
        trace!(
            table = ?entry.table,
            version = entry.version,
            op = ?entry.op,
            "journaling mutation"
        );

        self.entries.push(entry);
        if let Err(e) = persist(connector, key, iv, &self.entries) {
            self.entries.pop();
            return Err(e);
        }
        self.encoded_size += entry_size;
        Ok(())
    }

    /// Empty the journal after a successful full table flush.
    pub fn truncate(
        &mut self,
        connector: &dyn Connector,
        key: &FsKey,
        iv: &Iv,
    ) -> Result<(), CacheError> {
        persist(connector, key, iv, &[])?;
        debug!(dropped = self.entries.len(), "truncated metadata journal");
        self.entries.clear();
        self.encoded_size = 0;
        Ok(())
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        MetadataCache::new()
    }
}

fn persist(
    connector: &dyn Connector,
    key: &FsKey,
    iv: &Iv,
    entries: &[CacheEntry],
) -> Result<(), CacheError> {
    let mut writer = connector.metadata_writer(CACHE_BLOB, key, iv)?;
    metadata::write_journal(&mut writer, entries)?;
    writer.finalize()?;
    Ok(())
}
