//! Local-disk connector: treats a directory as a partition.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    register_connection, release_connection, Connector, ConnectorError, ADMIN_DIR, DATA_DIR,
    LOCK_BLOB,
};
use crate::cipherio::{BlobSink, CipherReader, CipherWriter};
use crate::crypto::{FsKey, Iv};
use crate::dirent::{Dirent, ID_CHARS};

/// Connector backed by a local directory.
///
/// There is only ever one connection to a given directory at a time; a
/// stale lock left by a dead process can be overridden with `force`.
pub struct LocalConnector {
    path: PathBuf,
    id: String,
}

impl LocalConnector {
    /// Connect to the filesystem rooted at `path`, taking the backend lock.
    pub fn connect(path: impl AsRef<Path>, force: bool) -> Result<Self, ConnectorError> {
        let path = std::path::absolute(path.as_ref())?;
        let id = format!("local:{}", path.display());
        register_connection(&id)?;

        let connector = LocalConnector { path, id };
        if let Err(e) = connector.attach(force) {
            release_connection(&connector.id);
            return Err(e);
        }

        debug!(id = %connector.id, "connected to local backend");
        Ok(connector)
    }

    fn attach(&self, force: bool) -> Result<(), ConnectorError> {
        fs::create_dir_all(self.path.join(ADMIN_DIR))?;
        self.lock(force)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.join(ADMIN_DIR).join(LOCK_BLOB)
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.path.join(ADMIN_DIR).join(name)
    }

    fn data_path(&self, dirent: &Dirent) -> PathBuf {
        self.path
            .join(DATA_DIR)
            .join(dirent.id.prefix().to_string())
            .join(dirent.id.as_str())
    }

    fn content_iv<'a>(dirent: &'a Dirent) -> Result<&'a Iv, ConnectorError> {
        dirent.content_iv().ok_or_else(|| {
            ConnectorError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dirent {} has no content stream", dirent.id),
            ))
        })
    }
}

impl Connector for LocalConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn prepare_storage(&self) -> Result<(), ConnectorError> {
        fs::create_dir_all(self.path.join(ADMIN_DIR))?;
        let data = self.path.join(DATA_DIR);
        fs::create_dir_all(&data)?;
        for &prefix in ID_CHARS {
            fs::create_dir_all(data.join((prefix as char).to_string()))?;
        }
        Ok(())
    }

    fn lock(&self, force: bool) -> Result<(), ConnectorError> {
        let lock_path = self.lock_path();

        match fs::read_to_string(&lock_path) {
            Ok(owner) if !force => {
                return Err(ConnectorError::AlreadyLocked { owner });
            }
            Ok(owner) => {
                warn!(owner = %owner, "forcing over an existing backend lock");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        fs::write(&lock_path, std::process::id().to_string())?;
        Ok(())
    }

    fn unlock(&self) -> Result<(), ConnectorError> {
        fs::remove_file(self.lock_path())?;
        Ok(())
    }

    fn cipher_reader(&self, dirent: &Dirent, key: &FsKey) -> Result<CipherReader, ConnectorError> {
        let iv = Self::content_iv(dirent)?;
        let file = File::open(self.data_path(dirent))?;
        let len = file.metadata()?.len();
        Ok(CipherReader::new(Box::new(file), key, iv, len))
    }

    fn cipher_writer(&self, dirent: &Dirent, key: &FsKey) -> Result<CipherWriter, ConnectorError> {
        let iv = Self::content_iv(dirent)?;
        let file = File::create(self.data_path(dirent))?;
        Ok(CipherWriter::new(Box::new(file), key, iv))
    }

    fn metadata_reader(
        &self,
        name: &str,
        key: &FsKey,
        iv: &Iv,
    ) -> Result<CipherReader, ConnectorError> {
        let file = File::open(self.metadata_path(name))?;
        let len = file.metadata()?.len();
        Ok(CipherReader::new(Box::new(file), key, iv, len))
    }

    fn metadata_writer(
        &self,
        name: &str,
        key: &FsKey,
        iv: &Iv,
    ) -> Result<CipherWriter, ConnectorError> {
        // Stage under a temporary name and rename on commit, so a torn
        // write leaves the previous generation of the blob intact.
        let final_path = self.metadata_path(name);
        let tmp_path = self.metadata_path(&format!("{name}.tmp"));
        let file = File::create(&tmp_path)?;
        let sink = TempFileSink {
            file,
            tmp_path,
            final_path,
        };
        Ok(CipherWriter::new(Box::new(sink), key, iv))
    }

    fn remove_file(&self, dirent: &Dirent) -> Result<(), ConnectorError> {
        fs::remove_file(self.data_path(dirent))?;
        Ok(())
    }

    fn remove_metadata_file(&self, name: &str) -> Result<(), ConnectorError> {
        fs::remove_file(self.metadata_path(name))?;
        Ok(())
    }

    fn close(&self) -> Result<(), ConnectorError> {
        let result = self.unlock();
        release_connection(&self.id);
        debug!(id = %self.id, "closed local backend connection");
        result
    }
}

impl Drop for LocalConnector {
    fn drop(&mut self) {
        // The registry entry must not outlive the connector; the lock file
        // is left behind like any other dead process's lock and needs a
        // forced reconnect.
        release_connection(&self.id);
    }
}

/// Sink that writes a metadata blob to a temporary file and renames it over
/// the canonical name on commit.
struct TempFileSink {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl Write for TempFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BlobSink for TempFileSink {
    fn commit(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.tmp_path, &self.final_path)
    }
}
