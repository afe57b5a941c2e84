//! Encrypting writer over an opaque blob sink.

use std::io::{self, Write};

use aes::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use tracing::trace;

use super::{Aes128Ctr, BlobSink, CipherError, IO_BLOCK_SIZE};
use crate::crypto::{FsKey, Iv};

impl BlobSink for Box<dyn BlobSink> {
    fn commit(&mut self) -> io::Result<()> {
        (**self).commit()
    }
}

/// Result of a completed encrypted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Total plaintext bytes written.
    pub plaintext_len: u64,
    /// MD5 digest of the plaintext.
    pub md5: [u8; 16],
}

/// Buffered encrypting writer.
///
/// Plaintext is accumulated into [`IO_BLOCK_SIZE`] blocks; each full block
/// is folded into the running MD5, encrypted in place with the continuing
/// CTR keystream, and written to the sink. [`CipherWriter::finalize`]
/// flushes the trailing partial block, commits the sink, and reports the
/// plaintext length and digest.
pub struct CipherWriter {
    sink: Box<dyn BlobSink>,
    cipher: Aes128Ctr,
    digest: Md5,
    buffer: Vec<u8>,
    plaintext_len: u64,
}

impl CipherWriter {
    pub fn new(sink: Box<dyn BlobSink>, key: &FsKey, iv: &Iv) -> Self {
        let cipher = key.with_aes_key(|k| Aes128Ctr::new(k.into(), iv.into()));
        CipherWriter {
            sink,
            cipher,
            digest: Md5::new(),
            buffer: Vec::with_capacity(IO_BLOCK_SIZE),
            plaintext_len: 0,
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        trace!(block_len = self.buffer.len(), "flushing cipher block");
        self.digest.update(&self.buffer);
        self.cipher.apply_keystream(&mut self.buffer);
        self.sink.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the trailing partial block, commit the sink, and return the
    /// plaintext length and MD5 of everything written.
    pub fn finalize(mut self) -> Result<WriteSummary, CipherError> {
        self.flush_block()?;
        self.sink.commit()?;
        Ok(WriteSummary {
            plaintext_len: self.plaintext_len,
            md5: self.digest.finalize().into(),
        })
    }
}

impl Write for CipherWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let room = IO_BLOCK_SIZE - self.buffer.len();
            let take = room.min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buffer.len() == IO_BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        self.plaintext_len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.sink.flush()
    }
}
