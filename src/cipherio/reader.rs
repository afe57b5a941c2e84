//! Decrypting reader over an opaque seekable source.

use std::io::{self, Read, Seek, SeekFrom};

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use super::{Aes128Ctr, ReadSeek};
use crate::crypto::{FsKey, Iv};

/// Decrypting reader with seek support.
///
/// Reads pull ciphertext from the source and apply the CTR keystream on
/// demand. Seeking re-positions both the source and the keystream, so a
/// reader can be rewound or jumped to any offset of the plaintext.
pub struct CipherReader {
    source: Box<dyn ReadSeek>,
    cipher: Aes128Ctr,
    len: u64,
    pos: u64,
}

impl CipherReader {
    /// `len` is the stream length in bytes (ciphertext and plaintext are
    /// the same length); it bounds `SeekFrom::End`.
    pub fn new(source: Box<dyn ReadSeek>, key: &FsKey, iv: &Iv, len: u64) -> Self {
        let cipher = key.with_aes_key(|k| Aes128Ctr::new(k.into(), iv.into()));
        CipherReader {
            source,
            cipher,
            len,
            pos: 0,
        }
    }

    /// Length of the stream in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for CipherReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for CipherReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;

        self.source.seek(SeekFrom::Start(target))?;
        self.cipher.try_seek(target).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot position keystream at offset {target}"),
            )
        })?;
        self.pos = target;
        Ok(target)
    }
}
