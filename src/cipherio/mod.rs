//! Length-preserving encrypted streams.
//!
//! File contents and metadata tables are encrypted with AES-128-CTR using a
//! 128-bit big-endian counter initialized from the stream's 16-byte IV
//! (counter = IV + block index). CTR is a stream mode: ciphertext length
//! equals plaintext length and there is no padding. The IV is not stored in
//! the ciphertext; the caller is responsible for remembering which IV
//! belongs to which stream.
//!
//! Writers buffer plaintext into fixed-size I/O blocks before encrypting
//! and flushing; the block size is an implementation constant and not part
//! of the on-disk format.

mod reader;
mod writer;

use std::io::{self, Read, Seek, Write};

use thiserror::Error;

pub use reader::CipherReader;
pub use writer::{CipherWriter, WriteSummary};

/// AES-128-CTR with a big-endian 128-bit counter.
pub(crate) type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Plaintext buffered per I/O block before a write is issued (1 MiB).
pub const IO_BLOCK_SIZE: usize = 1024 * 1024;

/// A seekable byte source supplied by a connector.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A byte sink supplied by a connector.
///
/// `commit` is invoked exactly once, after the final encrypted block has
/// been flushed; backends that stage writes (temp file + rename, multipart
/// upload) make the blob visible here.
pub trait BlobSink: Write + Send {
    fn commit(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl BlobSink for std::fs::File {}
impl BlobSink for Vec<u8> {}

/// Errors from encrypted stream I/O.
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FsKey, Iv};
    use std::io::{Cursor, SeekFrom};
    use std::sync::Arc;

    fn test_key() -> FsKey {
        FsKey::from_bytes([0x42u8; 16])
    }

    fn test_iv() -> Iv {
        [0x17u8; 16]
    }

    /// Sink that lets the test observe the ciphertext after `finalize`.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl BlobSink for SharedBuf {}

    fn encrypt_with_iv(plaintext: &[u8], iv: &Iv) -> (Vec<u8>, WriteSummary) {
        let sink = SharedBuf::default();
        let mut writer = CipherWriter::new(Box::new(sink.clone()), &test_key(), iv);
        writer.write_all(plaintext).unwrap();
        let summary = writer.finalize().unwrap();
        let ciphertext = sink.0.lock().clone();
        (ciphertext, summary)
    }

    fn encrypt(plaintext: &[u8]) -> (Vec<u8>, WriteSummary) {
        encrypt_with_iv(plaintext, &test_iv())
    }

    #[test]
    fn test_round_trip() {
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let (ciphertext, summary) = encrypt(plaintext);

        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(summary.plaintext_len, plaintext.len() as u64);

        let mut reader = CipherReader::new(
            Box::new(Cursor::new(ciphertext)),
            &test_key(),
            &test_iv(),
            plaintext.len() as u64,
        );
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_stream() {
        let (ciphertext, summary) = encrypt(b"");
        assert!(ciphertext.is_empty());
        assert_eq!(summary.plaintext_len, 0);
        // MD5 of the empty message.
        assert_eq!(
            hex::encode(summary.md5),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_md5_matches_plaintext() {
        let (_, summary) = encrypt(b"hello");
        assert_eq!(
            hex::encode(summary.md5),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn test_write_spanning_io_blocks() {
        let plaintext: Vec<u8> = (0..IO_BLOCK_SIZE + 4096).map(|i| (i % 251) as u8).collect();
        let (ciphertext, summary) = encrypt(&plaintext);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_eq!(summary.plaintext_len, plaintext.len() as u64);

        let mut reader = CipherReader::new(
            Box::new(Cursor::new(ciphertext)),
            &test_key(),
            &test_iv(),
            plaintext.len() as u64,
        );
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_seek_realigns_keystream() {
        let plaintext: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        let (ciphertext, _) = encrypt(&plaintext);

        let mut reader = CipherReader::new(
            Box::new(Cursor::new(ciphertext)),
            &test_key(),
            &test_iv(),
            plaintext.len() as u64,
        );

        // Unaligned offset, mid cipher block.
        let offset = 4321u64;
        reader.seek(SeekFrom::Start(offset)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &plaintext[offset as usize..]);

        // Seek backwards and re-read from the start.
        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, plaintext);
    }

    #[test]
    fn test_seek_from_end() {
        let plaintext = b"0123456789";
        let (ciphertext, _) = encrypt(plaintext);

        let mut reader = CipherReader::new(
            Box::new(Cursor::new(ciphertext)),
            &test_key(),
            &test_iv(),
            plaintext.len() as u64,
        );
        let pos = reader.seek(SeekFrom::End(-3)).unwrap();
        assert_eq!(pos, 7);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(&tail, b"789");
    }

    #[test]
    fn test_seek_before_start_is_rejected() {
        let (ciphertext, _) = encrypt(b"abc");
        let mut reader = CipherReader::new(
            Box::new(Cursor::new(ciphertext)),
            &test_key(),
            &test_iv(),
            3,
        );
        assert!(reader.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn test_distinct_ivs_yield_distinct_ciphertext() {
        let plaintext = b"same plaintext";
        let (a, _) = encrypt_with_iv(plaintext, &[1u8; 16]);
        let (b, _) = encrypt_with_iv(plaintext, &[2u8; 16]);
        assert_ne!(a, b);
    }
}
