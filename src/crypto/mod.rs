//! Cryptographic primitives for ELFS filesystems.

pub mod keys;

use thiserror::Error;

/// Errors that can occur while handling key material.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The supplied AES key has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The supplied IV has the wrong length.
    #[error("invalid IV length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
}

pub use keys::{derive_table_iv, iv_from_slice, random_iv, FsKey, Iv, IV_SIZE, KEY_SIZE};
