//! Filesystem master key and IV handling.
//!
//! The master key is the single AES-128 key that every stream in the
//! filesystem is encrypted under; streams are distinguished by their IVs.
//! Per-table IVs are derived from the filesystem's base IV so that only the
//! (key, base IV) pair has to be remembered out of band.

use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use std::fmt;
use zeroize::Zeroizing;

use super::CryptoError;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// Initialization vector size in bytes (one AES block).
pub const IV_SIZE: usize = 16;

/// A per-stream initialization vector.
pub type Iv = [u8; IV_SIZE];

/// The filesystem master key.
///
/// The key is stored behind `secrecy::Secret`, which keeps it out of debug
/// output and zeroes the memory on drop. Access is provided through a scoped
/// callback so the raw bytes are only exposed for the duration of a cipher
/// construction.
#[derive(Clone)]
pub struct FsKey {
    aes_key: Secret<[u8; KEY_SIZE]>,
}

impl FsKey {
    /// Wrap an existing 16-byte AES key.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        FsKey {
            aes_key: Secret::new(bytes),
        }
    }

    /// Wrap a key supplied as a slice, validating its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(FsKey {
            aes_key: Secret::new(*key),
        })
    }

    /// Execute a function with access to the raw AES key bytes.
    pub fn with_aes_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; KEY_SIZE]) -> R,
    {
        f(self.aes_key.expose_secret())
    }
}

impl fmt::Debug for FsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsKey").field("aes_key", &"[REDACTED]").finish()
    }
}

/// Validate an IV supplied as a slice.
pub fn iv_from_slice(bytes: &[u8]) -> Result<Iv, CryptoError> {
    if bytes.len() != IV_SIZE {
        return Err(CryptoError::InvalidIvLength {
            expected: IV_SIZE,
            actual: bytes.len(),
        });
    }
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(bytes);
    Ok(iv)
}

/// Generate a fresh random IV for a new file stream.
pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Derive a metadata-table IV from the filesystem base IV.
///
/// The tag is XORed into the low byte of the base IV. Tags are distinct per
/// table (`metadata::TableKind` tags plus the cache tag), which makes the
/// derivation injective across the four metadata streams.
pub fn derive_table_iv(base: &Iv, tag: u8) -> Iv {
    let mut iv = *base;
    iv[IV_SIZE - 1] ^= tag;
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_validation() {
        assert!(FsKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
        assert!(matches!(
            FsKey::from_slice(&[0u8; 17]),
            Err(CryptoError::InvalidKeyLength { actual: 17, .. })
        ));
    }

    #[test]
    fn test_scoped_access() {
        let key = FsKey::from_bytes([7u8; KEY_SIZE]);
        let sum: u32 = key.with_aes_key(|k| k.iter().map(|&b| u32::from(b)).sum());
        assert_eq!(sum, 7 * 16);
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = FsKey::from_bytes([9u8; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains('9'));
    }

    #[test]
    fn test_table_iv_derivation_is_injective() {
        let base = [0xA5u8; IV_SIZE];
        let derived: Vec<Iv> = [1u8, 2, 3, 4]
            .iter()
            .map(|&tag| derive_table_iv(&base, tag))
            .collect();

        for (i, a) in derived.iter().enumerate() {
            assert_ne!(a.as_slice(), base.as_slice());
            for b in &derived[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_table_iv_only_touches_low_byte() {
        let base = [0u8; IV_SIZE];
        let derived = derive_table_iv(&base, 3);
        assert_eq!(&derived[..IV_SIZE - 1], &base[..IV_SIZE - 1]);
        assert_eq!(derived[IV_SIZE - 1], 3);
    }
}
