//! Error types for the elfs crate
//!
//! This module re-exports all error types and their defining modules so
//! callers have a single place to import them from.

pub use crate::cache::CacheError;
pub use crate::cipherio::CipherError;
pub use crate::connector::ConnectorError;
pub use crate::crypto::CryptoError;
pub use crate::driver::DriverError;
pub use crate::metadata::MetadataError;
