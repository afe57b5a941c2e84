//! ELFS: an encrypted userspace filesystem over pluggable block storage.
//!
//! All file contents and all metadata are encrypted with AES-128-CTR before
//! they reach the backend; the backend itself (a local directory, an object
//! store bucket) only ever sees ciphertext blobs and a plaintext lock file.
//!
//! The [`driver::Driver`] owns the in-memory metadata tables (directory
//! entries, users, groups), enforces authorization on every operation, and
//! streams file contents through [`cipherio`] readers and writers obtained
//! from a [`connector::Connector`].

#![deny(unsafe_code)]

pub mod cache;
pub mod cipherio;
pub mod connector;
pub mod crypto;
pub mod dirent;
pub mod driver;
pub mod error;
pub mod identity;
pub mod metadata;

pub use driver::{Driver, DriverError};
