//! Key-value persistence backends for credentials.
//!
//! This module provides:
//! - `StorageBackend`: the get/set/remove contract every backend implements
//! - `MemoryBackend`: process-local map, lost on exit
//! - `FileBackend`: JSON map on disk, optionally encrypted at rest
//! - `KeyringBackend`: OS-level secure storage via keyring
//!
//! Backends report failures through `StorageError`; turning those into the
//! never-failing credential store contract is done by `auth::CredentialStore`.

pub mod file;
pub mod keychain;
pub mod memory;

pub use self::file::FileBackend;
pub use self::keychain::KeyringBackend;
pub use self::memory::MemoryBackend;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keychain error: {0}")]
    Keyring(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Trait for credential persistence backends
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Retrieve a value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a value. Returns whether anything was removed.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Whether the backing medium can currently be used
    fn is_available(&self) -> bool {
        true
    }
}
