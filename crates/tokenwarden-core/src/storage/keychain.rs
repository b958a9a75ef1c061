use ::keyring::Entry;
use tracing::debug;

use super::{StorageBackend, StorageError, StorageResult};

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "tokenwarden";

/// Stores each key as a separate OS keychain entry under one service name.
#[derive(Debug, Clone)]
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> StorageResult<Entry> {
        Entry::new(&self.service, key).map_err(|e| StorageError::Keyring(e.to_string()))
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl StorageBackend for KeyringBackend {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Keyring(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StorageError::Keyring(e.to_string()))
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(::keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(StorageError::Keyring(e.to_string())),
        }
    }

    fn is_available(&self) -> bool {
        match Entry::new(&self.service, "availability-check") {
            Ok(_) => true,
            Err(e) => {
                debug!(service = %self.service, error = %e, "Keychain unavailable");
                false
            }
        }
    }
}
