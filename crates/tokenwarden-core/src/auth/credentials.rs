use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::StorageBackend;
use crate::utils::redact;

/// Storage key for the access token record
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Storage key for the refresh token. Kept apart from the access record so
/// either one can be rotated on its own.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// The access/refresh token pair and its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    /// `None` when the identity service did not report a lifetime
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Remaining lifetime, or `None` for credentials without an expiry
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|expiry| expiry - now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.time_until_expiry(now)
            .map(|remaining| remaining <= Duration::zero())
            .unwrap_or(false)
    }

    /// Still usable, but within `lead_time` of expiring
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, lead_time: Duration) -> bool {
        self.time_until_expiry(now)
            .map(|remaining| remaining > Duration::zero() && remaining <= lead_time)
            .unwrap_or(false)
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Replace this credential with a renewed one without letting the expiry
    /// move backwards.
    pub fn renewed_with(&self, mut next: Credential) -> Credential {
        if let (Some(current), Some(incoming)) = (self.expires_at, next.expires_at) {
            if incoming < current {
                warn!(
                    current = %current,
                    incoming = %incoming,
                    "Renewed credential expires earlier than the current one, keeping later expiry"
                );
                next.expires_at = Some(current);
            }
        }
        next
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What is written under [`ACCESS_TOKEN_KEY`]
#[derive(Debug, Serialize, Deserialize)]
struct StoredAccessToken {
    token: String,
    token_type: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

/// Persists the credential through a [`StorageBackend`].
///
/// Never fails: backend errors are logged and reported as `false`/`None`. A
/// store built with [`CredentialStore::disabled`] does nothing at all.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Option<Arc<dyn StorageBackend>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A store with no persistence behind it
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_available(&self) -> bool {
        self.backend
            .as_ref()
            .map(|backend| backend.is_available())
            .unwrap_or(false)
    }

    /// Persist both halves. If the refresh half cannot be written the access
    /// half is removed again so the store never holds a partial credential.
    pub fn save(&self, credential: &Credential) -> bool {
        let Some(backend) = self.usable_backend() else {
            return false;
        };

        let record = StoredAccessToken {
            token: credential.access_token.clone(),
            token_type: credential.token_type.clone(),
            issued_at: credential.issued_at,
            expires_at: credential.expires_at,
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode access token record");
                return false;
            }
        };

        if let Err(e) = backend.set(ACCESS_TOKEN_KEY, &encoded) {
            warn!(backend = backend.name(), error = %e, "Failed to persist access token");
            return false;
        }
        if let Err(e) = backend.set(REFRESH_TOKEN_KEY, &credential.refresh_token) {
            warn!(backend = backend.name(), error = %e, "Failed to persist refresh token");
            let _ = backend.remove(ACCESS_TOKEN_KEY);
            return false;
        }
        debug!(backend = backend.name(), "Credential persisted");
        true
    }

    /// Load the persisted credential. Corrupt or half-present entries are
    /// removed and reported as absent.
    pub fn load(&self) -> Option<Credential> {
        let backend = self.usable_backend()?;

        let access = Self::read(backend, ACCESS_TOKEN_KEY);
        let refresh = Self::read(backend, REFRESH_TOKEN_KEY);

        let (access, refresh) = match (access, refresh) {
            (None, None) => return None,
            (Some(access), Some(refresh)) => (access, refresh),
            _ => {
                warn!(backend = backend.name(), "Found partial credential, clearing it");
                self.clear();
                return None;
            }
        };

        let record: StoredAccessToken = match serde_json::from_str(&access) {
            Ok(record) => record,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "Corrupt access token record, clearing it");
                self.clear();
                return None;
            }
        };
        if record.token.is_empty() || refresh.is_empty() {
            warn!(backend = backend.name(), "Empty token in storage, clearing it");
            self.clear();
            return None;
        }

        Some(Credential {
            access_token: record.token,
            refresh_token: refresh,
            token_type: record.token_type,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
        })
    }

    /// Remove both entries. Returns false if the backend reported an error.
    pub fn clear(&self) -> bool {
        let Some(backend) = self.usable_backend() else {
            return false;
        };
        let mut ok = true;
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = backend.remove(key) {
                warn!(backend = backend.name(), key, error = %e, "Failed to clear credential entry");
                ok = false;
            }
        }
        ok
    }

    fn usable_backend(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.backend.as_ref().filter(|backend| backend.is_available())
    }

    fn read(backend: &Arc<dyn StorageBackend>, key: &str) -> Option<String> {
        match backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(backend = backend.name(), key, error = %e, "Failed to read credential entry");
                None
            }
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}
