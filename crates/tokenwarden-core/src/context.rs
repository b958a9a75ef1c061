//! Composition root.
//!
//! `AuthContext` wires one lifecycle manager, one coordinator and one
//! publisher together. Build it once at startup and pass it (or clones of it)
//! to whatever needs authenticated access.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::{info, warn};

use crate::api::{
    HttpIdentityClient, IdentityProvider, LoginCredentials, Registration, RequestCoordinator,
    RequestDescriptor, RequestError, ReqwestTransport, ResourceClient, Response, Transport,
};
use crate::auth::{
    AuthError, CredentialStore, LifecycleSettings, SessionPublisher, SessionSnapshot,
    Subscription, TokenManager,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{AuthConfig, StorageConfig};
use crate::storage::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend};

/// Cheap to clone; all clones share one session.
#[derive(Clone, Debug)]
pub struct AuthContext {
    manager: TokenManager,
    coordinator: RequestCoordinator,
}

pub struct AuthContextBuilder {
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn Transport>,
    backend: Option<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

impl AuthContextBuilder {
    pub fn new(identity: Arc<dyn IdentityProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            transport,
            backend: None,
            clock: Arc::new(SystemClock),
            settings: LifecycleSettings::default(),
        }
    }

    /// Persist credentials here. Without a backend sessions are memory-only.
    pub fn storage(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> AuthContext {
        let store = match self.backend {
            Some(backend) => CredentialStore::new(backend),
            None => CredentialStore::disabled(),
        };
        let publisher = SessionPublisher::new(Arc::clone(&self.clock), self.settings.lead_time);
        let manager = TokenManager::new(self.identity, store, publisher, self.clock, self.settings);
        let coordinator = RequestCoordinator::new(manager.clone(), self.transport);
        AuthContext {
            manager,
            coordinator,
        }
    }
}

impl AuthContext {
    pub fn builder(
        identity: Arc<dyn IdentityProvider>,
        transport: Arc<dyn Transport>,
    ) -> AuthContextBuilder {
        AuthContextBuilder::new(identity, transport)
    }

    /// Build the production stack described by `config`.
    ///
    /// `passphrase` is required when the config asks for an encrypted file.
    pub fn from_config(config: &AuthConfig, passphrase: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let identity = Arc::new(HttpIdentityClient::new(client.clone(), config.endpoints.clone()));
        let transport = Arc::new(ReqwestTransport::with_client(client));
        let backend = Self::storage_backend(&config.storage, passphrase)?;

        info!(
            base_url = %config.endpoints.base_url,
            storage = backend.name(),
            "Auth context configured"
        );
        Ok(Self::builder(identity, transport)
            .storage(backend)
            .settings(config.settings())
            .build())
    }

    fn storage_backend(
        storage: &StorageConfig,
        passphrase: Option<String>,
    ) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match storage {
            StorageConfig::Memory => Arc::new(MemoryBackend::new()),
            StorageConfig::File { path, encrypted } => {
                let path = match path {
                    Some(path) => path.clone(),
                    None => FileBackend::default_path()
                        .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?,
                };
                if *encrypted {
                    let passphrase = passphrase.context(
                        "Encrypted credential storage needs a passphrase (TOKENWARDEN_PASSPHRASE)",
                    )?;
                    Arc::new(FileBackend::encrypted(path, passphrase))
                } else {
                    Arc::new(FileBackend::new(path))
                }
            }
            StorageConfig::Keyring { service } => {
                let keyring = KeyringBackend::new(service.clone());
                if !keyring.is_available() {
                    warn!(service = %service, "OS keychain unavailable, credentials will not persist");
                }
                Arc::new(keyring)
            }
        };
        Ok(backend)
    }

    pub fn manager(&self) -> &TokenManager {
        &self.manager
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn publisher(&self) -> &SessionPublisher {
        self.manager.publisher()
    }

    /// JSON resource helpers rooted at `base_url`
    pub fn resource_client(&self, base_url: impl Into<String>) -> ResourceClient {
        ResourceClient::new(self.coordinator.clone(), base_url)
    }

    // ===== Public surface =====

    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Response, RequestError> {
        self.coordinator.execute(descriptor).await
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.publisher().subscribe(listener)
    }

    pub fn session(&self) -> SessionSnapshot {
        self.manager.session()
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<SessionSnapshot, AuthError> {
        self.manager.login(credentials).await
    }

    pub async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        self.manager.register(registration).await
    }

    pub fn logout(&self, redirect_hint: Option<&str>) {
        self.manager.logout(redirect_hint)
    }

    pub async fn refresh(&self) -> bool {
        self.manager.refresh().await
    }

    pub async fn restore(&self) -> bool {
        self.manager.restore().await
    }
}
