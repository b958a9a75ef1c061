//! Token lifecycle manager.
//!
//! `TokenManager` is the only writer of the credential and the session. It
//! owns login, registration, logout, renewal (through the single-flight slot)
//! and the expiry monitor. Other components read through it or through the
//! [`SessionPublisher`].

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialStore};
use super::error::AuthError;
use super::flight::{FlightGuard, FlightOutcome, FlightSlot, RefreshFlight};
use super::grant::TokenGrant;
use super::session::{Session, SessionChange, SessionPublisher, SessionSnapshot, UserProfile};
use crate::api::identity::{IdentityError, IdentityProvider, LoginCredentials, Registration};
use crate::clock::Clock;
use crate::utils::{lock, read, write};

/// How often the expiry monitor wakes up (5 minutes)
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5 * 60;

/// Renew when the access token has less than this left (10 minutes)
pub const DEFAULT_RENEWAL_LEAD_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub monitor_interval: StdDuration,
    pub lead_time: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            monitor_interval: StdDuration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            lead_time: Duration::seconds(DEFAULT_RENEWAL_LEAD_SECS),
        }
    }
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPhase {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
}

#[derive(Debug, Default)]
pub(super) struct AuthState {
    pub(super) phase: AuthPhase,
    pub(super) session: Session,
    pub(super) credential: Option<Credential>,
    /// Bumped on every login and logout so a renewal started under an older
    /// session cannot install its result into a newer one.
    pub(super) epoch: u64,
}

pub(super) struct ManagerInner {
    pub(super) identity: Arc<dyn IdentityProvider>,
    pub(super) store: CredentialStore,
    pub(super) publisher: SessionPublisher,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: LifecycleSettings,
    pub(super) state: RwLock<AuthState>,
    /// Held across every session transition: the state change, persistence,
    /// the published snapshot and the monitor start or stop. Two transitions
    /// never interleave, so the last published snapshot matches the state.
    pub(super) transition: Mutex<()>,
    pub(super) flight: FlightSlot,
    pub(super) monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct TokenManager {
    pub(super) inner: Arc<ManagerInner>,
}

impl TokenManager {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: CredentialStore,
        publisher: SessionPublisher,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                identity,
                store,
                publisher,
                clock,
                settings,
                state: RwLock::new(AuthState::default()),
                transition: Mutex::new(()),
                flight: FlightSlot::default(),
                monitor: Mutex::new(None),
            }),
        }
    }

    // ===== Read access =====

    pub fn publisher(&self) -> &SessionPublisher {
        &self.inner.publisher
    }

    pub fn settings(&self) -> LifecycleSettings {
        self.inner.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Latest session snapshot
    pub fn session(&self) -> SessionSnapshot {
        self.inner.publisher.current()
    }

    pub fn phase(&self) -> AuthPhase {
        read(&self.inner.state).phase
    }

    pub fn is_authenticated(&self) -> bool {
        read(&self.inner.state).session.is_authenticated
    }

    /// Current credential, if authenticated
    pub fn credential(&self) -> Option<Credential> {
        read(&self.inner.state).credential.clone()
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        self.inner.flight.is_active()
    }

    fn transition(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.transition)
    }

    // ===== Login / registration =====

    /// Authenticate against the identity service and start the expiry monitor.
    ///
    /// On failure the previous session state is left as it was; nothing is
    /// persisted or published.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<SessionSnapshot, AuthError> {
        credentials.validate()?;

        let previous = {
            let _transition = self.transition();
            let mut state = write(&self.inner.state);
            let previous = state.phase;
            state.phase = AuthPhase::Authenticating;
            previous
        };
        info!(username = %credentials.username, "Logging in");

        match self.authenticate(credentials).await {
            Ok((credential, user)) => {
                info!(
                    username = %credentials.username,
                    expires_at = ?credential.expires_at,
                    "Login successful"
                );
                Ok(self.establish(credential, user, SessionChange::LoggedIn))
            }
            Err(e) => {
                warn!(username = %credentials.username, error = %e, "Login failed");
                {
                    let _transition = self.transition();
                    let mut state = write(&self.inner.state);
                    if state.phase == AuthPhase::Authenticating {
                        state.phase = previous;
                    }
                }
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        credentials: &LoginCredentials,
    ) -> Result<(Credential, Option<UserProfile>), AuthError> {
        let payload = self
            .inner
            .identity
            .login(credentials)
            .await
            .map_err(|e| match e {
                IdentityError::Rejected { .. } => AuthError::InvalidCredentials,
                other => Self::map_identity_error(other),
            })?;

        let (grant, user) = TokenGrant::from_login(payload)?;
        let credential = grant.into_credential(self.now(), None)?;
        Ok((credential, user))
    }

    /// Create an account. Does not sign the new account in.
    pub async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        registration.validate()?;

        let payload = self
            .inner
            .identity
            .register(registration)
            .await
            .map_err(|e| match e {
                IdentityError::Rejected { .. } => AuthError::RegistrationRejected,
                other => Self::map_identity_error(other),
            })?;

        match payload.get("success").and_then(|v| v.as_bool()) {
            Some(false) => {
                warn!(username = %registration.username, "Registration rejected");
                Err(AuthError::RegistrationRejected)
            }
            _ => {
                info!(username = %registration.username, "Registration accepted");
                Ok(())
            }
        }
    }

    fn map_identity_error(error: IdentityError) -> AuthError {
        match error {
            IdentityError::Rejected { .. } => AuthError::AuthenticationFailed,
            IdentityError::Unavailable { status } => AuthError::ServiceUnavailable(status),
            IdentityError::Network(e) => AuthError::Network(e),
            IdentityError::InvalidResponse(msg) => AuthError::Validation(msg),
        }
    }

    /// Install a credential as a fresh session, persist it, publish and
    /// (re)start the monitor.
    fn establish(
        &self,
        credential: Credential,
        user: Option<UserProfile>,
        change: SessionChange,
    ) -> SessionSnapshot {
        let _transition = self.transition();
        let now = self.now();
        let session = {
            let mut state = write(&self.inner.state);
            state.epoch += 1;
            state.phase = AuthPhase::Authenticated;
            state.credential = Some(credential.clone());
            state.session = Session {
                is_authenticated: true,
                user,
                is_refreshing: false,
                last_activity: Some(now),
            };
            state.session.clone()
        };
        if !self.inner.store.save(&credential) {
            debug!("Credential not persisted, session is memory-only");
        }
        let snapshot = self
            .inner
            .publisher
            .publish(&session, Some(&credential), change);
        self.start_monitor();
        snapshot
    }

    /// Re-authenticate from a persisted credential.
    ///
    /// An already-expired credential is cleared. Otherwise the session is
    /// restored and one expiry check runs right away, which may renew it.
    pub async fn restore(&self) -> bool {
        let Some(credential) = self.inner.store.load() else {
            debug!("No stored credential to restore");
            return false;
        };
        if credential.is_expired(self.now()) {
            info!("Stored credential has expired, clearing it");
            let _transition = self.transition();
            if !read(&self.inner.state).session.is_authenticated {
                self.inner.store.clear();
            }
            return false;
        }

        info!(expires_at = ?credential.expires_at, "Restoring session from stored credential");
        self.establish(credential, None, SessionChange::Restored);
        self.check_expiry().await.is_usable()
    }

    // ===== Logout =====

    /// End the session.
    ///
    /// Everything happens before this returns: the monitor is stopped, the
    /// store cleared, the session reset, and only then is the `LoggedOut`
    /// snapshot (carrying `redirect_hint`) published.
    pub fn logout(&self, redirect_hint: Option<&str>) {
        info!("Logging out");
        self.end_session(SessionChange::LoggedOut {
            redirect: redirect_hint.map(str::to_string),
        });
    }

    fn end_session(&self, change: SessionChange) {
        let _transition = self.transition();
        self.reset(change);
    }

    /// End the session only if `still_current` holds for the state seen
    /// under the transition lock. Returns whether the session was ended.
    pub(super) fn end_session_if<F>(&self, change: SessionChange, still_current: F) -> bool
    where
        F: FnOnce(&AuthState) -> bool,
    {
        let _transition = self.transition();
        let current = still_current(&read(&self.inner.state));
        if current {
            self.reset(change);
        }
        current
    }

    /// Caller holds the transition lock
    fn reset(&self, change: SessionChange) {
        self.stop_monitor();
        let session = {
            let mut state = write(&self.inner.state);
            state.epoch += 1;
            state.phase = AuthPhase::Unauthenticated;
            state.credential = None;
            state.session = Session::default();
            state.session.clone()
        };
        self.inner.store.clear();
        self.inner.publisher.publish(&session, None, change);
    }

    /// End the session if `rejected` is still the installed credential.
    /// Used when a freshly renewed token is refused by the API.
    pub(crate) fn invalidate(&self, rejected: &Credential) {
        let ended = self.end_session_if(SessionChange::LoggedOut { redirect: None }, |state| {
            state
                .credential
                .as_ref()
                .map(|c| c.access_token == rejected.access_token)
                .unwrap_or(false)
        });
        if ended {
            warn!("Renewed access token was rejected, session ended");
        }
    }

    // ===== Renewal =====

    /// Renew the access token. Joins a renewal that is already running.
    /// Returns false (after logging out) if renewal is impossible.
    pub async fn refresh(&self) -> bool {
        self.refresh_credential().await.is_ok()
    }

    /// Like [`refresh`](Self::refresh) but returns the new credential or the
    /// failure shared by everyone who joined the flight.
    pub async fn refresh_credential(&self) -> FlightOutcome {
        self.flight().await
    }

    /// The active refresh flight, starting one if none exists
    pub fn flight(&self) -> RefreshFlight {
        let (flight, _started) = self.inner.flight.join_or_start(|guard| {
            let manager = self.clone();
            tokio::spawn(async move { manager.run_flight(guard).await })
        });
        flight
    }

    async fn run_flight(self, guard: FlightGuard) -> FlightOutcome {
        let (epoch, current) = {
            let _transition = self.transition();
            let mut state = write(&self.inner.state);
            let epoch = state.epoch;
            let current = state.credential.clone();
            if let Some(credential) = current.as_ref() {
                state.phase = AuthPhase::Refreshing;
                state.session.is_refreshing = true;
                let session = state.session.clone();
                drop(state);
                self.inner
                    .publisher
                    .publish(&session, Some(credential), SessionChange::Refreshing);
            }
            (epoch, current)
        };

        let Some(current) = current else {
            warn!(flight = guard.id(), "Refresh requested without a session");
            self.end_session_if(SessionChange::LoggedOut { redirect: None }, |state| {
                state.epoch == epoch
            });
            return Err(AuthError::RefreshFailed("no session".to_string()));
        };
        debug!(flight = guard.id(), "Renewing access token");

        match self.renew(&current).await {
            Ok(next) => self.install(next, epoch),
            Err(e) => {
                let ended = self.end_session_if(SessionChange::LoggedOut { redirect: None }, |state| {
                    state.epoch == epoch
                });
                if ended {
                    warn!(flight = guard.id(), "Token renewal failed, session ended");
                    Err(e)
                } else {
                    debug!(flight = guard.id(), "Renewal failed for a session that already ended");
                    Err(AuthError::SessionEnded)
                }
            }
        }
    }

    /// Failure detail is logged here; the returned error carries only a
    /// generic reason.
    async fn renew(&self, current: &Credential) -> FlightOutcome {
        let payload = self
            .inner
            .identity
            .renew(&current.access_token, &current.refresh_token)
            .await
            .map_err(|e| {
                warn!(error = %e, "Renewal request failed");
                let reason = match e {
                    IdentityError::Rejected { .. } => "renewal rejected",
                    IdentityError::Unavailable { .. } => "identity service unavailable",
                    IdentityError::Network(_) => "identity service unreachable",
                    IdentityError::InvalidResponse(_) => "invalid renewal response",
                };
                AuthError::RefreshFailed(reason.to_string())
            })?;

        TokenGrant::from_renewal(payload)
            .and_then(|grant| grant.into_credential(self.now(), Some(&current.refresh_token)))
            .map_err(|e| {
                warn!(error = %e, "Renewal response did not match the expected shape");
                AuthError::RefreshFailed("invalid renewal response".to_string())
            })
    }

    fn install(&self, next: Credential, epoch: u64) -> FlightOutcome {
        let _transition = self.transition();
        let now = self.now();
        let (session, installed) = {
            let mut state = write(&self.inner.state);
            if state.epoch != epoch || state.credential.is_none() {
                debug!("Session changed during renewal, discarding renewed credential");
                return Err(AuthError::SessionEnded);
            }
            let installed = match state.credential.as_ref() {
                Some(current) => current.renewed_with(next),
                None => next,
            };
            state.credential = Some(installed.clone());
            state.phase = AuthPhase::Authenticated;
            state.session.is_refreshing = false;
            state.session.last_activity = Some(now);
            (state.session.clone(), installed)
        };
        if !self.inner.store.save(&installed) {
            debug!("Renewed credential not persisted");
        }

        info!(expires_at = ?installed.expires_at, "Access token renewed");
        self.inner
            .publisher
            .publish(&session, Some(&installed), SessionChange::Refreshed);
        self.start_monitor();
        Ok(installed)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("phase", &self.phase())
            .field("refresh_in_flight", &self.is_refresh_in_flight())
            .field("store", &self.inner.store)
            .finish()
    }
}
