//! Test harness: a mock identity service and a mock API that share one set
//! of valid access tokens, wired into a real `AuthContext`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::api::{
    IdentityError, IdentityProvider, LoginCredentials, Registration, RequestDescriptor, Response,
    Transport, TransportError,
};
use crate::auth::{LifecycleSettings, SessionSnapshot, Subscription};
use crate::clock::ManualClock;
use crate::context::AuthContext;
use crate::storage::MemoryBackend;

pub const PASSWORD: &str = "correct horse";
pub const LIFETIME_SECS: i64 = 3600;
pub const API: &str = "https://api.example.com";

/// Access tokens the mock API currently accepts
#[derive(Default)]
pub struct TokenAuthority {
    valid: Mutex<HashSet<String>>,
}

impl TokenAuthority {
    pub fn issue(&self, token: &str) {
        self.valid.lock().unwrap().insert(token.to_string());
    }

    pub fn revoke(&self, token: &str) {
        self.valid.lock().unwrap().remove(token);
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.valid.lock().unwrap().contains(token)
    }
}

/// Held semaphore; calls that pass through it wait until released
pub struct Gate {
    held: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.permits.add_permits(64);
    }

    async fn pass(&self) {
        if self.held.load(Ordering::SeqCst) {
            let _permit = self.permits.acquire().await.unwrap();
        }
    }
}

pub struct MockIdentity {
    authority: Arc<TokenAuthority>,
    pub login_calls: AtomicUsize,
    pub renew_calls: AtomicUsize,
    pub renew_gate: Gate,
    pub fail_renewal: AtomicBool,
    pub renew_expires_in: AtomicI64,
    pub reject_registration: AtomicBool,
    /// When false, renewed tokens are handed out but the API never accepts them
    pub honor_renewed: AtomicBool,
    renewed_with: Mutex<Vec<String>>,
}

impl MockIdentity {
    pub fn new(authority: Arc<TokenAuthority>) -> Self {
        Self {
            authority,
            login_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
            renew_gate: Gate::new(),
            fail_renewal: AtomicBool::new(false),
            renew_expires_in: AtomicI64::new(LIFETIME_SECS),
            reject_registration: AtomicBool::new(false),
            honor_renewed: AtomicBool::new(true),
            renewed_with: Mutex::new(Vec::new()),
        }
    }

    pub fn renewals(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented to the renewal endpoint, in call order
    pub fn renewed_with(&self) -> Vec<String> {
        self.renewed_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn login(&self, credentials: &LoginCredentials) -> Result<Value, IdentityError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password != PASSWORD {
            return Err(IdentityError::Rejected { status: 401 });
        }
        self.authority.issue("access-0");
        Ok(json!({
            "accessToken": "access-0",
            "refreshToken": "refresh-0",
            "expiresIn": LIFETIME_SECS,
            "user": {"id": 42, "email": format!("{}@example.com", credentials.username)},
        }))
    }

    async fn register(&self, _registration: &Registration) -> Result<Value, IdentityError> {
        let accepted = !self.reject_registration.load(Ordering::SeqCst);
        Ok(json!({ "success": accepted }))
    }

    async fn renew(&self, _access_token: &str, refresh_token: &str) -> Result<Value, IdentityError> {
        let n = self.renew_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.renewed_with.lock().unwrap().push(refresh_token.to_string());
        self.renew_gate.pass().await;

        if self.fail_renewal.load(Ordering::SeqCst) {
            return Err(IdentityError::Rejected { status: 401 });
        }
        let access = format!("access-{}", n);
        if self.honor_renewed.load(Ordering::SeqCst) {
            self.authority.issue(&access);
        }
        Ok(json!({
            "accessToken": access,
            "refreshToken": format!("refresh-{}", n),
            "expiresIn": self.renew_expires_in.load(Ordering::SeqCst),
        }))
    }
}

/// One request as the mock API saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub url: String,
    pub token: Option<String>,
}

/// Mock API. Answers 200 with `{url, token}` for valid tokens and 401
/// otherwise. URLs ending in `/missing` answer 404; URLs ending in `/slow`
/// wait on `slow_gate` before checking the token.
pub struct MockTransport {
    authority: Arc<TokenAuthority>,
    sent: Mutex<Vec<Sent>>,
    pub fail_network: AtomicBool,
    pub slow_gate: Gate,
}

impl MockTransport {
    pub fn new(authority: Arc<TokenAuthority>) -> Self {
        Self {
            authority,
            sent: Mutex::new(Vec::new()),
            fail_network: AtomicBool::new(false),
            slow_gate: Gate::new(),
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// URLs sent with `token`, in dispatch order
    pub fn urls_with(&self, token: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.token.as_deref() == Some(token))
            .map(|s| s.url)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: RequestDescriptor) -> Result<Response, TransportError> {
        let token = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        self.sent.lock().unwrap().push(Sent {
            url: request.url.clone(),
            token: token.clone(),
        });

        if self.fail_network.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        if request.url.ends_with("/slow") {
            self.slow_gate.pass().await;
        }

        let authorized = token.as_deref().map(|t| self.authority.is_valid(t)).unwrap_or(false);
        if !authorized {
            return Ok(Response::new(StatusCode::UNAUTHORIZED, json!("token expired")));
        }
        if request.url.ends_with("/missing") {
            return Ok(Response::new(StatusCode::NOT_FOUND, json!({"error": "no such item"})));
        }
        Ok(Response::new(
            StatusCode::OK,
            json!({ "url": request.url, "token": token, "body": request.body }),
        ))
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub authority: Arc<TokenAuthority>,
    pub identity: Arc<MockIdentity>,
    pub transport: Arc<MockTransport>,
    pub backend: Arc<MemoryBackend>,
    pub context: AuthContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Harness persisting into an existing backend, for restore tests
    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let authority = Arc::new(TokenAuthority::default());
        let identity = Arc::new(MockIdentity::new(Arc::clone(&authority)));
        let transport = Arc::new(MockTransport::new(Arc::clone(&authority)));
        let context = AuthContext::builder(identity.clone(), transport.clone())
            .storage(backend.clone())
            .clock(clock.clone())
            .settings(LifecycleSettings::default())
            .build();
        Self {
            clock,
            authority,
            identity,
            transport,
            backend,
            context,
        }
    }

    pub async fn logged_in() -> Self {
        let harness = Self::new();
        harness.login().await;
        harness
    }

    pub async fn login(&self) -> SessionSnapshot {
        self.context
            .login(&LoginCredentials::new("ada", PASSWORD))
            .await
            .unwrap()
    }

    pub fn url(path: &str) -> String {
        format!("{}/{}", API, path.trim_start_matches('/'))
    }

    /// Record every published snapshot
    pub fn record(&self) -> (Arc<Mutex<Vec<SessionSnapshot>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = self
            .context
            .subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.clone()));
        (seen, subscription)
    }
}

/// Yield to other tasks until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Like [`wait_until`] for multi-thread runtimes, where the tasks being
/// waited on run on other workers
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Give spawned tasks a chance to run
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}
