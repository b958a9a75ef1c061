//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `Credential` / `CredentialStore`: the token pair and its persistence
//! - `TokenManager`: login, registration, logout, single-flight renewal and
//!   the expiry monitor
//! - `SessionPublisher`: read-only session snapshots for observers
//!
//! Access tokens are renewed when they come within ten minutes of expiry; the
//! monitor checks every five minutes.

pub mod credentials;
pub mod error;
pub mod flight;
pub mod grant;
pub mod manager;
pub mod monitor;
pub mod session;

pub use credentials::{Credential, CredentialStore};
pub use error::AuthError;
pub use flight::RefreshFlight;
pub use grant::TokenGrant;
pub use manager::{AuthPhase, LifecycleSettings, TokenManager};
pub use monitor::ExpiryCheck;
pub use session::{Session, SessionChange, SessionPublisher, SessionSnapshot, Subscription, UserProfile};
