//! tokenwarden-core: client-side session keeper.
//!
//! Keeps an access/refresh token pair alive for an API client. Renewal is
//! single-flight, requests that hit a 401 while a renewal is running wait for
//! it and are replayed in order, and observers get a read-only session view.
//!
//! Start from [`AuthContext`]: build it once and hand clones around.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod tests;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "tokenwarden";

pub use api::{
    LoginCredentials, Registration, RequestCoordinator, RequestDescriptor, RequestError,
    ResourceClient, Response,
};
pub use auth::{
    AuthError, Credential, SessionChange, SessionPublisher, SessionSnapshot, Subscription,
    TokenManager,
};
pub use config::AuthConfig;
pub use context::{AuthContext, AuthContextBuilder};
