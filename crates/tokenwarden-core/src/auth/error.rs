use thiserror::Error;

use crate::api::TransportError;

/// Errors from the token lifecycle (login, registration, renewal).
///
/// Clone because one renewal outcome is shared by every caller that joined
/// the same refresh flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Malformed input or response payload. No network call was made for input errors.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Registration was not accepted")]
    RegistrationRejected,

    /// Identity service answered with a server-side failure
    #[error("Identity service unavailable (status {0})")]
    ServiceUnavailable(u16),

    /// No usable session, or the session was rejected after a refresh
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The renewal endpoint rejected or could not be reached; the session was ended
    #[error("Authentication failed: session renewal failed ({0})")]
    RefreshFailed(String),

    /// The session was ended while a renewal was in flight
    #[error("Authentication failed: session ended during renewal")]
    SessionEnded,
}

impl AuthError {
    /// True for failures that end the session (authentication and its
    /// refresh specialization)
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            AuthError::AuthenticationFailed | AuthError::RefreshFailed(_) | AuthError::SessionEnded
        )
    }
}
