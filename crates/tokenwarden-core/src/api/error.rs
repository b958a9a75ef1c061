use reqwest::StatusCode;
use thiserror::Error;

use super::transport::TransportError;
use crate::auth::AuthError;
use crate::utils::truncate_string;

#[derive(Error, Debug, Clone)]
pub enum RequestError {
    /// Malformed request; nothing was sent
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    /// The session could not be recovered. The session has been ended.
    #[error("Authentication failed")]
    Authentication(#[source] AuthError),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RequestError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = truncate_string(body, MAX_ERROR_BODY_LENGTH);
        match status.as_u16() {
            401 => RequestError::Authentication(AuthError::AuthenticationFailed),
            403 => RequestError::AccessDenied(truncated),
            404 => RequestError::NotFound(truncated),
            429 => RequestError::RateLimited,
            500..=599 => RequestError::ServerError(truncated),
            _ => RequestError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, RequestError::Authentication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_maps_common_codes() {
        assert!(matches!(
            RequestError::from_status(StatusCode::FORBIDDEN, "no"),
            RequestError::AccessDenied(_)
        ));
        assert!(matches!(
            RequestError::from_status(StatusCode::NOT_FOUND, "gone"),
            RequestError::NotFound(_)
        ));
        assert!(matches!(
            RequestError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RequestError::RateLimited
        ));
        assert!(matches!(
            RequestError::from_status(StatusCode::BAD_GATEWAY, ""),
            RequestError::ServerError(_)
        ));
        assert!(RequestError::from_status(StatusCode::UNAUTHORIZED, "").is_authentication());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(2000);
        match RequestError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            RequestError::ServerError(msg) => {
                assert!(msg.len() <= MAX_ERROR_BODY_LENGTH);
                assert!(msg.ends_with("..."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_authentication_error_message() {
        let err = RequestError::Authentication(AuthError::RefreshFailed("rejected".into()));
        assert_eq!(err.to_string(), "Authentication failed");
    }
}
