//! Identity endpoints: login, registration and token renewal.
//!
//! Responses are returned as raw JSON; the token manager validates them into
//! a `TokenGrant` before anything is installed.

use std::fmt;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use super::transport::TransportError;
use crate::auth::AuthError;
use crate::config::IdentityEndpoints;
use crate::utils::truncate_string;

/// Maximum length of an identity error body kept for debug logs
const MAX_LOGGED_BODY_LENGTH: usize = 200;

/// Login payload. Fields the service needs beyond username/password go in
/// `extra` and are sent alongside them.
#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            extra: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.username.trim().is_empty() {
            return Err(AuthError::Validation("username is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(AuthError::Validation("password is required".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Registration payload
#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub password: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Registration {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            password: password.into(),
            extra: Map::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.username.trim().is_empty() {
            return Err(AuthError::Validation("username is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(AuthError::Validation("password is required".to_string()));
        }
        if let Some(ref email) = self.email {
            if !email.contains('@') {
                return Err(AuthError::Validation("email address is malformed".to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Failure talking to the identity service. Carries status codes only;
/// response bodies are never passed on to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("request rejected (status {status})")]
    Rejected { status: u16 },

    #[error("identity service unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `{accessToken, refreshToken, expiresIn, user}`
    async fn login(&self, credentials: &LoginCredentials) -> Result<Value, IdentityError>;

    /// `{success}`
    async fn register(&self, registration: &Registration) -> Result<Value, IdentityError>;

    /// `{accessToken, refreshToken?, expiresIn}`
    async fn renew(&self, access_token: &str, refresh_token: &str) -> Result<Value, IdentityError>;
}

/// Identity endpoints over HTTP/JSON.
#[derive(Clone)]
pub struct HttpIdentityClient {
    client: Client,
    endpoints: IdentityEndpoints,
}

impl HttpIdentityClient {
    pub fn new(client: Client, endpoints: IdentityEndpoints) -> Self {
        Self { client, endpoints }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoints.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, IdentityError> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        let text = response.text().await.map_err(TransportError::from)?;

        if !status.is_success() {
            debug!(
                url = %url,
                status = status.as_u16(),
                body = %truncate_string(&text, MAX_LOGGED_BODY_LENGTH),
                "Identity request failed"
            );
            let status = status.as_u16();
            return Err(if status >= 500 {
                IdentityError::Unavailable { status }
            } else {
                IdentityError::Rejected { status }
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| IdentityError::InvalidResponse(format!("response from {} is not JSON: {}", path, e)))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityClient {
    async fn login(&self, credentials: &LoginCredentials) -> Result<Value, IdentityError> {
        self.post_json(&self.endpoints.login_path, credentials).await
    }

    async fn register(&self, registration: &Registration) -> Result<Value, IdentityError> {
        self.post_json(&self.endpoints.register_path, registration).await
    }

    async fn renew(&self, access_token: &str, refresh_token: &str) -> Result<Value, IdentityError> {
        let body = json!({
            "accessToken": access_token,
            "refreshToken": refresh_token,
        });
        self.post_json(&self.endpoints.refresh_path, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_credentials_validation() {
        assert!(LoginCredentials::new("ada", "pw").validate().is_ok());
        assert!(matches!(
            LoginCredentials::new(" ", "pw").validate(),
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            LoginCredentials::new("ada", "").validate(),
            Err(AuthError::Validation(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = LoginCredentials::new("ada", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
        let reg = Registration::new("ada", "hunter2");
        assert!(!format!("{:?}", reg).contains("hunter2"));
    }

    #[test]
    fn test_login_payload_flattens_extra_fields() {
        let mut creds = LoginCredentials::new("ada", "pw");
        creds.extra.insert("tenant".to_string(), json!("north"));
        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(value, json!({"username": "ada", "password": "pw", "tenant": "north"}));
    }

    #[test]
    fn test_registration_email_check() {
        assert!(Registration::new("ada", "pw")
            .with_email("ada@example.com")
            .validate()
            .is_ok());
        assert!(Registration::new("ada", "pw")
            .with_email("nope")
            .validate()
            .is_err());
    }

    #[test]
    fn test_url_joining() {
        let client = HttpIdentityClient::new(
            Client::new(),
            IdentityEndpoints {
                base_url: "https://id.example.com/api/".to_string(),
                ..IdentityEndpoints::default()
            },
        );
        assert_eq!(client.url("/auth/login"), "https://id.example.com/api/auth/login");
    }
}
