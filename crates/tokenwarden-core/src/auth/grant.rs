//! Schema for token-bearing responses from the identity service.
//!
//! Login and renewal payloads arrive as loose JSON. They are decoded into a
//! [`TokenGrant`] and checked before a [`Credential`] is built, so missing or
//! mistyped fields surface as `AuthError::Validation` instead of leaking into
//! the session as empty strings.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::credentials::Credential;
use super::error::AuthError;
use super::session::UserProfile;

/// Token type used when the service does not name one
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Upper bound on a reported lifetime (one year); anything larger is treated
/// as a malformed payload.
pub(crate) const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGrant {
    #[serde(alias = "access_token")]
    access_token: Option<String>,
    #[serde(alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(alias = "token_type")]
    token_type: Option<String>,
    #[serde(alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(default)]
    user: Option<UserProfile>,
}

/// A validated token response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the service does not rotate refresh tokens on renewal
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Decode a login response. A refresh token is mandatory here.
    pub fn from_login(payload: Value) -> Result<(TokenGrant, Option<UserProfile>), AuthError> {
        let raw = Self::decode(payload)?;
        let user = raw.user.clone();
        let grant = Self::validate(raw)?;
        if grant.refresh_token.is_none() {
            return Err(AuthError::Validation(
                "login response is missing refreshToken".to_string(),
            ));
        }
        Ok((grant, user))
    }

    /// Decode a renewal response
    pub fn from_renewal(payload: Value) -> Result<TokenGrant, AuthError> {
        Self::validate(Self::decode(payload)?)
    }

    /// Build a credential issued at `now`. `previous_refresh` is used when the
    /// grant did not carry a new refresh token.
    pub fn into_credential(
        self,
        now: DateTime<Utc>,
        previous_refresh: Option<&str>,
    ) -> Result<Credential, AuthError> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| AuthError::Validation("no refresh token available".to_string()))?;

        Ok(Credential {
            access_token: self.access_token,
            refresh_token,
            token_type: self.token_type,
            issued_at: now,
            expires_at: self.expires_in.map(|secs| now + Duration::seconds(secs)),
        })
    }

    fn decode(payload: Value) -> Result<RawGrant, AuthError> {
        if !payload.is_object() {
            return Err(AuthError::Validation(
                "token response is not a JSON object".to_string(),
            ));
        }
        serde_json::from_value(payload)
            .map_err(|e| AuthError::Validation(format!("malformed token response: {}", e)))
    }

    fn validate(raw: RawGrant) -> Result<TokenGrant, AuthError> {
        let access_token = raw
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| AuthError::Validation("token response is missing accessToken".to_string()))?;

        let refresh_token = match raw.refresh_token {
            Some(token) if token.trim().is_empty() => {
                return Err(AuthError::Validation(
                    "token response has an empty refreshToken".to_string(),
                ))
            }
            other => other,
        };

        if let Some(secs) = raw.expires_in {
            if secs <= 0 || secs > MAX_EXPIRES_IN_SECS {
                return Err(AuthError::Validation(format!(
                    "expiresIn out of range: {}",
                    secs
                )));
            }
        }

        let token_type = raw
            .token_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        Ok(TokenGrant {
            access_token,
            refresh_token,
            token_type,
            expires_in: raw.expires_in,
        })
    }
}
