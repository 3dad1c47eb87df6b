// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;

/// OAuth2 client credentials for one Brightspace tenant
///
/// Everything but `refresh_token` is fixed after construction. The refresh
/// token is replaced when the authorization server rotates it.
#[derive(Clone)]
pub struct Credentials {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,

    /// Explicit token endpoint; disables endpoint discovery when set
    pub token_url: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// Short-lived bearer credential, held in memory only
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// True once `now + margin` has reached the stated expiry
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &format_args!("<{} chars>", self.value.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of one successful token exchange
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
    pub endpoint: String,
}

/// OAuth2 token endpoint response
///
/// `access_token` is optional here so a 200 without it can be reported as
/// an auth failure with the body attached instead of a decode error.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_margin() {
        let token = AccessToken {
            value: "abc".to_string(),
            expires_at: Utc::now() + Duration::seconds(20),
        };
        assert!(!token.is_expired(Duration::zero()));
        assert!(token.is_expired(Duration::seconds(30)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            base_url: "https://school.example".to_string(),
            client_id: "id".to_string(),
            client_secret: "super-secret".to_string(),
            refresh_token: "rt-secret".to_string(),
            token_url: None,
        };
        let out = format!("{:?}", creds);
        assert!(!out.contains("super-secret"));
        assert!(!out.contains("rt-secret"));

        let token = AccessToken {
            value: "bearer-secret".to_string(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{:?}", token).contains("bearer-secret"));
        assert_eq!(token.bearer(), "Bearer bearer-secret");
    }
}
