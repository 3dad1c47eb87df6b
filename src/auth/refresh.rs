// Token exchange and token endpoint discovery

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde_json::Value;

use super::types::{AccessToken, Credentials, TokenData, TokenResponse};
use crate::error::{BrightspaceError, Result};

/// Brightspace global auth service, tried after the tenant-local endpoints
pub const GLOBAL_TOKEN_URL: &str = "https://auth.brightspace.com/core/connect/token";

/// Lifetime assumed when the server omits `expires_in`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Longest lifetime we accept from `expires_in`; larger values are clamped
const MAX_EXPIRES_IN: i64 = i32::MAX as i64;

/// Absolute expiry for a server-provided `expires_in`; negative values are invalid
fn token_expiry(expires_in: i64) -> Option<DateTime<Utc>> {
    if expires_in < 0 {
        return None;
    }
    let lifetime = Duration::try_seconds(expires_in.min(MAX_EXPIRES_IN))?;
    Utc::now().checked_add_signed(lifetime)
}

/// Outcome of a failed exchange against one endpoint
enum ExchangeFailure {
    /// Endpoint is wrong or unavailable, move on to the next candidate
    TryNext {
        reason: String,
        status: Option<u16>,
        body: Option<Value>,
    },
    /// Endpoint is real and rejected the grant; discovery stops here
    Rejected { status: u16, body: Value },
}

/// Ordered token endpoints to try for these credentials
///
/// An explicit override is used alone. Otherwise the endpoint that worked
/// last time goes first, followed by the tenant-local conventions and the
/// global issuer.
pub fn endpoint_candidates(creds: &Credentials, remembered: Option<&str>) -> Vec<String> {
    if let Some(ref url) = creds.token_url {
        return vec![url.clone()];
    }

    let base = creds.base_url.trim_end_matches('/');
    let mut candidates: Vec<String> = Vec::with_capacity(4);
    if let Some(url) = remembered {
        candidates.push(url.to_string());
    }
    for url in [
        format!("{}/d2l/oauth2/token", base),
        format!("{}/d2l/auth/api/token", base),
        GLOBAL_TOKEN_URL.to_string(),
    ] {
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }
    candidates
}

/// Parse a body as JSON, falling back to the raw text
fn parse_body(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Perform a refresh-token grant against a single endpoint
async fn exchange(
    client: &Client,
    url: &str,
    creds: &Credentials,
) -> std::result::Result<TokenData, ExchangeFailure> {
    tracing::debug!(
        url = %url,
        client_id = %creds.client_id,
        "Sending refresh_token grant"
    );

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", creds.client_id.as_str()),
        ("client_secret", creds.client_secret.as_str()),
        ("refresh_token", creds.refresh_token.as_str()),
    ];

    let response = match client.post(url).form(&form).send().await {
        Ok(r) => r,
        Err(e) => {
            return Err(ExchangeFailure::TryNext {
                reason: format!("request error at {}: {}", url, e),
                status: None,
                body: None,
            })
        }
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(t) => t,
        Err(e) => {
            return Err(ExchangeFailure::TryNext {
                reason: format!("{} at {}: failed to read body: {}", status, url, e),
                status: Some(status.as_u16()),
                body: None,
            })
        }
    };
    let body = parse_body(text);

    if status.is_success() {
        let data: TokenResponse = match serde_json::from_value(body.clone()) {
            Ok(d) => d,
            Err(_) => {
                return Err(ExchangeFailure::TryNext {
                    reason: format!("{} at {}: unparseable token response", status, url),
                    status: Some(status.as_u16()),
                    body: Some(body),
                })
            }
        };

        let Some(access_token) = data.access_token.filter(|t| !t.is_empty()) else {
            return Err(ExchangeFailure::TryNext {
                reason: format!("{} at {}: response does not contain access_token", status, url),
                status: Some(status.as_u16()),
                body: Some(body),
            });
        };

        let expires_in = data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        let Some(expires_at) = token_expiry(expires_in) else {
            return Err(ExchangeFailure::TryNext {
                reason: format!("{} at {}: invalid expires_in {}", status, url, expires_in),
                status: Some(status.as_u16()),
                body: Some(body),
            });
        };

        return Ok(TokenData {
            access_token: AccessToken {
                value: access_token,
                expires_at,
            },
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
            endpoint: url.to_string(),
        });
    }

    // 400 is invalid_grant / invalid_client from an endpoint that exists
    if status.as_u16() == 400 {
        if let (Some(code), Some(desc)) = (
            body.get("error").and_then(|v| v.as_str()),
            body.get("error_description").and_then(|v| v.as_str()),
        ) {
            tracing::error!(error = code, description = desc, "Token endpoint rejected grant");
        }
        return Err(ExchangeFailure::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    Err(ExchangeFailure::TryNext {
        reason: format!("{} at {}", status, url),
        status: Some(status.as_u16()),
        body: Some(body),
    })
}

/// Exchange the refresh token, walking the endpoint candidates in order
///
/// The first endpoint to return a usable token wins and is reported back in
/// `TokenData::endpoint` so the caller can remember it.
pub async fn refresh_with_discovery(
    client: &Client,
    creds: &Credentials,
    remembered: Option<&str>,
) -> Result<TokenData> {
    let candidates = endpoint_candidates(creds, remembered);
    let mut last: Option<(String, Option<u16>, Option<Value>)> = None;

    for url in &candidates {
        match exchange(client, url, creds).await {
            Ok(data) => {
                tracing::info!(
                    endpoint = %data.endpoint,
                    expires_at = %data.access_token.expires_at.to_rfc3339(),
                    rotated = data.refresh_token.is_some(),
                    "Access token refreshed"
                );
                return Ok(data);
            }
            Err(ExchangeFailure::Rejected { status, body }) => {
                tracing::error!(status, url = %url, body = %body, "Token refresh rejected");
                return Err(BrightspaceError::Auth {
                    message: format!("token refresh rejected with {} at {}", status, url),
                    status: Some(status),
                    body: Some(body),
                });
            }
            Err(ExchangeFailure::TryNext { reason, status, body }) => {
                tracing::warn!(reason = %reason, "Token endpoint unusable, trying next");
                last = Some((reason, status, body));
            }
        }
    }

    let (reason, status, body) =
        last.unwrap_or_else(|| ("no token endpoint candidates".to_string(), None, None));
    Err(BrightspaceError::Auth {
        message: format!(
            "failed to refresh token after trying {} endpoint(s); last error: {}",
            candidates.len(),
            reason
        ),
        status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(token_url: Option<&str>) -> Credentials {
        Credentials {
            base_url: "https://school.example/".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "rt".to_string(),
            token_url: token_url.map(str::to_string),
        }
    }

    #[test]
    fn test_endpoint_candidates_default_order() {
        assert_eq!(
            endpoint_candidates(&creds(None), None),
            vec![
                "https://school.example/d2l/oauth2/token".to_string(),
                "https://school.example/d2l/auth/api/token".to_string(),
                GLOBAL_TOKEN_URL.to_string(),
            ]
        );
    }

    #[test]
    fn test_endpoint_candidates_override_is_exclusive() {
        assert_eq!(
            endpoint_candidates(&creds(Some("https://idp.example/token")), Some("https://other")),
            vec!["https://idp.example/token".to_string()]
        );
    }

    #[test]
    fn test_endpoint_candidates_remembered_first_without_duplicates() {
        let remembered = "https://school.example/d2l/auth/api/token";
        let candidates = endpoint_candidates(&creds(None), Some(remembered));
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], remembered);
        assert_eq!(candidates[1], "https://school.example/d2l/oauth2/token");
    }

    #[test]
    fn test_token_expiry_bounds() {
        let now = Utc::now();
        let hour = token_expiry(3600).unwrap();
        assert!(hour >= now + Duration::seconds(3600));

        let clamped = token_expiry(i64::MAX).unwrap();
        assert!(clamped <= Utc::now() + Duration::seconds(MAX_EXPIRES_IN));

        assert_eq!(token_expiry(-1), None);
        assert!(token_expiry(0).is_some());
    }

    #[test]
    fn test_parse_body_falls_back_to_text() {
        assert_eq!(parse_body("{\"a\":1}".to_string()), serde_json::json!({"a": 1}));
        assert_eq!(
            parse_body("<html>".to_string()),
            Value::String("<html>".to_string())
        );
    }
}
