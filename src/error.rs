// Error handling module
// Typed error taxonomy for token exchange, request retry and pagination

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the Brightspace client core
#[derive(Error, Debug)]
pub enum BrightspaceError {
    /// Token exchange failed, or the API rejected a freshly refreshed token
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
        status: Option<u16>,
        body: Option<Value>,
    },

    /// 403 from the API
    #[error("Permission denied: {status} - {body}")]
    Permission { status: u16, body: Value },

    /// 404/410, either directly or after every version candidate was tried
    #[error("Not found: {status} - {body} (versions tried: {})", versions_tried.join(", "))]
    NotFound {
        status: u16,
        body: Value,
        versions_tried: Vec<String>,
    },

    /// 409 from the API
    #[error("Conflict: {body}")]
    Conflict { body: Value },

    /// 429 after the backoff budget was spent
    #[error("Rate limited after {attempts} attempts: {body}")]
    RateLimit {
        attempts: u32,
        retry_after: Option<u64>,
        body: Value,
    },

    /// Timeouts and connection failures after the retry budget was spent
    #[error("Network error after {attempts} attempts ({kind}): {message}")]
    Network {
        kind: &'static str,
        attempts: u32,
        message: String,
    },

    /// Response did not have the expected shape
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Any other non-2xx status
    #[error("Brightspace API error: {status} - {body}")]
    Api { status: u16, body: Value },

    /// Caller misuse detected before anything was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrightspaceError {
    /// Map a non-2xx status and its parsed body to the matching variant
    pub fn from_status(status: u16, body: Value) -> Self {
        match status {
            401 => BrightspaceError::Auth {
                message: "request rejected with 401 after token refresh".to_string(),
                status: Some(status),
                body: Some(body),
            },
            403 => BrightspaceError::Permission { status, body },
            404 | 410 => BrightspaceError::NotFound {
                status,
                body,
                versions_tried: Vec::new(),
            },
            409 => BrightspaceError::Conflict { body },
            429 => BrightspaceError::RateLimit {
                attempts: 1,
                retry_after: None,
                body,
            },
            _ => BrightspaceError::Api { status, body },
        }
    }

    /// HTTP status behind this error, if it came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            BrightspaceError::Auth { status, .. } => *status,
            BrightspaceError::Permission { status, .. }
            | BrightspaceError::NotFound { status, .. }
            | BrightspaceError::Api { status, .. } => Some(*status),
            BrightspaceError::Conflict { .. } => Some(409),
            BrightspaceError::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    /// Parsed response body behind this error, if any
    pub fn body(&self) -> Option<&Value> {
        match self {
            BrightspaceError::Auth { body, .. } => body.as_ref(),
            BrightspaceError::Permission { body, .. }
            | BrightspaceError::NotFound { body, .. }
            | BrightspaceError::Conflict { body }
            | BrightspaceError::RateLimit { body, .. }
            | BrightspaceError::Api { body, .. } => Some(body),
            _ => None,
        }
    }

    /// True for 404/410, which the version fallback treats as "try the next version"
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, BrightspaceError::NotFound { .. })
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, BrightspaceError>;
