use chrono::Duration;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use super::refresh;
use super::types::{AccessToken, Credentials};
use crate::error::{BrightspaceError, Result};

/// Default safety margin before the stated token expiry (seconds)
pub const DEFAULT_EXPIRY_MARGIN: i64 = 30;

/// Token manager
/// Owns the refresh token and the cached access token. Refreshes are
/// single-flight: callers that find the token stale while a refresh is running
/// wait on the refresh lock and then reuse its result.
pub struct TokenManager {
    /// Credentials; only `refresh_token` ever changes (rotation)
    credentials: RwLock<Credentials>,

    /// Current access token
    access_token: RwLock<Option<AccessToken>>,

    /// Held for the whole duration of a refresh. Guards the token endpoint
    /// that last succeeded.
    refresh_lock: Mutex<Option<String>>,

    /// HTTP client for token requests
    client: Client,

    /// Treat tokens as expired this long before `expires_at`
    expiry_margin: Duration,

    /// Successful token exchanges performed by this manager
    refresh_count: AtomicU64,
}

impl TokenManager {
    /// Create a token manager with no cached access token
    pub fn new(credentials: Credentials, timeout_secs: u64, expiry_margin_secs: i64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BrightspaceError::Config(format!("failed to create HTTP client: {}", e)))?;

        tracing::debug!(credentials = ?credentials, "Token manager created");

        Ok(Self {
            credentials: RwLock::new(credentials),
            access_token: RwLock::new(None),
            refresh_lock: Mutex::new(None),
            client,
            expiry_margin: Duration::seconds(expiry_margin_secs),
            refresh_count: AtomicU64::new(0),
        })
    }

    /// Seed the cache with an access token obtained elsewhere (e.g. a launcher's cache)
    pub fn with_cached_token(self, token: AccessToken) -> Self {
        Self {
            access_token: RwLock::new(Some(token)),
            ..self
        }
    }

    /// Cached token if it is present and outside the expiry margin
    async fn current_valid(&self) -> Option<AccessToken> {
        let token = self.access_token.read().await;
        token
            .as_ref()
            .filter(|t| !t.is_expired(self.expiry_margin))
            .cloned()
    }

    /// Exchange the refresh token. Caller must hold `refresh_lock`.
    async fn refresh_locked(&self, endpoint: &mut Option<String>) -> Result<AccessToken> {
        let creds = self.credentials.read().await.clone();
        let data = refresh::refresh_with_discovery(&self.client, &creds, endpoint.as_deref()).await?;

        self.refresh_count.fetch_add(1, Ordering::SeqCst);

        if let Some(rotated) = data.refresh_token {
            tracing::info!("Authorization server rotated the refresh token");
            self.credentials.write().await.refresh_token = rotated;
        }

        *endpoint = Some(data.endpoint);
        *self.access_token.write().await = Some(data.access_token.clone());

        Ok(data.access_token)
    }

    /// Get a non-expired access token, refreshing if the cached one is absent or stale
    pub async fn get_valid_access_token(&self) -> Result<AccessToken> {
        if let Some(token) = self.current_valid().await {
            return Ok(token);
        }

        let mut endpoint = self.refresh_lock.lock().await;

        // Someone else may have refreshed while we waited for the lock
        if let Some(token) = self.current_valid().await {
            return Ok(token);
        }

        tracing::debug!("Access token absent or expiring, refreshing");
        self.refresh_locked(&mut endpoint).await
    }

    /// Unconditionally exchange the refresh token for a new access token
    pub async fn force_refresh(&self) -> Result<AccessToken> {
        let mut endpoint = self.refresh_lock.lock().await;
        self.refresh_locked(&mut endpoint).await
    }

    /// Refresh after the API rejected `rejected` with a 401
    ///
    /// If another caller already replaced that token while we waited for the
    /// lock, the replacement is returned instead of refreshing again.
    pub async fn refresh_after_rejection(&self, rejected: &AccessToken) -> Result<AccessToken> {
        let mut endpoint = self.refresh_lock.lock().await;

        if let Some(token) = self.current_valid().await {
            if token.value != rejected.value {
                tracing::debug!("Token already replaced by a concurrent refresh");
                return Ok(token);
            }
        }

        tracing::warn!("Access token rejected with 401, forcing refresh");
        self.refresh_locked(&mut endpoint).await
    }

    /// Number of successful token exchanges so far
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Current refresh token, including any rotation received this process
    pub async fn refresh_token(&self) -> String {
        self.credentials.read().await.refresh_token.clone()
    }

    /// Token endpoint that last produced a token, if any
    pub async fn token_endpoint(&self) -> Option<String> {
        self.refresh_lock.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn creds() -> Credentials {
        Credentials {
            base_url: "http://127.0.0.1:1".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "rt".to_string(),
            token_url: None,
        }
    }

    #[tokio::test]
    async fn test_cached_token_is_returned_without_refresh() {
        let manager = TokenManager::new(creds(), 5, DEFAULT_EXPIRY_MARGIN)
            .unwrap()
            .with_cached_token(AccessToken {
                value: "cached".to_string(),
                expires_at: Utc::now() + Duration::seconds(600),
            });

        let token = manager.get_valid_access_token().await.unwrap();
        assert_eq!(token.value, "cached");
        assert_eq!(manager.refresh_count(), 0);
    }

    #[test]
    fn test_new_manager_has_no_token_or_endpoint() {
        let manager = TokenManager::new(creds(), 5, DEFAULT_EXPIRY_MARGIN).unwrap();

        tokio_test::block_on(async {
            assert!(manager.current_valid().await.is_none());
            assert!(manager.token_endpoint().await.is_none());
            assert_eq!(manager.refresh_token().await, "rt");
        });
        assert_eq!(manager.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_stale() {
        let manager = TokenManager::new(creds(), 5, DEFAULT_EXPIRY_MARGIN)
            .unwrap()
            .with_cached_token(AccessToken {
                value: "cached".to_string(),
                expires_at: Utc::now() + Duration::seconds(10),
            });

        assert!(manager.current_valid().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_state() {
        // Nothing listens on port 1, so every endpoint fails
        let manager = TokenManager::new(
            Credentials {
                token_url: Some("http://127.0.0.1:1/token".to_string()),
                ..creds()
            },
            5,
            DEFAULT_EXPIRY_MARGIN,
        )
        .unwrap();

        let err = manager.get_valid_access_token().await.unwrap_err();
        assert!(matches!(err, BrightspaceError::Auth { .. }));
        assert_eq!(manager.refresh_count(), 0);
        assert_eq!(manager.refresh_token().await, "rt");
        assert!(manager.token_endpoint().await.is_none());
    }
}
