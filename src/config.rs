use anyhow::{Context, Result};
use clap::Args;

use crate::auth::{Credentials, DEFAULT_EXPIRY_MARGIN};
use crate::http_client::RetryPolicy;
use crate::resolver::{
    parse_candidates, ApiVersionSet, FamilyVersions, DEFAULT_LE_VERSION, DEFAULT_LP_VERSION,
};

/// Connection settings, from CLI flags or environment
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Base URL of the Brightspace instance
    #[arg(long, env = "BS_BASE_URL")]
    pub base_url: String,

    /// OAuth2 client ID
    #[arg(long, env = "BS_CLIENT_ID")]
    pub client_id: String,

    /// OAuth2 client secret
    #[arg(long, env = "BS_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Long-lived OAuth2 refresh token
    #[arg(long, env = "BS_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: String,

    /// Explicit token endpoint (skips endpoint discovery)
    #[arg(long, env = "BS_TOKEN_URL")]
    pub token_url: Option<String>,

    /// Learning Platform API version
    #[arg(long, env = "BS_LP_VERSION", default_value = DEFAULT_LP_VERSION)]
    pub lp_version: String,

    /// Learning Environment API version
    #[arg(long, env = "BS_LE_VERSION", default_value = DEFAULT_LE_VERSION)]
    pub le_version: String,

    /// Comma-separated LP fallback versions
    #[arg(long, env = "BS_LP_VERSION_CANDIDATES")]
    pub lp_version_candidates: Option<String>,

    /// Comma-separated LE fallback versions
    #[arg(long, env = "BS_LE_VERSION_CANDIDATES")]
    pub le_version_candidates: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Retries after network failures
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    /// Retries after 429 responses
    #[arg(long, env = "RATE_LIMIT_MAX_RETRIES", default_value = "3")]
    pub rate_limit_retries: u32,

    /// Seconds before expiry at which a token is considered stale
    #[arg(long, env = "TOKEN_EXPIRY_MARGIN", default_value = "30")]
    pub token_expiry_margin: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub credentials: Credentials,
    pub versions: ApiVersionSet,
    pub retry: RetryPolicy,

    // Timeouts (seconds)
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,
    pub token_expiry_margin: i64,

    pub log_level: String,
}

impl Config {
    /// Config with default versions, timeouts and retry budget
    pub fn for_tenant(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<Self> {
        Ok(Config {
            credentials: Credentials {
                base_url: normalize_base_url(base_url)?,
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
                refresh_token: refresh_token.to_string(),
                token_url: None,
            },
            versions: ApiVersionSet::default(),
            retry: RetryPolicy::default(),
            http_request_timeout: 30,
            http_connect_timeout: 10,
            token_expiry_margin: DEFAULT_EXPIRY_MARGIN,
            log_level: "info".to_string(),
        })
    }

    /// Validate settings and build the runtime configuration
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let base_url = normalize_base_url(&settings.base_url)?;

        let token_url = match settings.token_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                validate_http_url(url).context("BS_TOKEN_URL is invalid")?;
                Some(url.to_string())
            }
            _ => None,
        };

        let lp = FamilyVersions::new(
            settings.lp_version,
            settings
                .lp_version_candidates
                .as_deref()
                .map(parse_candidates)
                .unwrap_or_default(),
        )
        .context("BS_LP_VERSION is invalid")?;

        let le = FamilyVersions::new(
            settings.le_version,
            settings
                .le_version_candidates
                .as_deref()
                .map(parse_candidates)
                .unwrap_or_default(),
        )
        .context("BS_LE_VERSION is invalid")?;

        for (name, value) in [
            ("BS_CLIENT_ID", &settings.client_id),
            ("BS_CLIENT_SECRET", &settings.client_secret),
            ("BS_REFRESH_TOKEN", &settings.refresh_token),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        Ok(Config {
            credentials: Credentials {
                base_url,
                client_id: settings.client_id,
                client_secret: settings.client_secret,
                refresh_token: settings.refresh_token,
                token_url,
            },
            versions: ApiVersionSet { lp, le },
            retry: RetryPolicy {
                max_network_retries: settings.http_retries,
                max_rate_limit_retries: settings.rate_limit_retries,
                ..RetryPolicy::default()
            },
            http_request_timeout: settings.http_timeout,
            http_connect_timeout: settings.connect_timeout,
            token_expiry_margin: settings.token_expiry_margin,
            log_level: settings.log_level,
        })
    }
}

fn validate_http_url(s: &str) -> Result<url::Url> {
    let url = url::Url::parse(s).with_context(|| format!("not a valid URL: {}", s))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("URL must use http or https: {}", s);
    }
    Ok(url)
}

/// Validate the base URL and strip any trailing slash
fn normalize_base_url(s: &str) -> Result<String> {
    validate_http_url(s.trim()).context("BS_BASE_URL is invalid")?;
    Ok(s.trim().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            base_url: "https://school.example/".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "rt".to_string(),
            token_url: None,
            lp_version: DEFAULT_LP_VERSION.to_string(),
            le_version: DEFAULT_LE_VERSION.to_string(),
            lp_version_candidates: None,
            le_version_candidates: None,
            http_timeout: 30,
            connect_timeout: 10,
            http_retries: 3,
            rate_limit_retries: 3,
            token_expiry_margin: 30,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let config = Config::from_settings(settings()).unwrap();
        assert_eq!(config.credentials.base_url, "https://school.example");
        assert_eq!(config.credentials.token_url, None);
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let mut s = settings();
        s.base_url = "school.example".to_string();
        assert!(Config::from_settings(s).is_err());

        let mut s = settings();
        s.base_url = "ftp://school.example".to_string();
        assert!(Config::from_settings(s).is_err());
    }

    #[test]
    fn test_candidate_overrides() {
        let mut s = settings();
        s.lp_version_candidates = Some("1.46, 1.44,".to_string());
        s.le_version = "1.80".to_string();
        s.le_version_candidates = Some("1.74".to_string());
        let config = Config::from_settings(s).unwrap();

        assert_eq!(config.versions.lp.ordered(None), vec!["1.46", "1.44"]);
        assert_eq!(config.versions.le.ordered(None), vec!["1.80", "1.74"]);
    }

    #[test]
    fn test_blank_token_url_ignored() {
        let mut s = settings();
        s.token_url = Some("  ".to_string());
        assert_eq!(Config::from_settings(s).unwrap().credentials.token_url, None);

        let mut s = settings();
        s.token_url = Some("not a url".to_string());
        assert!(Config::from_settings(s).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut s = settings();
        s.client_secret = " ".to_string();
        assert!(Config::from_settings(s).is_err());
    }

    #[test]
    fn test_retry_settings_applied() {
        let mut s = settings();
        s.http_retries = 5;
        s.rate_limit_retries = 1;
        let config = Config::from_settings(s).unwrap();
        assert_eq!(config.retry.max_network_retries, 5);
        assert_eq!(config.retry.max_rate_limit_retries, 1);
        assert_eq!(config.http_request_timeout, 30);
    }

    #[test]
    fn test_for_tenant_defaults() {
        let config = Config::for_tenant("http://127.0.0.1:8080/", "id", "secret", "rt").unwrap();
        assert_eq!(config.credentials.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.versions, ApiVersionSet::default());
    }
}
