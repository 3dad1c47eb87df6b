// Brightspace client facade
// Composes token management, version fallback, the request engine and the
// paginator behind one object. Nothing here retries or authenticates on its own.

use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::{BrightspaceError, Result};
use crate::http_client::{ApiRequest, HttpEngine, MultipartUpload, RequestOutcome};
use crate::paginator::{self, PageOptions, PaginatedResult};
use crate::resolver::{build_path, ApiFamily, ApiVersionSet};

/// Outcome of a version-fallback request, with the version that answered
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedOutcome {
    pub version: String,
    pub outcome: RequestOutcome,
}

/// Binary download, base64-encoded so the payload stays text-safe
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub status: u16,
    pub data_b64: String,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
}

pub struct BrightspaceClient {
    engine: HttpEngine,
    versions: ApiVersionSet,
}

impl BrightspaceClient {
    /// Build the token manager and engine described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let token_manager = Arc::new(TokenManager::new(
            config.credentials.clone(),
            config.http_request_timeout,
            config.token_expiry_margin,
        )?);

        let engine = HttpEngine::new(
            token_manager,
            &config.credentials.base_url,
            config.http_connect_timeout,
            config.http_request_timeout,
            config.retry.clone(),
        )?;

        Ok(Self::from_parts(engine, config.versions.clone()))
    }

    pub fn from_parts(engine: HttpEngine, versions: ApiVersionSet) -> Self {
        Self { engine, versions }
    }

    pub fn engine(&self) -> &HttpEngine {
        &self.engine
    }

    pub fn versions(&self) -> &ApiVersionSet {
        &self.versions
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        self.engine.token_manager()
    }

    /// `/d2l/api/{family}/{version}{tail}` using the family default when no version is given
    pub fn build_path(&self, family: ApiFamily, tail: &str, version: Option<&str>) -> String {
        build_path(family, &self.versions.resolve(family, version), tail)
    }

    /// Generic call for any API path (`/d2l/api/...`)
    pub async fn request(&self, req: &ApiRequest) -> Result<RequestOutcome> {
        self.engine.request(req).await
    }

    /// Call `req.path` (a tail such as `/users/whoami`) under each candidate
    /// version of `family` until one does not answer 404/410
    pub async fn request_versioned(
        &self,
        family: ApiFamily,
        req: &ApiRequest,
        preferred: Option<&str>,
    ) -> Result<VersionedOutcome> {
        let mut walk = self.versions.fallback(family, preferred);
        let mut last: Option<(u16, Value)> = None;

        while let Some(version) = walk.current().map(str::to_string) {
            let mut attempt = req.clone();
            attempt.path = build_path(family, &version, &req.path);

            match self.engine.request(&attempt).await {
                Ok(outcome) => {
                    walk.succeed();
                    return Ok(VersionedOutcome { version, outcome });
                }
                Err(BrightspaceError::NotFound { status, body, .. }) => {
                    tracing::debug!(
                        family = %family,
                        version = %version,
                        status,
                        "Version not available for this endpoint, trying next"
                    );
                    last = Some((status, body));
                    walk.advance();
                }
                Err(e) => return Err(e),
            }
        }

        let (status, body) = last.unwrap_or((404, Value::Null));
        Err(BrightspaceError::NotFound {
            status,
            body,
            versions_tried: walk.tried().to_vec(),
        })
    }

    /// Learning Platform call with version fallback
    pub async fn lp(&self, req: &ApiRequest) -> Result<VersionedOutcome> {
        self.request_versioned(ApiFamily::Lp, req, None).await
    }

    /// Learning Environment call with version fallback
    pub async fn le(&self, req: &ApiRequest) -> Result<VersionedOutcome> {
        self.request_versioned(ApiFamily::Le, req, None).await
    }

    /// Lazy record stream following bookmarks from `req`
    pub fn paginate(
        &self,
        req: ApiRequest,
        options: PageOptions,
    ) -> impl Stream<Item = Result<Value>> + '_ {
        paginator::paginate(&self.engine, req, options)
    }

    /// Follow bookmarks to the end (or the page limit) and merge the items
    pub async fn paginate_all(&self, req: ApiRequest, options: PageOptions) -> Result<PaginatedResult> {
        paginator::collect_pages(&self.engine, req, options).await
    }

    /// POST a multipart form to `path`
    pub async fn upload_multipart(
        &self,
        path: &str,
        upload: MultipartUpload,
        headers: &[(String, String)],
    ) -> Result<RequestOutcome> {
        let mut req = ApiRequest::post(path).multipart(upload);
        req.headers.extend_from_slice(headers);
        self.engine.request(&req).await
    }

    /// GET `path` and return the body base64-encoded whatever its type
    pub async fn download(&self, path: &str, params: &[(String, String)]) -> Result<DownloadedFile> {
        let mut req = ApiRequest::get(path).binary();
        req.params.extend_from_slice(params);

        let outcome = self.engine.request(&req).await?;
        let data_b64 = match outcome.body {
            Value::String(s) => s,
            other => {
                return Err(BrightspaceError::Malformed(format!(
                    "binary download produced non-string body: {}",
                    other
                )))
            }
        };

        Ok(DownloadedFile {
            status: outcome.status,
            content_type: outcome.headers.get("content-type").cloned(),
            data_b64,
            headers: outcome.headers,
        })
    }
}
