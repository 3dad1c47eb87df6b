// API version resolution and resource path construction

use std::fmt;
use std::str::FromStr;

use crate::error::{BrightspaceError, Result};

/// Default Learning Platform version
pub const DEFAULT_LP_VERSION: &str = "1.46";

/// Default Learning Environment version
pub const DEFAULT_LE_VERSION: &str = "1.74";

/// Independently versioned Brightspace sub-API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFamily {
    /// Learning Platform (`/d2l/api/lp/...`): users, courses, org structure
    Lp,
    /// Learning Environment (`/d2l/api/le/...`): news, content, grades, quizzes
    Le,
}

impl ApiFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFamily::Lp => "lp",
            ApiFamily::Le => "le",
        }
    }
}

impl fmt::Display for ApiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiFamily {
    type Err = BrightspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lp" => Ok(ApiFamily::Lp),
            "le" => Ok(ApiFamily::Le),
            other => Err(BrightspaceError::InvalidRequest(format!(
                "unknown API family: {}",
                other
            ))),
        }
    }
}

/// Parse a comma-separated candidate list, dropping blank entries
pub fn parse_candidates(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Default version plus ordered fallback candidates for one family
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyVersions {
    default: String,
    candidates: Vec<String>,
}

impl FamilyVersions {
    pub fn new(default: impl Into<String>, candidates: Vec<String>) -> Result<Self> {
        let default = default.into().trim().to_string();
        if default.is_empty() {
            return Err(BrightspaceError::Config(
                "default API version must not be empty".to_string(),
            ));
        }
        Ok(Self {
            default,
            candidates,
        })
    }

    pub fn default_version(&self) -> &str {
        &self.default
    }

    /// Versions to try, in order: preferred, default, then declared candidates.
    /// Never empty.
    pub fn ordered(&self, preferred: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.candidates.len() + 2);
        let head = preferred.map(str::trim).filter(|v| !v.is_empty());
        for v in head
            .into_iter()
            .chain(std::iter::once(self.default.as_str()))
            .chain(self.candidates.iter().map(String::as_str))
        {
            if !out.iter().any(|seen| seen == v) {
                out.push(v.to_string());
            }
        }
        out
    }
}

/// Version configuration for both families, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ApiVersionSet {
    pub lp: FamilyVersions,
    pub le: FamilyVersions,
}

impl Default for ApiVersionSet {
    fn default() -> Self {
        Self {
            lp: FamilyVersions {
                default: DEFAULT_LP_VERSION.to_string(),
                candidates: Vec::new(),
            },
            le: FamilyVersions {
                default: DEFAULT_LE_VERSION.to_string(),
                candidates: Vec::new(),
            },
        }
    }
}

impl ApiVersionSet {
    pub fn family(&self, family: ApiFamily) -> &FamilyVersions {
        match family {
            ApiFamily::Lp => &self.lp,
            ApiFamily::Le => &self.le,
        }
    }

    /// First version to splice into a path for `family`
    pub fn resolve(&self, family: ApiFamily, preferred: Option<&str>) -> String {
        match preferred.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None => self.family(family).default.clone(),
        }
    }

    /// Fresh fallback walk over the candidates for one logical operation
    pub fn fallback(&self, family: ApiFamily, preferred: Option<&str>) -> VersionFallback {
        VersionFallback::new(self.family(family).ordered(preferred))
    }
}

/// Where a version fallback walk currently stands
#[derive(Debug, Clone, PartialEq)]
pub enum VersionState {
    Trying(usize),
    Succeeded(String),
    Exhausted,
}

/// Walks an immutable candidate list, advancing on 404/410
///
/// Holds no knowledge across operations; different endpoints may support
/// different versions, so every operation starts a new walk.
#[derive(Debug, Clone)]
pub struct VersionFallback {
    candidates: Vec<String>,
    state: VersionState,
}

impl VersionFallback {
    pub fn new(candidates: Vec<String>) -> Self {
        let state = if candidates.is_empty() {
            VersionState::Exhausted
        } else {
            VersionState::Trying(0)
        };
        Self { candidates, state }
    }

    pub fn state(&self) -> &VersionState {
        &self.state
    }

    /// Version currently being tried
    pub fn current(&self) -> Option<&str> {
        match self.state {
            VersionState::Trying(i) => self.candidates.get(i).map(String::as_str),
            _ => None,
        }
    }

    /// Current candidate failed with a version mismatch; move to the next
    pub fn advance(&mut self) {
        if let VersionState::Trying(i) = self.state {
            self.state = if i + 1 < self.candidates.len() {
                VersionState::Trying(i + 1)
            } else {
                VersionState::Exhausted
            };
        }
    }

    /// Current candidate worked; returns it
    pub fn succeed(&mut self) -> Option<String> {
        let version = self.current()?.to_string();
        self.state = VersionState::Succeeded(version.clone());
        Some(version)
    }

    /// Candidates attempted so far, in order
    pub fn tried(&self) -> &[String] {
        match self.state {
            VersionState::Trying(i) => &self.candidates[..=i],
            VersionState::Succeeded(ref v) => {
                let end = self
                    .candidates
                    .iter()
                    .position(|c| c == v)
                    .map_or(self.candidates.len(), |i| i + 1);
                &self.candidates[..end]
            }
            VersionState::Exhausted => &self.candidates,
        }
    }
}

/// Versioned resource path: `/d2l/api/{family}/{version}{tail}`
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePath {
    pub family: ApiFamily,
    pub version: String,
    pub tail: String,
}

impl ResourcePath {
    pub fn new(family: ApiFamily, version: impl Into<String>, tail: &str) -> Self {
        let tail = if tail.starts_with('/') {
            tail.to_string()
        } else {
            format!("/{}", tail)
        };
        Self {
            family,
            version: version.into(),
            tail,
        }
    }

    /// Parse a path produced by `Display` back into its parts
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path.strip_prefix("/d2l/api/").ok_or_else(|| {
            BrightspaceError::InvalidRequest(format!("not a versioned API path: {}", path))
        })?;
        let mut parts = rest.splitn(3, '/');
        let family: ApiFamily = parts.next().unwrap_or_default().parse()?;
        let version = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BrightspaceError::InvalidRequest(format!("missing version: {}", path)))?;
        let tail = parts.next().unwrap_or_default();
        Ok(Self::new(family, version, tail))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/d2l/api/{}/{}{}", self.family, self.version, self.tail)
    }
}

/// Build `/d2l/api/{family}/{version}{tail}`
pub fn build_path(family: ApiFamily, version: &str, tail: &str) -> String {
    ResourcePath::new(family, version, tail).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(default: &str, candidates: &[&str]) -> FamilyVersions {
        FamilyVersions::new(default, candidates.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_build_path() {
        assert_eq!(build_path(ApiFamily::Lp, "1.46", "/users/whoami"), "/d2l/api/lp/1.46/users/whoami");
        assert_eq!(build_path(ApiFamily::Le, "1.74", "content/toc"), "/d2l/api/le/1.74/content/toc");
    }

    #[test]
    fn test_parse_candidates() {
        assert_eq!(parse_candidates("1.46, 1.44,,  "), vec!["1.46", "1.44"]);
        assert!(parse_candidates(" , ").is_empty());
    }

    #[test]
    fn test_ordered_dedups_and_keeps_order() {
        let v = versions("1.74", &["1.80", "1.74", "1.70"]);
        assert_eq!(v.ordered(None), vec!["1.74", "1.80", "1.70"]);
        assert_eq!(v.ordered(Some("1.70")), vec!["1.70", "1.74", "1.80"]);
        assert_eq!(v.ordered(Some("  ")), vec!["1.74", "1.80", "1.70"]);
    }

    #[test]
    fn test_empty_default_rejected() {
        assert!(FamilyVersions::new(" ", vec![]).is_err());
    }

    #[test]
    fn test_resolve_prefers_explicit_version() {
        let set = ApiVersionSet::default();
        assert_eq!(set.resolve(ApiFamily::Lp, None), DEFAULT_LP_VERSION);
        assert_eq!(set.resolve(ApiFamily::Le, Some("1.60")), "1.60");
    }

    #[test]
    fn test_fallback_state_machine() {
        let mut walk = VersionFallback::new(vec!["1.46".to_string(), "1.44".to_string()]);
        assert_eq!(walk.current(), Some("1.46"));
        assert_eq!(walk.tried(), ["1.46"]);

        walk.advance();
        assert_eq!(walk.state(), &VersionState::Trying(1));
        assert_eq!(walk.succeed().as_deref(), Some("1.44"));
        assert_eq!(walk.state(), &VersionState::Succeeded("1.44".to_string()));
        assert_eq!(walk.tried(), ["1.46", "1.44"]);
        assert_eq!(walk.current(), None);
    }

    #[test]
    fn test_fallback_exhausts() {
        let mut walk = VersionFallback::new(vec!["1.46".to_string()]);
        walk.advance();
        assert_eq!(walk.state(), &VersionState::Exhausted);
        assert_eq!(walk.current(), None);
        assert_eq!(walk.succeed(), None);
        assert_eq!(walk.tried(), ["1.46"]);
    }

    #[test]
    fn test_resource_path_parse() {
        let parsed = ResourcePath::parse("/d2l/api/le/1.74/123/news/").unwrap();
        assert_eq!(parsed, ResourcePath::new(ApiFamily::Le, "1.74", "/123/news/"));

        assert!(ResourcePath::parse("/d2l/api/xx/1.0/a").is_err());
        assert!(ResourcePath::parse("/d2l/api/lp/").is_err());
        assert!(ResourcePath::parse("/other").is_err());
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!("LP".parse::<ApiFamily>().unwrap(), ApiFamily::Lp);
        assert!("bogus".parse::<ApiFamily>().is_err());
    }
}
