use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Health path probed when a manifest does not declare one.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest {id} is invalid: {}", .problems.join("; "))]
    Invalid { id: String, problems: Vec<String> },

    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

// ── Image reference ───────────────────────────────────────────────────

/// Container image reference: `repository[:tag][@digest]`.
///
/// Accepts either the short string form or an explicit
/// `{repository, tag, digest}` object when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ImageRefRepr")]
pub struct ImageRef {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageRefRepr {
    Short(String),
    Full {
        repository: String,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        digest: Option<String>,
    },
}

impl TryFrom<ImageRefRepr> for ImageRef {
    type Error = String;

    fn try_from(repr: ImageRefRepr) -> Result<Self, Self::Error> {
        match repr {
            ImageRefRepr::Short(s) => s.parse(),
            ImageRefRepr::Full {
                repository,
                tag,
                digest,
            } => Ok(Self {
                repository,
                tag,
                digest,
            }),
        }
    }
}

impl ImageRef {
    /// Reference string handed to the container engine. A digest pins the
    /// image and takes precedence over the tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}@{}", self.repository, digest),
            (None, Some(tag)) => format!("{}:{}", self.repository, tag),
            (None, None) => format!("{}:latest", self.repository),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference())
    }
}

impl FromStr for ImageRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("image reference is empty".to_string());
        }
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (s, None),
        };
        // Only a ':' after the last '/' is a tag separator; earlier ones
        // belong to a registry host:port.
        let name_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match rest[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                (rest[..split].to_string(), Some(rest[split + 1..].to_string()))
            }
            None => (rest.to_string(), None),
        };
        if repository.is_empty() {
            return Err(format!("invalid image reference '{}'", s));
        }
        Ok(Self {
            repository,
            tag,
            digest,
        })
    }
}

// ── Endpoints ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(format!("Invalid HTTP method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

// ── Environment ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarDecl {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Secret values are never included in externally serialized views.
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Resources, dependencies, hooks, health ────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Memory limit such as `512m` or `1g`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU share in cores (e.g. `0.5`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
}

impl ResourceHints {
    /// Memory limit in bytes, or `None` if absent or unparsable.
    pub fn memory_bytes(&self) -> Option<i64> {
        let raw = self.memory.as_deref()?.trim().to_ascii_lowercase();
        let raw = raw.strip_suffix('b').unwrap_or(&raw);
        let (digits, multiplier) = match raw.chars().last()? {
            'k' => (&raw[..raw.len() - 1], 1024),
            'm' => (&raw[..raw.len() - 1], 1024 * 1024),
            'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
            _ => (raw, 1),
        };
        digits
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n > 0)
            .map(|n| n * multiplier)
    }

    /// CPU share expressed in the engine's nano-CPU unit.
    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu
            .filter(|c| *c > 0.0)
            .map(|c| (c * 1_000_000_000.0) as i64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Plugin,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Consecutive failures before the plugin is reported unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

// ── Manifest ──────────────────────────────────────────────────────────

/// Declarative description of a ForgeHook. Immutable per `id` + `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub image: ImageRef,
    /// Port the plugin listens on inside its container.
    pub port: u16,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub environment: Vec<EnvVarDecl>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub hooks: LifecycleHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckPolicy>,
}

impl Manifest {
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(content)?)
    }

    /// `id@version`, the unique key of a manifest.
    pub fn key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn health_path(&self) -> &str {
        self.health_check
            .as_ref()
            .and_then(|h| h.path.as_deref())
            .unwrap_or(DEFAULT_HEALTH_PATH)
    }

    pub fn is_secret(&self, name: &str) -> bool {
        self.environment.iter().any(|e| e.secret && e.name == name)
    }

    /// Required variables that neither `provided` nor a manifest default
    /// satisfies, in declaration order.
    pub fn missing_required_env(&self, provided: &HashMap<String, String>) -> Vec<String> {
        self.environment
            .iter()
            .filter(|decl| decl.required)
            .filter(|decl| {
                let has_value = provided.get(&decl.name).is_some_and(|v| !v.is_empty());
                let has_default = decl.default.as_deref().is_some_and(|v| !v.is_empty());
                !has_value && !has_default
            })
            .map(|decl| decl.name.clone())
            .collect()
    }

    /// Manifest defaults overlaid with `provided` values.
    pub fn merged_env(&self, provided: &HashMap<String, String>) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, String> = self
            .environment
            .iter()
            .filter_map(|decl| decl.default.clone().map(|d| (decl.name.clone(), d)))
            .collect();
        for (name, value) in provided {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Check every invariant and report all violations at once.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("id must not be empty".to_string());
        } else if !is_valid_id(&self.id) {
            problems.push(format!(
                "id '{}' may only contain lowercase letters, digits, '-', '_' and '.'",
                self.id
            ));
        }

        if !is_semver(&self.version) {
            problems.push(format!(
                "version '{}' is not a semantic version (MAJOR.MINOR.PATCH)",
                self.version
            ));
        }

        if self.image.repository.trim().is_empty() {
            problems.push("image repository must not be empty".to_string());
        }
        if self.image.tag.as_deref().is_some_and(|t| t.trim().is_empty()) {
            problems.push("image tag must not be empty when present".to_string());
        }
        if self.image.digest.as_deref().is_some_and(|d| !d.contains(':')) {
            problems.push("image digest must have the form <algorithm>:<hex>".to_string());
        }

        if self.port == 0 {
            problems.push("port must be between 1 and 65535".to_string());
        }

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.path.trim().is_empty() {
                problems.push(format!(
                    "endpoint #{} ({}) has an empty path",
                    i + 1,
                    endpoint.method
                ));
            } else if !endpoint.path.starts_with('/') {
                problems.push(format!(
                    "endpoint {} {} must start with '/'",
                    endpoint.method, endpoint.path
                ));
            }
            if let Some(limit) = &endpoint.rate_limit
                && (limit.requests == 0 || limit.window_secs == 0)
            {
                problems.push(format!(
                    "endpoint {} {} has a zero rate limit",
                    endpoint.method, endpoint.path
                ));
            }
        }

        let mut seen = HashSet::new();
        for decl in &self.environment {
            if !is_valid_env_name(&decl.name) {
                problems.push(format!("environment variable name '{}' is invalid", decl.name));
            }
            if !seen.insert(decl.name.as_str()) {
                problems.push(format!("environment variable '{}' is declared twice", decl.name));
            }
        }

        for dep in &self.dependencies {
            if dep.id.trim().is_empty() {
                problems.push("dependency id must not be empty".to_string());
            } else if dep.kind == DependencyKind::Plugin && dep.id == self.id {
                problems.push(format!("plugin '{}' cannot depend on itself", self.id));
            }
        }

        if let Some(health) = &self.health_check {
            if health.path.as_deref().is_some_and(|p| !p.starts_with('/')) {
                problems.push("health check path must start with '/'".to_string());
            }
            if health.interval_secs == Some(0) {
                problems.push("health check interval must be positive".to_string());
            }
            if health.timeout_secs == Some(0) {
                problems.push("health check timeout must be positive".to_string());
            }
            if health.retries == Some(0) {
                problems.push("health check retries must be positive".to_string());
            }
        }

        if self.resources.memory.is_some() && self.resources.memory_bytes().is_none() {
            problems.push(format!(
                "memory hint '{}' is not a size like 512m or 1g",
                self.resources.memory.as_deref().unwrap_or_default()
            ));
        }
        if self.resources.cpu.is_some_and(|c| c <= 0.0) {
            problems.push("cpu hint must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Invalid {
                id: self.key(),
                problems,
            })
        }
    }
}

fn is_valid_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `MAJOR.MINOR.PATCH` with optional `-prerelease` and `+build` suffixes.
fn is_semver(version: &str) -> bool {
    let core = version.split_once('+').map_or(version, |(core, _)| core);
    let (core, pre) = match core.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (core, None),
    };
    if pre.is_some_and(|p| p.is_empty()) {
        return false;
    }
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math_manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "id": "math",
                "name": "Math Service",
                "version": "1.0.0",
                "image": "ghcr.io/flowforge/math:1.0.0",
                "port": 8080,
                "endpoints": [
                    {"method": "POST", "path": "/add", "description": "Add numbers"},
                    {"method": "GET", "path": "/health"}
                ],
                "environment": [
                    {"name": "API_KEY", "required": true, "secret": true},
                    {"name": "LOG_LEVEL", "required": true, "default": "info"},
                    {"name": "REGION"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_manifest_with_short_image() {
        let manifest = math_manifest();
        assert_eq!(manifest.image.repository, "ghcr.io/flowforge/math");
        assert_eq!(manifest.image.tag.as_deref(), Some("1.0.0"));
        assert_eq!(manifest.endpoints[0].method, HttpMethod::Post);
        assert_eq!(manifest.key(), "math@1.0.0");
        assert_eq!(manifest.display_name(), "Math Service");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_manifest_with_full_image_object() {
        let manifest = Manifest::from_json(
            r#"{"id": "pdf", "version": "0.2.0", "port": 3000,
                "image": {"repository": "flowforge/pdf", "digest": "sha256:abc123"}}"#,
        )
        .unwrap();
        assert_eq!(manifest.image.reference(), "flowforge/pdf@sha256:abc123");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_unknown_http_method_is_rejected_at_parse_time() {
        let result = Manifest::from_json(
            r#"{"id": "x", "version": "1.0.0", "port": 1, "image": "x",
                "endpoints": [{"method": "FETCH", "path": "/a"}]}"#,
        );
        assert!(matches!(result, Err(ManifestError::Parse(_))));
    }

    #[test]
    fn test_image_ref_with_registry_port() {
        let image: ImageRef = "localhost:5000/team/tool".parse().unwrap();
        assert_eq!(image.repository, "localhost:5000/team/tool");
        assert!(image.tag.is_none());
        assert_eq!(image.reference(), "localhost:5000/team/tool:latest");

        let tagged: ImageRef = "localhost:5000/team/tool:2.1".parse().unwrap();
        assert_eq!(tagged.repository, "localhost:5000/team/tool");
        assert_eq!(tagged.tag.as_deref(), Some("2.1"));
    }

    #[test]
    fn test_image_ref_digest_wins_over_tag() {
        let image: ImageRef = "nginx:1.27@sha256:deadbeef".parse().unwrap();
        assert_eq!(image.tag.as_deref(), Some("1.27"));
        assert_eq!(image.reference(), "nginx@sha256:deadbeef");
    }

    #[test]
    fn test_image_ref_empty_is_error() {
        assert!("".parse::<ImageRef>().is_err());
        assert!(":tag".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut manifest = math_manifest();
        manifest.id = "Bad Id".to_string();
        manifest.version = "1.0".to_string();
        manifest.port = 0;
        manifest.endpoints.push(Endpoint {
            method: HttpMethod::Get,
            path: String::new(),
            description: None,
            auth: false,
            rate_limit: None,
        });

        match manifest.validate() {
            Err(ManifestError::Invalid { problems, .. }) => {
                assert_eq!(problems.len(), 4, "problems: {:?}", problems);
                assert!(problems.iter().any(|p| p.contains("id 'Bad Id'")));
                assert!(problems.iter().any(|p| p.contains("semantic version")));
                assert!(problems.iter().any(|p| p.contains("port")));
                assert!(problems.iter().any(|p| p.contains("empty path")));
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_duplicate_env_and_relative_path() {
        let mut manifest = math_manifest();
        manifest.environment.push(EnvVarDecl {
            name: "REGION".to_string(),
            required: false,
            secret: false,
            default: None,
            description: None,
        });
        manifest.endpoints[0].path = "add".to_string();
        let err = manifest.validate().unwrap_err().to_string();
        assert!(err.contains("declared twice"));
        assert!(err.contains("must start with '/'"));
    }

    #[test]
    fn test_semver_variants() {
        assert!(is_semver("1.0.0"));
        assert!(is_semver("10.20.30-rc.1+build.5"));
        assert!(!is_semver("1.0"));
        assert!(!is_semver("1.0.x"));
        assert!(!is_semver("1.0.0-"));
    }

    #[test]
    fn test_missing_required_env_respects_defaults_and_provided() {
        let manifest = math_manifest();
        let mut provided = HashMap::new();
        assert_eq!(manifest.missing_required_env(&provided), vec!["API_KEY"]);

        provided.insert("API_KEY".to_string(), String::new());
        assert_eq!(manifest.missing_required_env(&provided), vec!["API_KEY"]);

        provided.insert("API_KEY".to_string(), "k".to_string());
        assert!(manifest.missing_required_env(&provided).is_empty());
    }

    #[test]
    fn test_merged_env_overrides_defaults() {
        let manifest = math_manifest();
        let mut provided = HashMap::new();
        provided.insert("LOG_LEVEL".to_string(), "debug".to_string());
        provided.insert("EXTRA".to_string(), "1".to_string());
        let merged = manifest.merged_env(&provided);
        assert_eq!(merged.get("LOG_LEVEL").unwrap(), "debug");
        assert_eq!(merged.get("EXTRA").unwrap(), "1");
        assert!(!merged.contains_key("API_KEY"));
        assert!(manifest.is_secret("API_KEY"));
        assert!(!manifest.is_secret("LOG_LEVEL"));
    }

    #[test]
    fn test_resource_hints_parsing() {
        let hints = ResourceHints {
            memory: Some("512m".to_string()),
            cpu: Some(0.5),
        };
        assert_eq!(hints.memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(hints.nano_cpus(), Some(500_000_000));

        let gb = ResourceHints {
            memory: Some("1GB".to_string()),
            cpu: None,
        };
        assert_eq!(gb.memory_bytes(), Some(1024 * 1024 * 1024));

        let bad = ResourceHints {
            memory: Some("lots".to_string()),
            cpu: None,
        };
        assert!(bad.memory_bytes().is_none());
    }

    #[test]
    fn test_health_path_default() {
        let mut manifest = math_manifest();
        assert_eq!(manifest.health_path(), DEFAULT_HEALTH_PATH);
        manifest.health_check = Some(HealthCheckPolicy {
            path: Some("/ready".to_string()),
            interval_secs: Some(10),
            timeout_secs: None,
            retries: None,
        });
        assert_eq!(manifest.health_path(), "/ready");
    }
}
