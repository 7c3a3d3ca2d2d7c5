//! Registry client: fetches plugin indexes from sources and resolves
//! manifest references against the cached copies.
//!
//! Sources come in three kinds:
//! - `github`: `owner/repo[@ref][/dir]` or a github.com URL, read from
//!   `raw.githubusercontent.com`
//! - `url`: a plain HTTP(S) URL of an index document
//! - `local`: a file path (or a directory holding `registry.json`)
//!
//! Indexes are cached in the store with a fetch timestamp. A failed fetch
//! records `last_error` and keeps the previous cache usable.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowforge_common::{Manifest, ManifestError};
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::db::DbHandle;
use super::models::{RegistryEntry, RegistryIndex, RegistryPlugin, RegistrySource, SourceKind};
use crate::config::{RegistrySection, SourceSeed};

const GITHUB_RAW_BASE: &str = "https://raw.githubusercontent.com";
const DEFAULT_GITHUB_REF: &str = "main";
/// File name of an index inside a repository or directory.
pub const INDEX_FILE: &str = "registry.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry plugin {0} not found")]
    NotFound(String),

    #[error("Failed to fetch {location}: {message}")]
    Fetch { location: String, message: String },

    #[error("Invalid registry index from {location}: {message}")]
    InvalidIndex { location: String, message: String },

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    InvalidManifest(ManifestError),

    #[error("Registry store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl From<anyhow::Error> for RegistryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

/// Resolves a plugin reference (`id` or `id@version`) to a manifest.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Manifest, RegistryError>;
}

/// Result of refreshing one source.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefreshOutcome {
    pub source_id: String,
    pub name: String,
    pub plugin_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RegistryClient {
    db: DbHandle,
    http: reqwest::Client,
    cache_ttl: Duration,
}

impl RegistryClient {
    pub fn new(db: DbHandle, config: &RegistrySection) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("flowforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::InvalidSource(format!("HTTP client: {}", e)))?;
        Ok(Self {
            db,
            http,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        })
    }

    // ── Sources ───────────────────────────────────────────────────────

    /// Make sure every configured source exists. Existing urls are left
    /// as they are so user edits survive restarts.
    pub async fn seed_sources(&self, seeds: &[SourceSeed]) -> Result<(), RegistryError> {
        for seed in seeds {
            let url = seed.url.clone();
            let existing = self.db.call(move |db| db.find_source_by_url(&url)).await?;
            if existing.is_none() {
                info!(name = %seed.name, url = %seed.url, "Seeding registry source");
                self.add_source(&seed.name, &seed.url, seed.kind).await?;
            }
        }
        Ok(())
    }

    pub async fn add_source(
        &self,
        name: &str,
        url: &str,
        kind: SourceKind,
    ) -> Result<RegistrySource, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidSource("name must not be empty".into()));
        }
        // Fail early on urls that can never be fetched.
        index_location(kind, url)?;
        let owned = url.trim().to_string();
        if self
            .db
            .call(move |db| db.find_source_by_url(&owned))
            .await?
            .is_some()
        {
            return Err(RegistryError::InvalidSource(format!(
                "a source for {} already exists",
                url.trim()
            )));
        }
        let source = RegistrySource::new(name.trim(), url.trim(), kind);
        Ok(self.db.call(move |db| db.upsert_source(&source)).await?)
    }

    pub async fn list_sources(&self) -> Result<Vec<RegistrySource>, RegistryError> {
        Ok(self.db.call(|db| db.list_sources()).await?)
    }

    pub async fn remove_source(&self, id: &str) -> Result<(), RegistryError> {
        let id = id.to_string();
        Ok(self.db.call(move |db| db.delete_source(&id)).await?)
    }

    // ── Fetching ──────────────────────────────────────────────────────

    /// Fetch one source and cache the index. On failure the error is
    /// recorded on the source and returned.
    pub async fn refresh_source(&self, source: &RegistrySource) -> Result<usize, RegistryError> {
        match self.fetch_index(source).await {
            Ok(index) => {
                let count = index.plugins.len();
                let id = source.id.clone();
                self.db
                    .call(move |db| db.store_index(&id, &index, Utc::now()))
                    .await?;
                info!(source = %source.name, plugins = count, "Refreshed registry source");
                Ok(count)
            }
            Err(e) => {
                warn!(source = %source.name, error = %e, "Registry refresh failed");
                let id = source.id.clone();
                let message = e.to_string();
                self.db
                    .call(move |db| db.store_fetch_error(&id, &message))
                    .await?;
                Err(e)
            }
        }
    }

    /// Refresh every enabled source. Failures are reported per source.
    pub async fn refresh_all(&self) -> Result<Vec<RefreshOutcome>, RegistryError> {
        let sources = self.list_sources().await?;
        let mut outcomes = Vec::new();
        for source in sources.iter().filter(|s| s.enabled) {
            let result = self.refresh_source(source).await;
            outcomes.push(RefreshOutcome {
                source_id: source.id.clone(),
                name: source.name.clone(),
                plugin_count: result.as_ref().copied().unwrap_or(source.plugin_count),
                error: result.err().map(|e| e.to_string()),
            });
        }
        Ok(outcomes)
    }

    /// Refresh enabled sources whose cache is missing or older than the TTL.
    pub async fn refresh_stale(&self) -> Result<(), RegistryError> {
        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        for source in self.list_sources().await? {
            let fresh = source.fetched_at.is_some_and(|at| now - at < ttl);
            if source.enabled && !fresh {
                // The error is already recorded on the source.
                let _ = self.refresh_source(&source).await;
            }
        }
        Ok(())
    }

    async fn fetch_index(&self, source: &RegistrySource) -> Result<RegistryIndex, RegistryError> {
        let location = index_location(source.kind, &source.url)?;
        let body = match &location {
            IndexLocation::Remote(url) => self.fetch_text(url).await?,
            IndexLocation::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| RegistryError::Fetch {
                    location: path.display().to_string(),
                    message: e.to_string(),
                })?,
        };
        parse_index(&body, &location.to_string())
    }

    async fn fetch_text(&self, url: &str) -> Result<String, RegistryError> {
        let fetch_err = |message: String| RegistryError::Fetch {
            location: url.to_string(),
            message,
        };
        debug!(url = %url, "Fetching registry index");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {}", status)));
        }
        response.text().await.map_err(|e| fetch_err(e.to_string()))
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Cached plugins matching `query` (case-insensitive substring of id,
    /// name or description). Featured first, then by downloads.
    pub async fn search(&self, query: Option<&str>) -> Result<Vec<RegistryEntry>, RegistryError> {
        let mut entries = self.db.call(|db| db.cached_plugins()).await?;
        if let Some(q) = query.map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            entries.retain(|e| matches_query(&e.plugin.manifest, &q));
        }
        entries.sort_by(|a, b| {
            b.plugin
                .featured
                .cmp(&a.plugin.featured)
                .then(b.plugin.downloads.cmp(&a.plugin.downloads))
                .then(a.plugin.manifest.id.cmp(&b.plugin.manifest.id))
        });
        Ok(entries)
    }

    /// Look a reference up in the cache without fetching.
    pub async fn find_cached(&self, reference: &str) -> Result<Manifest, RegistryError> {
        let (id, version) = parse_reference(reference)?;
        let entries = self.db.call(|db| db.cached_plugins()).await?;
        select_manifest(entries, id, version)
            .ok_or_else(|| RegistryError::NotFound(reference.to_string()))
    }
}

#[async_trait]
impl ManifestResolver for RegistryClient {
    async fn resolve(&self, reference: &str) -> Result<Manifest, RegistryError> {
        self.refresh_stale().await?;
        let manifest = self.find_cached(reference).await?;
        manifest.validate().map_err(RegistryError::InvalidManifest)?;
        Ok(manifest)
    }
}

// ── Reference and location parsing ────────────────────────────────────

/// Split `id` or `id@version`.
pub fn parse_reference(reference: &str) -> Result<(&str, Option<&str>), RegistryError> {
    let reference = reference.trim();
    let (id, version) = match reference.split_once('@') {
        Some((id, version)) => (id, Some(version)),
        None => (reference, None),
    };
    if id.is_empty() || version.is_some_and(str::is_empty) {
        return Err(RegistryError::NotFound(reference.to_string()));
    }
    Ok((id, version))
}

fn select_manifest(
    entries: Vec<RegistryEntry>,
    id: &str,
    version: Option<&str>,
) -> Option<Manifest> {
    entries
        .into_iter()
        .map(|e| e.plugin.manifest)
        .filter(|m| m.id == id)
        .filter(|m| version.is_none_or(|v| m.version == v))
        .max_by(|a, b| compare_versions(&a.version, &b.version))
}

/// Semantic version ordering on the numeric core; a pre-release sorts
/// below its release. Unparseable versions sort lowest.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b))
}

fn version_key(version: &str) -> Option<(u64, u64, u64, bool)> {
    let without_build = version.split('+').next().unwrap_or(version);
    let (core, pre) = match without_build.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (without_build, None),
    };
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next()??;
    let patch = parts.next()??;
    Some((major, minor, patch, pre.is_none()))
}

fn matches_query(manifest: &Manifest, query: &str) -> bool {
    manifest.id.to_lowercase().contains(query)
        || manifest
            .name
            .as_deref()
            .is_some_and(|n| n.to_lowercase().contains(query))
        || manifest
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(query))
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexLocation {
    Remote(String),
    File(PathBuf),
}

impl std::fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Where the index of a source lives.
pub fn index_location(kind: SourceKind, url: &str) -> Result<IndexLocation, RegistryError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(RegistryError::InvalidSource("url must not be empty".into()));
    }
    match kind {
        SourceKind::Github => github_raw_url(url).map(IndexLocation::Remote),
        SourceKind::Url => {
            let parsed = Url::parse(url)
                .map_err(|e| RegistryError::InvalidSource(format!("{}: {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(RegistryError::InvalidSource(format!(
                    "{}: only http and https urls are supported",
                    url
                )));
            }
            Ok(IndexLocation::Remote(url.to_string()))
        }
        SourceKind::Local => {
            let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
            if path.is_dir() {
                Ok(IndexLocation::File(path.join(INDEX_FILE)))
            } else {
                Ok(IndexLocation::File(path))
            }
        }
    }
}

/// `owner/repo[@ref][/dir]`, `github.com/owner/repo[/tree/ref/dir]` or a
/// raw URL, mapped to the raw URL of the index file.
fn github_raw_url(source: &str) -> Result<String, RegistryError> {
    let invalid = |why: &str| RegistryError::InvalidSource(format!("{}: {}", source, why));

    let mut url = source.to_string();
    if !url.contains("://") {
        url = if url.starts_with("github.com/") || url.starts_with("raw.githubusercontent.com/") {
            format!("https://{}", url)
        } else {
            format!("https://github.com/{}", url)
        };
    }
    let parsed = Url::parse(&url).map_err(|e| invalid(&e.to_string()))?;
    let host = parsed.host_str().unwrap_or("").trim_start_matches("www.");
    let parts: Vec<&str> = parsed.path().split('/').filter(|s| !s.is_empty()).collect();

    if host == "raw.githubusercontent.com" {
        if parts.len() < 3 {
            return Err(invalid("expected /owner/repo/ref"));
        }
        if parts.last().is_some_and(|p| p.ends_with(".json")) {
            return Ok(url);
        }
        return Ok(format!("{}/{}", url.trim_end_matches('/'), INDEX_FILE));
    }
    if host != "github.com" {
        return Err(invalid("unsupported host"));
    }
    if parts.len() < 2 {
        return Err(invalid("expected owner/repo"));
    }

    let owner = parts[0];
    let (repo, mut git_ref) = match parts[1].trim_end_matches(".git").split_once('@') {
        Some((repo, r)) => (repo, r.to_string()),
        None => (parts[1].trim_end_matches(".git"), String::new()),
    };
    let mut rest = &parts[2..];
    if rest.len() >= 2 && (rest[0] == "tree" || rest[0] == "blob") {
        git_ref = rest[1].to_string();
        rest = &rest[2..];
    }
    if git_ref.is_empty() {
        git_ref = DEFAULT_GITHUB_REF.to_string();
    }

    let mut path = rest.join("/");
    if !path.ends_with(".json") {
        path = if path.is_empty() {
            INDEX_FILE.to_string()
        } else {
            format!("{}/{}", path, INDEX_FILE)
        };
    }
    Ok(format!(
        "{}/{}/{}/{}/{}",
        GITHUB_RAW_BASE, owner, repo, git_ref, path
    ))
}

/// Parse an index document: either `{"name": .., "plugins": [..]}` or a
/// bare array. Each entry is a full registry record or a bare manifest.
/// Entries with invalid manifests are skipped.
pub fn parse_index(body: &str, location: &str) -> Result<RegistryIndex, RegistryError> {
    let invalid = |message: String| RegistryError::InvalidIndex {
        location: location.to_string(),
        message,
    };
    let value: Value = serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
    let (name, entries) = match value {
        Value::Array(entries) => (None, entries),
        Value::Object(mut map) => {
            let name = map.get("name").and_then(Value::as_str).map(String::from);
            match map.remove("plugins") {
                Some(Value::Array(entries)) => (name, entries),
                Some(_) => return Err(invalid("'plugins' must be an array".into())),
                None => (name, Vec::new()),
            }
        }
        _ => return Err(invalid("expected an object or an array".into())),
    };

    let mut plugins = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        let parsed = if entry.get("manifest").is_some() {
            serde_json::from_value::<RegistryPlugin>(entry)
        } else {
            serde_json::from_value::<Manifest>(entry).map(|manifest| RegistryPlugin {
                manifest,
                downloads: 0,
                rating: None,
                verified: false,
                featured: false,
            })
        };
        match parsed {
            Ok(plugin) => match plugin.manifest.validate() {
                Ok(()) => plugins.push(plugin),
                Err(e) => warn!(location = %location, entry = i, error = %e, "Skipping invalid registry entry"),
            },
            Err(e) => warn!(location = %location, entry = i, error = %e, "Skipping unreadable registry entry"),
        }
    }
    Ok(RegistryIndex { name, plugins })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::db::PluginDb;

    fn client() -> RegistryClient {
        let db = DbHandle::new(PluginDb::new_in_memory().unwrap());
        RegistryClient::new(db, &RegistrySection::default()).unwrap()
    }

    fn write_index(dir: &std::path::Path, body: &serde_json::Value) {
        std::fs::write(dir.join(INDEX_FILE), body.to_string()).unwrap();
    }

    fn manifest_json(id: &str, version: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "version": version,
            "image": format!("ghcr.io/flowforge/{}:{}", id, version),
            "port": 8080,
        })
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(parse_reference("math").unwrap(), ("math", None));
        assert_eq!(
            parse_reference("math@1.2.0").unwrap(),
            ("math", Some("1.2.0"))
        );
        assert!(parse_reference("").is_err());
        assert!(parse_reference("math@").is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0-beta.1", "2.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0+build.5", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("garbage", "0.0.1"), Ordering::Less);
    }

    #[test]
    fn test_github_locations() {
        assert_eq!(
            github_raw_url("flowforge/hooks").unwrap(),
            "https://raw.githubusercontent.com/flowforge/hooks/main/registry.json"
        );
        assert_eq!(
            github_raw_url("flowforge/hooks@v2/catalog").unwrap(),
            "https://raw.githubusercontent.com/flowforge/hooks/v2/catalog/registry.json"
        );
        assert_eq!(
            github_raw_url("https://github.com/flowforge/hooks/tree/dev/index.json").unwrap(),
            "https://raw.githubusercontent.com/flowforge/hooks/dev/index.json"
        );
        assert_eq!(
            github_raw_url("https://raw.githubusercontent.com/a/b/main/x.json").unwrap(),
            "https://raw.githubusercontent.com/a/b/main/x.json"
        );
        assert!(github_raw_url("https://gitlab.com/a/b").is_err());
        assert!(github_raw_url("justowner").is_err());
    }

    #[test]
    fn test_url_location_requires_http() {
        assert!(index_location(SourceKind::Url, "https://hooks.example.com/index.json").is_ok());
        assert!(index_location(SourceKind::Url, "ftp://hooks.example.com/index.json").is_err());
        assert!(index_location(SourceKind::Url, "  ").is_err());
    }

    #[test]
    fn test_local_directory_location() {
        let dir = tempfile::tempdir().unwrap();
        let location = index_location(SourceKind::Local, dir.path().to_str().unwrap()).unwrap();
        assert_eq!(location, IndexLocation::File(dir.path().join(INDEX_FILE)));
    }

    #[test]
    fn test_parse_index_shapes() {
        let wrapped = serde_json::json!({
            "name": "Official",
            "plugins": [
                {"manifest": manifest_json("math", "1.0.0"), "downloads": 10, "featured": true},
                manifest_json("text", "0.1.0"),
            ]
        });
        let index = parse_index(&wrapped.to_string(), "test").unwrap();
        assert_eq!(index.name.as_deref(), Some("Official"));
        assert_eq!(index.plugins.len(), 2);
        assert!(index.plugins[0].featured);
        assert_eq!(index.plugins[1].downloads, 0);

        let bare = serde_json::json!([manifest_json("math", "1.0.0")]);
        assert_eq!(parse_index(&bare.to_string(), "test").unwrap().plugins.len(), 1);
    }

    #[test]
    fn test_parse_index_skips_invalid_entries() {
        let body = serde_json::json!({
            "plugins": [
                manifest_json("math", "1.0.0"),
                manifest_json("Bad Id", "1.0.0"),
                {"id": "no-image"},
            ]
        });
        let index = parse_index(&body.to_string(), "test").unwrap();
        assert_eq!(index.plugins.len(), 1);
        assert_eq!(index.plugins[0].manifest.id, "math");
    }

    #[test]
    fn test_parse_index_rejects_garbage() {
        assert!(matches!(
            parse_index("not json", "x"),
            Err(RegistryError::InvalidIndex { .. })
        ));
        assert!(parse_index("42", "x").is_err());
        assert!(parse_index(r#"{"plugins": {}}"#, "x").is_err());
    }

    #[tokio::test]
    async fn test_resolve_from_local_source() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            &serde_json::json!([
                manifest_json("math", "1.0.0"),
                manifest_json("math", "1.2.0"),
                manifest_json("math", "1.10.0-rc.1"),
            ]),
        );
        let client = client();
        client
            .add_source("local", dir.path().to_str().unwrap(), SourceKind::Local)
            .await
            .unwrap();

        let latest = client.resolve("math").await.unwrap();
        assert_eq!(latest.version, "1.10.0-rc.1");
        let pinned = client.resolve("math@1.0.0").await.unwrap();
        assert_eq!(pinned.version, "1.0.0");

        match client.resolve("math@9.9.9").await {
            Err(RegistryError::NotFound(r)) => assert_eq!(r, "math@9.9.9"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_cache_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), &serde_json::json!([manifest_json("math", "1.0.0")]));
        let client = client();
        let source = client
            .add_source("local", dir.path().to_str().unwrap(), SourceKind::Local)
            .await
            .unwrap();
        assert_eq!(client.refresh_source(&source).await.unwrap(), 1);

        std::fs::write(dir.path().join(INDEX_FILE), "{broken").unwrap();
        assert!(client.refresh_source(&source).await.is_err());

        let sources = client.list_sources().await.unwrap();
        assert!(sources[0].last_error.is_some());
        assert_eq!(client.search(None).await.unwrap().len(), 1);
        assert!(client.find_cached("math").await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_all_reports_per_source() {
        let good = tempfile::tempdir().unwrap();
        write_index(good.path(), &serde_json::json!([manifest_json("math", "1.0.0")]));
        let client = client();
        client
            .add_source("good", good.path().to_str().unwrap(), SourceKind::Local)
            .await
            .unwrap();
        client
            .add_source("missing", "/nonexistent/flowforge/registry.json", SourceKind::Local)
            .await
            .unwrap();

        let outcomes = client.refresh_all().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        let good = outcomes.iter().find(|o| o.name == "good").unwrap();
        assert_eq!(good.plugin_count, 1);
        assert!(good.error.is_none());
        let missing = outcomes.iter().find(|o| o.name == "missing").unwrap();
        assert!(missing.error.is_some());
    }

    #[tokio::test]
    async fn test_search_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let mut text = manifest_json("text-tools", "1.0.0");
        text["description"] = "String utilities".into();
        write_index(
            dir.path(),
            &serde_json::json!({"plugins": [
                {"manifest": manifest_json("math", "1.0.0"), "downloads": 5},
                {"manifest": text, "downloads": 1, "featured": true},
                {"manifest": manifest_json("crypto", "1.0.0"), "downloads": 50},
            ]}),
        );
        let client = client();
        let source = client
            .add_source("local", dir.path().to_str().unwrap(), SourceKind::Local)
            .await
            .unwrap();
        client.refresh_source(&source).await.unwrap();

        let all: Vec<String> = client
            .search(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.plugin.manifest.id)
            .collect();
        assert_eq!(all, vec!["text-tools", "crypto", "math"]);

        let hits = client.search(Some("STRING")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_name, "local");
    }

    #[tokio::test]
    async fn test_seed_sources_is_idempotent() {
        let client = client();
        let seeds = vec![SourceSeed {
            name: "official".into(),
            url: "flowforge/forgehooks".into(),
            kind: SourceKind::Github,
        }];
        client.seed_sources(&seeds).await.unwrap();
        client.seed_sources(&seeds).await.unwrap();
        assert_eq!(client.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_source_validates() {
        let client = client();
        assert!(client.add_source("", "a/b", SourceKind::Github).await.is_err());
        assert!(
            client
                .add_source("x", "notaurl", SourceKind::Url)
                .await
                .is_err()
        );
        assert!(client.list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_source_url_is_rejected() {
        let client = client();
        client
            .add_source("official", "flowforge/forgehooks", SourceKind::Github)
            .await
            .unwrap();
        let err = client
            .add_source("again", "flowforge/forgehooks", SourceKind::Github)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSource(_)));
        assert_eq!(client.list_sources().await.unwrap().len(), 1);
    }
}
