//! Configuration for the FlowForge server.
//!
//! Read from `.flowforge/flowforge.toml`, layered as file → environment →
//! CLI flags. Every field has a default, so an absent file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! db_path = ".flowforge/flowforge.db"
//! cors = false
//!
//! [ports]
//! range_start = 30000
//! range_end = 30999
//!
//! [docker]
//! socket = "/var/run/docker.sock"
//! stop_timeout_secs = 10
//! log_buffer_lines = 500
//!
//! [health]
//! interval_secs = 30
//! timeout_secs = 5
//!
//! [registry]
//! cache_ttl_secs = 3600
//! request_timeout_secs = 15
//!
//! [[registry.sources]]
//! name = "FlowForge Official"
//! url = "flowforge/forgehooks"
//! kind = "github"
//!
//! [logging]
//! level = "info,flowforge=debug"
//! format = "pretty"
//! dir = ".flowforge/logs"
//! ```

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::plugins::models::SourceKind;

/// Directory holding configuration, database and logs.
pub const FLOWFORGE_DIR: &str = ".flowforge";
/// Configuration file name inside [`FLOWFORGE_DIR`].
pub const CONFIG_FILE: &str = "flowforge.toml";

/// Console/file log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a UI dev server on another origin.
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_db_path() -> PathBuf {
    PathBuf::from(FLOWFORGE_DIR).join("flowforge.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors: false,
        }
    }
}

/// Host ports handed out to plugin containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
}

fn default_range_start() -> u16 {
    30000
}

fn default_range_end() -> u16 {
    30999
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
        }
    }
}

impl PortsSection {
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range_start..=self.range_end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    /// Engine socket or `tcp://` address; platform default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Recent output lines kept in memory per plugin.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_log_buffer_lines() -> usize {
    500
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            socket: None,
            stop_timeout_secs: default_stop_timeout_secs(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

/// Defaults for plugins whose manifest has no health check policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    5
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }
}

/// A registry source seeded into the database at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSeed {
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceSeed>,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Daily rolling log files are written here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info,flowforge=debug".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

/// Root of `flowforge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowforgeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FlowforgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flowforge.toml")
    }

    /// Load `<dir>/flowforge.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(flowforge_dir: &Path) -> Result<Self> {
        let config_path = flowforge_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then process environment.
    pub fn resolve(flowforge_dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(flowforge_dir)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize flowforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FLOWFORGE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("Invalid value '{}' for {}", value, key))
        }

        if let Some(v) = lookup("FLOWFORGE_PORT") {
            self.server.port = parse_var("FLOWFORGE_PORT", &v)?;
        }
        if let Some(v) = lookup("FLOWFORGE_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOWFORGE_PORT_RANGE_START") {
            self.ports.range_start = parse_var("FLOWFORGE_PORT_RANGE_START", &v)?;
        }
        if let Some(v) = lookup("FLOWFORGE_PORT_RANGE_END") {
            self.ports.range_end = parse_var("FLOWFORGE_PORT_RANGE_END", &v)?;
        }
        if let Some(v) = lookup("FLOWFORGE_DOCKER_SOCKET")
            && !v.trim().is_empty()
        {
            self.docker.socket = Some(v);
        }
        if let Some(v) = lookup("FLOWFORGE_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.docker.stop_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.cache_ttl_secs)
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.ports.range_start == 0 {
            problems.push("ports.range_start must be at least 1".to_string());
        }
        if self.ports.range_start > self.ports.range_end {
            problems.push(format!(
                "ports.range_start ({}) is greater than ports.range_end ({})",
                self.ports.range_start, self.ports.range_end
            ));
        }
        if self.ports.range().contains(&self.server.port) {
            problems.push(format!(
                "server.port {} lies inside the plugin port range",
                self.server.port
            ));
        }
        if self.docker.log_buffer_lines == 0 {
            problems.push("docker.log_buffer_lines must be positive".to_string());
        }
        if self.health.interval_secs == 0 {
            problems.push("health.interval_secs must be positive".to_string());
        }
        if self.health.timeout_secs == 0 {
            problems.push("health.timeout_secs must be positive".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            problems.push(format!(
                "logging.level '{}' is not a valid filter directive",
                self.logging.level
            ));
        }
        for seed in &self.registry.sources {
            if seed.url.trim().is_empty() {
                problems.push(format!("registry source '{}' has an empty url", seed.name));
            }
        }

        problems
    }
}
