use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flowforge_common::Manifest;
use serde::{Deserialize, Serialize};

/// Prefix of every container name the orchestrator creates.
pub const CONTAINER_NAME_PREFIX: &str = "flowforge-";

// ── Lifecycle status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Installing,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Uninstalling,
    Error,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Uninstalling => "uninstalling",
            Self::Error => "error",
        }
    }

    /// A lifecycle operation is in flight for this instance.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Starting | Self::Stopping | Self::Uninstalling
        )
    }

    /// The transition table. Every status change the orchestrator makes
    /// outside of boot reconciliation must pass this check.
    pub fn can_transition_to(&self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        match (*self, next) {
            (Uninstalling, Uninstalling) => false,
            (_, Uninstalling) => true,
            (Installing, Installed)
            | (Installed, Starting)
            | (Starting, Running)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Starting) => true,
            (Installing | Starting | Stopping | Uninstalling, Error) => true,
            _ => false,
        }
    }

    /// Whether `operation` may begin from this status.
    pub fn permits(&self, operation: Operation) -> bool {
        match operation {
            Operation::Start => matches!(self, Self::Installed | Self::Stopped),
            Operation::Stop => matches!(self, Self::Running),
            Operation::Restart => matches!(self, Self::Running | Self::Installed | Self::Stopped),
            Operation::Uninstall => matches!(
                self,
                Self::Installed | Self::Stopped | Self::Error | Self::Running
            ),
            Operation::UpdateConfig => {
                matches!(self, Self::Installed | Self::Stopped | Self::Error)
            }
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(Self::Installing),
            "installed" => Ok(Self::Installed),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "uninstalling" => Ok(Self::Uninstalling),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid plugin status: {}", s)),
        }
    }
}

/// Lifecycle operations guarded by [`PluginStatus::permits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    Uninstall,
    UpdateConfig,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Uninstall => "uninstall",
            Self::UpdateConfig => "update config of",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid health status: {}", s)),
        }
    }
}

// ── Plugin instance ───────────────────────────────────────────────────

pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// One installation of a ForgeHook. Not `Serialize`: external views go
/// through [`PluginSummary`], which drops secret environment values.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInstance {
    pub id: String,
    pub forgehook_id: String,
    pub manifest: Manifest,
    pub status: PluginStatus,
    pub container_id: Option<String>,
    pub container_name: String,
    pub host_port: u16,
    pub config: ConfigMap,
    pub env: HashMap<String, String>,
    pub installed_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub error: Option<String>,
}

impl PluginInstance {
    /// A fresh `installing` instance with a new id. The host port is
    /// assigned by the store when the row is inserted.
    pub fn new(manifest: Manifest, config: ConfigMap, env: HashMap<String, String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            container_name: container_name_for(&id),
            id,
            forgehook_id: manifest.id.clone(),
            manifest,
            status: PluginStatus::Installing,
            container_id: None,
            host_port: 0,
            config,
            env,
            installed_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            error: None,
        }
    }

    pub fn summary(&self) -> PluginSummary {
        let env = self
            .env
            .iter()
            .filter(|(name, _)| !self.manifest.is_secret(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let mut secrets: Vec<String> = self
            .env
            .keys()
            .filter(|name| self.manifest.is_secret(name))
            .cloned()
            .collect();
        secrets.sort();

        PluginSummary {
            id: self.id.clone(),
            forgehook_id: self.forgehook_id.clone(),
            name: self.manifest.display_name().to_string(),
            version: self.manifest.version.clone(),
            image: self.manifest.image.reference(),
            status: self.status,
            container_id: self.container_id.clone(),
            container_name: self.container_name.clone(),
            host_port: self.host_port,
            container_port: self.manifest.port,
            config: self.config.clone(),
            env,
            secrets,
            installed_at: self.installed_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            last_health_check: self.last_health_check,
            health_status: self.health_status,
            error: self.error.clone(),
        }
    }
}

/// Deterministic container name for an instance id.
pub fn container_name_for(instance_id: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, instance_id)
}

/// Externally visible view of an instance. Secret values are omitted;
/// only the names of secrets that have been set are listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub forgehook_id: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub status: PluginStatus,
    pub container_id: Option<String>,
    pub container_name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub config: ConfigMap,
    pub env: HashMap<String, String>,
    pub secrets: Vec<String>,
    pub installed_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub error: Option<String>,
}

/// Partial update applied atomically by the store. `None` leaves a field
/// untouched; the nested `Option`s distinguish "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub status: Option<PluginStatus>,
    pub container_id: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub stopped_at: Option<Option<DateTime<Utc>>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: Option<HealthStatus>,
    pub error: Option<Option<String>>,
    pub config: Option<ConfigMap>,
    pub env: Option<HashMap<String, String>>,
}

impl InstanceUpdate {
    pub fn status(status: PluginStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(PluginStatus::Error),
            error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn with_container_id(mut self, container_id: Option<String>) -> Self {
        self.container_id = Some(container_id);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn with_stopped_at(mut self, at: DateTime<Utc>) -> Self {
        self.stopped_at = Some(Some(at));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn apply(&self, instance: &mut PluginInstance) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(container_id) = &self.container_id {
            instance.container_id = container_id.clone();
        }
        if let Some(started_at) = self.started_at {
            instance.started_at = started_at;
        }
        if let Some(stopped_at) = self.stopped_at {
            instance.stopped_at = stopped_at;
        }
        if let Some(at) = self.last_health_check {
            instance.last_health_check = Some(at);
        }
        if let Some(health) = self.health_status {
            instance.health_status = health;
        }
        if let Some(error) = &self.error {
            instance.error = error.clone();
        }
        if let Some(config) = &self.config {
            instance.config = config.clone();
        }
        if let Some(env) = &self.env {
            instance.env = env.clone();
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Github,
    Url,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Url => "url",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "url" => Ok(Self::Url),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid source kind: {}", s)),
        }
    }
}

/// A place registry indexes are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of plugins in the cached index.
    #[serde(default)]
    pub plugin_count: usize,
}

impl RegistrySource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            kind,
            enabled: true,
            fetched_at: None,
            last_error: None,
            plugin_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub plugins: Vec<RegistryPlugin>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryPlugin {
    pub manifest: Manifest,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub featured: bool,
}

/// A cached registry plugin tagged with the source it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub source_id: String,
    pub source_name: String,
    #[serde(flatten)]
    pub plugin: RegistryPlugin,
}

#[cfg(test)]
pub(crate) fn test_manifest(id: &str, version: &str, port: u16) -> Manifest {
    Manifest::from_json(
        &serde_json::json!({
            "id": id,
            "version": version,
            "image": format!("ghcr.io/flowforge/{}:{}", id, version),
            "port": port,
        })
        .to_string(),
    )
    .unwrap()
}
