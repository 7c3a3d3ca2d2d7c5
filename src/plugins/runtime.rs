//! Container engine abstraction.
//!
//! The orchestrator only talks to [`ContainerRuntime`]. `DockerRuntime`
//! (in `docker.rs`) is the production implementation; tests use
//! `fake::FakeRuntime`.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Label marking a container as owned by this orchestrator.
pub const LABEL_MANAGED: &str = "flowforge.managed";
/// Label carrying the plugin instance id.
pub const LABEL_INSTANCE: &str = "flowforge.instance";
/// Label carrying the manifest id.
pub const LABEL_FORGEHOOK: &str = "flowforge.forgehook";

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Engine unreachable or the transport failed.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("container engine error: {0}")]
    Engine(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Everything needed to create one plugin container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub container_port: u16,
    pub host_port: u16,
    pub labels: HashMap<String, String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

/// Result of the engine's own health check, when the image declares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInspect {
    pub state: ContainerState,
    pub health: Option<EngineHealth>,
}

/// A container carrying the managed label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub instance_id: Option<String>,
    pub running: bool,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, RuntimeError>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the engine answers at all.
    async fn ping(&self) -> bool;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Graceful stop, killed by the engine once `timeout` elapses.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Forced removal.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// A missing container is reported as [`ContainerState::Missing`],
    /// not as an error.
    async fn inspect(&self, id: &str) -> Result<ContainerInspect, RuntimeError>;

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    /// Follow the container's output. The stream ends when the container
    /// stops; dropping it detaches without touching the container.
    fn stream_logs(&self, id: &str) -> LogStream;
}

/// Labels attached to every container the orchestrator creates.
pub fn managed_labels(instance_id: &str, forgehook_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_INSTANCE.to_string(), instance_id.to_string()),
        (LABEL_FORGEHOOK.to_string(), forgehook_id.to_string()),
    ])
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_labels() {
        let labels = managed_labels("abc", "math");
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_INSTANCE], "abc");
        assert_eq!(labels[LABEL_FORGEHOOK], "math");
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(RuntimeError::NotFound("c1".into()).is_not_found());
        assert!(!RuntimeError::Engine("x".into()).is_not_found());
        assert!(!RuntimeError::Unavailable("x".into()).is_not_found());
    }

    #[tokio::test]
    async fn test_fake_runtime_lifecycle() {
        let runtime = fake::FakeRuntime::new();
        let spec = ContainerSpec {
            name: "flowforge-1".into(),
            image: "math:1.0.0".into(),
            env: BTreeMap::new(),
            container_port: 8080,
            host_port: 30000,
            labels: managed_labels("1", "math"),
            memory_bytes: None,
            nano_cpus: None,
        };
        let id = runtime.create_container(&spec).await.unwrap();
        assert_eq!(
            runtime.inspect(&id).await.unwrap().state,
            ContainerState::Exited
        );
        runtime.start(&id).await.unwrap();
        let managed = runtime.list_managed().await.unwrap();
        assert_eq!(managed.len(), 1);
        assert!(managed[0].running);
        assert_eq!(managed[0].instance_id.as_deref(), Some("1"));

        runtime.remove(&id).await.unwrap();
        assert!(runtime.remove(&id).await.unwrap_err().is_not_found());
        assert_eq!(
            runtime.inspect(&id).await.unwrap().state,
            ContainerState::Missing
        );

        runtime.set_unavailable(true);
        assert!(!runtime.ping().await);
    }
}
