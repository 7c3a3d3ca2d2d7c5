use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, ContainerSummaryStateEnum, HealthStatusEnum,
    HostConfig, PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, ListContainersOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StopContainerOptionsBuilder,
};
use futures::StreamExt;
use tracing::{debug, info};

use super::runtime::*;

/// Seconds bollard waits on a single engine request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Lines of history replayed when a log stream attaches.
const LOG_TAIL: &str = "100";

/// [`ContainerRuntime`] backed by the local Docker engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect through `socket` when given, else the platform defaults
    /// (`DOCKER_HOST` or the local unix socket). Connecting is lazy; use
    /// [`ContainerRuntime::ping`] to find out whether the engine answers.
    pub fn connect(socket: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket {
            Some(path) if path.starts_with("tcp://") || path.starts_with("http://") => {
                Docker::connect_with_http(path, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(path) => {
                Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

/// Sort bollard failures into the three runtime error kinds.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Engine(format!("{} (status {})", message, status_code)),
        e @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::HyperLegacyError { .. }
        | BollardError::RequestTimeoutError
        | BollardError::SocketNotFoundError(_)) => RuntimeError::Unavailable(e.to_string()),
        other => RuntimeError::Engine(other.to_string()),
    }
}

fn port_key(container_port: u16) -> String {
    format!("{}/tcp", container_port)
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let port = port_key(spec.container_port);
    let bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::from([(
        port.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    )]);

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect(),
        ),
        exposed_ports: Some(vec![port]),
        labels: Some(spec.labels.clone()),
        host_config: Some(HostConfig {
            port_bindings: Some(bindings),
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await.map_err(classify) {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.map_err(classify)?;
            if let Some(status) = info.status {
                debug!(image = %image, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), create_body(spec))
            .await
            .map_err(classify)?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.start_container(id, None).await.map_err(classify)
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(secs).build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        let response = match self.docker.inspect_container(id, None).await {
            Ok(response) => response,
            Err(e) => {
                return match classify(e) {
                    RuntimeError::NotFound(_) => Ok(ContainerInspect {
                        state: ContainerState::Missing,
                        health: None,
                    }),
                    other => Err(other),
                };
            }
        };

        let state = response.state.unwrap_or_default();
        let running = state.running.unwrap_or(false)
            || matches!(state.status, Some(ContainerStateStatusEnum::RUNNING));
        let health = state
            .health
            .and_then(|h| h.status)
            .and_then(|status| match status {
                HealthStatusEnum::STARTING => Some(EngineHealth::Starting),
                HealthStatusEnum::HEALTHY => Some(EngineHealth::Healthy),
                HealthStatusEnum::UNHEALTHY => Some(EngineHealth::Unhealthy),
                HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => None,
            });

        Ok(ContainerInspect {
            state: if running {
                ContainerState::Running
            } else {
                ContainerState::Exited
            },
            health,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let instance_id = summary
                    .labels
                    .and_then(|mut labels| labels.remove(LABEL_INSTANCE));
                Some(ManagedContainer {
                    id,
                    name,
                    instance_id,
                    running: matches!(summary.state, Some(ContainerSummaryStateEnum::RUNNING)),
                })
            })
            .collect())
    }

    fn stream_logs(&self, id: &str) -> LogStream {
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .tail(LOG_TAIL)
            .build();
        let stream = self.docker.logs(id, Some(options)).flat_map(|item| {
            let lines: Vec<Result<String, RuntimeError>> = match item {
                Ok(output) => frame_lines(&output.to_string()).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(classify(e))],
            };
            futures::stream::iter(lines)
        });
        Box::pin(stream)
    }
}

/// One engine log frame can carry several lines.
fn frame_lines(frame: &str) -> Vec<String> {
    frame.lines().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "flowforge-abc".into(),
            image: "ghcr.io/flowforge/math:1.0.0".into(),
            env: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
            ]),
            container_port: 8080,
            host_port: 30000,
            labels: managed_labels("abc", "math"),
            memory_bytes: Some(256 * 1024 * 1024),
            nano_cpus: Some(500_000_000),
        }
    }

    #[test]
    fn test_create_body_binds_host_port() {
        let body = create_body(&spec());
        let host = body.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("30000"));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(body.exposed_ports, Some(vec!["8080/tcp".to_string()]));
    }

    #[test]
    fn test_create_body_env_and_labels() {
        let body = create_body(&spec());
        assert_eq!(
            body.env.unwrap(),
            vec!["A=1".to_string(), "B=two words".to_string()]
        );
        assert_eq!(body.labels.unwrap()[LABEL_INSTANCE], "abc");
        assert_eq!(body.image.as_deref(), Some("ghcr.io/flowforge/math:1.0.0"));
    }

    #[test]
    fn test_frame_lines_splits_multi_line_frames() {
        assert_eq!(frame_lines("started\n"), vec!["started"]);
        assert_eq!(
            frame_lines("panic: boom\n  at main.go:12\r\n  at main.go:3\n"),
            vec!["panic: boom", "  at main.go:12", "  at main.go:3"]
        );
        assert!(frame_lines("").is_empty());
    }

    #[test]
    fn test_classify_status_codes() {
        let not_found = classify(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: x".into(),
        });
        assert!(not_found.is_not_found());

        let conflict = classify(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        });
        assert!(matches!(conflict, RuntimeError::Engine(ref m) if m.contains("409")));

        let timeout = classify(BollardError::RequestTimeoutError);
        assert!(matches!(timeout, RuntimeError::Unavailable(_)));

        let io = classify(BollardError::IOError {
            err: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        });
        assert!(matches!(io, RuntimeError::Unavailable(_)));
    }
}
