use std::time::Duration;

use tracing::debug;

use super::models::HealthStatus;
use super::runtime::{ContainerRuntime, ContainerState, EngineHealth};

/// Consecutive failed probes before a plugin is reported unhealthy.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Per-instance health bookkeeping. Health is reported only; it never
/// drives lifecycle transitions.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    consecutive_failures: u32,
    threshold: u32,
    status: HealthStatus,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD)
    }
}

impl HealthTracker {
    /// A tracker that reports unhealthy after `threshold` failures in a row.
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            status: HealthStatus::Unknown,
        }
    }

    /// A tracker picking up from a previously recorded status, so a
    /// restarted process still needs `threshold` failures to flip it.
    pub fn resume(status: HealthStatus, threshold: u32) -> Self {
        Self {
            status,
            ..Self::new(threshold)
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Fold one probe result in and return the resulting status.
    pub fn record(&mut self, success: bool) -> HealthStatus {
        if success {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.threshold {
                self.status = HealthStatus::Unhealthy;
            }
        }
        self.status
    }
}

/// Probe one running container.
///
/// The engine's own health check wins when the image declares one;
/// otherwise an HTTP GET against the published port must return 2xx.
/// `None` means no verdict yet (engine check still starting).
pub async fn probe(
    runtime: &dyn ContainerRuntime,
    http: &reqwest::Client,
    container_id: &str,
    host_port: u16,
    path: &str,
    timeout: Duration,
) -> Option<bool> {
    let inspect = match runtime.inspect(container_id).await {
        Ok(inspect) => inspect,
        Err(e) => {
            debug!(container_id = %container_id, error = %e, "Health inspect failed");
            return Some(false);
        }
    };
    if inspect.state != ContainerState::Running {
        return Some(false);
    }

    match inspect.health {
        Some(EngineHealth::Healthy) => Some(true),
        Some(EngineHealth::Unhealthy) => Some(false),
        Some(EngineHealth::Starting) => None,
        None => Some(http_probe(http, host_port, path, timeout).await),
    }
}

pub fn probe_url(host_port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", host_port, path)
}

async fn http_probe(http: &reqwest::Client, host_port: u16, path: &str, timeout: Duration) -> bool {
    let url = probe_url(host_port, path);
    match http.get(&url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(url = %url, error = %e, "Health probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::plugins::runtime::fake::FakeRuntime;
    use crate::plugins::runtime::{ContainerSpec, managed_labels};

    #[test]
    fn test_three_failures_to_unhealthy() {
        let mut tracker = HealthTracker::default();
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.record(false), HealthStatus::Unknown);
        assert_eq!(tracker.record(false), HealthStatus::Unknown);
        assert_eq!(tracker.record(false), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(false), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut tracker = HealthTracker::default();
        assert_eq!(tracker.record(true), HealthStatus::Healthy);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.record(true), HealthStatus::Healthy);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.status(), HealthStatus::Healthy, "counter restarted");
        assert_eq!(tracker.record(false), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(true), HealthStatus::Healthy);
    }

    #[test]
    fn test_resumed_tracker_keeps_recorded_status() {
        let mut tracker = HealthTracker::resume(HealthStatus::Healthy, 3);
        assert_eq!(tracker.record(false), HealthStatus::Healthy);
        assert_eq!(tracker.record(false), HealthStatus::Healthy);
        assert_eq!(tracker.record(false), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_custom_threshold() {
        let mut tracker = HealthTracker::new(1);
        assert_eq!(tracker.record(false), HealthStatus::Unhealthy);
        let mut lenient = HealthTracker::new(5);
        for _ in 0..4 {
            assert_eq!(lenient.record(false), HealthStatus::Unknown);
        }
        assert_eq!(lenient.record(false), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url(30000, "/health"), "http://127.0.0.1:30000/health");
    }

    fn running_container(runtime: &FakeRuntime) {
        runtime.insert_container(
            "c1",
            ContainerSpec {
                name: "flowforge-x".into(),
                image: "x".into(),
                env: BTreeMap::new(),
                container_port: 8080,
                host_port: 1,
                labels: managed_labels("x", "x"),
                memory_bytes: None,
                nano_cpus: None,
            },
            true,
        );
    }

    #[tokio::test]
    async fn test_probe_prefers_engine_health() {
        let runtime = FakeRuntime::new();
        running_container(&runtime);
        let http = reqwest::Client::new();
        let timeout = Duration::from_millis(200);

        runtime.set_engine_health(Some(EngineHealth::Healthy));
        assert_eq!(probe(&runtime, &http, "c1", 1, "/health", timeout).await, Some(true));

        runtime.set_engine_health(Some(EngineHealth::Unhealthy));
        assert_eq!(probe(&runtime, &http, "c1", 1, "/health", timeout).await, Some(false));

        runtime.set_engine_health(Some(EngineHealth::Starting));
        assert_eq!(probe(&runtime, &http, "c1", 1, "/health", timeout).await, None);
    }

    #[tokio::test]
    async fn test_probe_fails_for_stopped_or_missing_container() {
        let runtime = FakeRuntime::new();
        running_container(&runtime);
        runtime.set_engine_health(Some(EngineHealth::Healthy));
        let http = reqwest::Client::new();
        let timeout = Duration::from_millis(200);

        runtime.exit_container("c1");
        assert_eq!(probe(&runtime, &http, "c1", 1, "/health", timeout).await, Some(false));
        assert_eq!(probe(&runtime, &http, "gone", 1, "/health", timeout).await, Some(false));
    }

    #[tokio::test]
    async fn test_http_probe_against_local_server() {
        use axum::{Router, routing::get};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let runtime = FakeRuntime::new();
        running_container(&runtime);
        let http = reqwest::Client::new();
        let timeout = Duration::from_secs(2);

        assert_eq!(probe(&runtime, &http, "c1", port, "/health", timeout).await, Some(true));
        assert_eq!(probe(&runtime, &http, "c1", port, "/missing", timeout).await, Some(false));
    }
}
