use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use flowforge_common::Manifest;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::models::{ConfigMap, PluginStatus, PluginSummary, SourceKind};
use super::orchestrator::{InstallRequest, ManifestSource, Orchestrator};
use super::registry::{RegistryClient, RegistryError};
use crate::errors::PluginError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<RegistryClient>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InstallBody {
    /// Kept as raw JSON so a malformed manifest is reported as a
    /// validation failure rather than an extractor rejection.
    pub manifest: Option<serde_json::Value>,
    pub reference: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Serialize, Deserialize)]
pub struct InstallResponse {
    pub id: String,
    pub status: PluginStatus,
    pub host_port: u16,
}

#[derive(Deserialize, Default)]
pub struct StopBody {
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct UpdateConfigBody {
    pub config: Option<ConfigMap>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

#[derive(Deserialize)]
pub struct AddSourceBody {
    pub name: String,
    pub url: String,
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
}

fn default_source_kind() -> SourceKind {
    SourceKind::Url
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

/// A [`PluginError`] on its way out as `{"error", "code"}`.
pub struct ApiError(PluginError);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(PluginError::Validation(vec![message.into()]))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            PluginError::Validation(_) => StatusCode::BAD_REQUEST,
            PluginError::InvalidState { .. } => StatusCode::CONFLICT,
            PluginError::ResourceExhausted { .. } | PluginError::RuntimeUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PluginError::NotFound(_) => StatusCode::NOT_FOUND,
            PluginError::Registry(RegistryError::InvalidSource(_)) => StatusCode::BAD_REQUEST,
            PluginError::Registry(
                RegistryError::Fetch { .. } | RegistryError::InvalidIndex { .. },
            ) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PluginError> for ApiError {
    fn from(err: PluginError) -> Self {
        Self(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            // Store failures carry typed errors such as a missing source.
            RegistryError::Store(e) => Self(e.into()),
            other => Self(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        if status.is_server_error() {
            error!(code = self.0.code(), error = %message, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({"error": message, "code": self.0.code()})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/plugins", get(list_plugins).post(install_plugin))
        .route("/api/plugins/{id}", get(get_plugin).delete(uninstall_plugin))
        .route("/api/plugins/{id}/start", post(start_plugin))
        .route("/api/plugins/{id}/stop", post(stop_plugin))
        .route("/api/plugins/{id}/restart", post(restart_plugin))
        .route("/api/plugins/{id}/config", patch(update_plugin_config))
        .route("/api/plugins/{id}/logs", get(plugin_logs))
        .route("/api/registry/sources", get(list_sources).post(add_source))
        .route("/api/registry/sources/{id}", delete(remove_source))
        .route("/api/registry/refresh", post(refresh_registry))
        .route("/api/registry/plugins", get(search_registry))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.status().await?))
}

async fn list_plugins(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let summaries: Vec<PluginSummary> = state
        .orchestrator
        .list()
        .await?
        .iter()
        .map(|i| i.summary())
        .collect();
    Ok(Json(summaries))
}

async fn install_plugin(
    State(state): State<SharedState>,
    Json(body): Json<InstallBody>,
) -> Result<impl IntoResponse, ApiError> {
    let source = match (body.manifest, body.reference) {
        (Some(manifest), None) => {
            let manifest = Manifest::from_json(&manifest.to_string()).map_err(PluginError::from)?;
            ManifestSource::Manifest(Box::new(manifest))
        }
        (None, Some(reference)) => ManifestSource::Reference(reference),
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of manifest or reference is required",
            ));
        }
    };
    let request = InstallRequest {
        source,
        config: body.config,
        env: body.env,
        auto_start: body.auto_start,
    };
    let instance = state.orchestrator.install(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(InstallResponse {
            id: instance.id,
            status: instance.status,
            host_port: instance.host_port,
        }),
    ))
}

async fn get_plugin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.get(&id).await?.summary()))
}

async fn start_plugin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.start(&id).await?.summary()))
}

/// The body is optional; an empty one uses the configured grace period.
async fn stop_plugin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: StopBody = if body.iter().all(u8::is_ascii_whitespace) {
        StopBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid stop request: {}", e)))?
    };
    let timeout = body.timeout_secs.map(Duration::from_secs);
    Ok(Json(state.orchestrator.stop(&id, timeout).await?.summary()))
}

async fn restart_plugin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.restart(&id).await?.summary()))
}

async fn update_plugin_config(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateConfigBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .orchestrator
        .update_config(&id, body.config, body.env)
        .await?;
    Ok(Json(updated.summary()))
}

async fn uninstall_plugin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.uninstall(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn plugin_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = state.orchestrator.logs(&id, query.tail).await?;
    Ok(Json(LogsResponse { lines }))
}

async fn list_sources(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.list_sources().await?))
}

async fn add_source(
    State(state): State<SharedState>,
    Json(body): Json<AddSourceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let source = state
        .registry
        .add_source(&body.name, &body.url, body.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(source)))
}

async fn remove_source(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.remove_source(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_registry(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.refresh_all().await?))
}

async fn search_registry(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.search(query.q.as_deref()).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrySection;
    use crate::plugins::db::{DbHandle, PluginDb};
    use crate::plugins::events::EventBus;
    use crate::plugins::orchestrator::OrchestratorSettings;
    use crate::plugins::runtime::fake::FakeRuntime;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        runtime: Arc<FakeRuntime>,
    }

    async fn test_app_with(range: std::ops::RangeInclusive<u16>, available: bool) -> TestApp {
        let db = DbHandle::new(PluginDb::new_in_memory().unwrap());
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_unavailable(!available);
        let registry =
            Arc::new(RegistryClient::new(db.clone(), &RegistrySection::default()).unwrap());
        let settings = OrchestratorSettings {
            port_range: range,
            health_interval: Duration::from_secs(3600),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Orchestrator::new(
            db,
            runtime.clone(),
            registry.clone(),
            EventBus::default(),
            settings,
        );
        orchestrator.boot().await;
        let state = Arc::new(AppState {
            orchestrator,
            registry,
        });
        TestApp {
            router: api_router().with_state(state),
            runtime,
        }
    }

    async fn test_app() -> TestApp {
        test_app_with(30000..=30010, true).await
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.router.clone().oneshot(request).await.unwrap()
    }

    fn manifest(id: &str) -> Value {
        json!({
            "id": id,
            "version": "1.0.0",
            "image": format!("ghcr.io/flowforge/{}:1.0.0", id),
            "port": 8080,
        })
    }

    async fn install(app: &TestApp, body: Value) -> InstallResponse {
        let response = send(app, "POST", "/api/plugins", Some(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response.into_body()).await
    }

    async fn error_code(response: Response) -> String {
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
        body["code"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_reports_readiness() {
        let app = test_app().await;
        let response = send(&app, "GET", "/api/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let status: Value = body_json(response.into_body()).await;
        assert_eq!(status["ready"], true);
        assert_eq!(status["docker_reachable"], true);
        assert_eq!(status["plugins"], 0);
    }

    #[tokio::test]
    async fn test_install_and_list() {
        let app = test_app().await;
        let created = install(
            &app,
            json!({"manifest": manifest("math"), "auto_start": true}),
        )
        .await;
        assert_eq!(created.status, PluginStatus::Running);
        assert_eq!(created.host_port, 30000);

        let response = send(&app, "GET", "/api/plugins", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let plugins: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0]["id"], created.id);
        assert_eq!(plugins[0]["status"], "running");
        assert_eq!(plugins[0]["forgehook_id"], "math");
    }

    #[tokio::test]
    async fn test_secrets_are_redacted() {
        let app = test_app().await;
        let mut manifest = manifest("mailer");
        manifest["environment"] = json!([
            {"name": "API_KEY", "required": true, "secret": true},
            {"name": "REGION"}
        ]);
        let created = install(
            &app,
            json!({
                "manifest": manifest,
                "env": {"API_KEY": "hunter2", "REGION": "eu"}
            }),
        )
        .await;

        let response = send(&app, "GET", &format!("/api/plugins/{}", created.id), None).await;
        let raw = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!String::from_utf8_lossy(&raw).contains("hunter2"));
        let summary: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(summary["env"]["REGION"], "eu");
        assert!(summary["env"].get("API_KEY").is_none());
        assert_eq!(summary["secrets"], json!(["API_KEY"]));
    }

    #[tokio::test]
    async fn test_install_requires_exactly_one_source() {
        let app = test_app().await;
        let response = send(&app, "POST", "/api/plugins", Some(json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "validation");

        let response = send(
            &app,
            "POST",
            "/api/plugins",
            Some(json!({"manifest": manifest("math"), "reference": "math"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_bad_request() {
        let app = test_app().await;
        let response = send(
            &app,
            "POST",
            "/api/plugins",
            Some(json!({"manifest": {"id": "math"}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "validation");
    }

    #[tokio::test]
    async fn test_missing_env_is_bad_request() {
        let app = test_app().await;
        let mut manifest = manifest("mailer");
        manifest["environment"] = json!([{"name": "SMTP_HOST", "required": true}]);
        let response = send(&app, "POST", "/api/plugins", Some(json!({"manifest": manifest}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("SMTP_HOST"));
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_not_found() {
        let app = test_app().await;
        for (method, uri) in [
            ("GET", "/api/plugins/nope"),
            ("POST", "/api/plugins/nope/start"),
            ("DELETE", "/api/plugins/nope"),
            ("GET", "/api/plugins/nope/logs"),
        ] {
            let response = send(&app, method, uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{} {}", method, uri);
            assert_eq!(error_code(response).await, "not_found");
        }
    }

    #[tokio::test]
    async fn test_invalid_state_is_conflict() {
        let app = test_app().await;
        let created = install(&app, json!({"manifest": manifest("math"), "auto_start": true})).await;
        let response = send(&app, "POST", &format!("/api/plugins/{}/start", created.id), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(response).await, "invalid_state");
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_service_unavailable() {
        let app = test_app_with(30000..=30000, true).await;
        install(&app, json!({"manifest": manifest("math")})).await;
        let response = send(
            &app,
            "POST",
            "/api/plugins",
            Some(json!({"manifest": manifest("text")})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "resource_exhausted");
    }

    #[tokio::test]
    async fn test_engine_down_is_service_unavailable() {
        let app = test_app_with(30000..=30010, false).await;
        let response = send(
            &app,
            "POST",
            "/api/plugins",
            Some(json!({"manifest": manifest("math")})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "runtime_unavailable");

        // Reads keep working.
        let response = send(&app, "GET", "/api/plugins", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&app, "GET", "/api/status", None).await;
        let status: Value = body_json(response.into_body()).await;
        assert_eq!(status["ready"], false);
    }

    #[tokio::test]
    async fn test_stop_start_restart_cycle() {
        let app = test_app().await;
        let created = install(&app, json!({"manifest": manifest("math"), "auto_start": true})).await;
        let base = format!("/api/plugins/{}", created.id);

        let response = send(&app, "POST", &format!("{}/stop", base), Some(json!({"timeout_secs": 5}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary: Value = body_json(response.into_body()).await;
        assert_eq!(summary["status"], "stopped");

        let response = send(&app, "POST", &format!("{}/start", base), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "POST", &format!("{}/restart", base), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary: Value = body_json(response.into_body()).await;
        assert_eq!(summary["status"], "running");

        let response = send(&app, "POST", &format!("{}/stop", base), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.runtime.stops().len(), 2);
    }

    #[tokio::test]
    async fn test_update_config() {
        let app = test_app().await;
        let created = install(&app, json!({"manifest": manifest("math")})).await;
        let response = send(
            &app,
            "PATCH",
            &format!("/api/plugins/{}/config", created.id),
            Some(json!({"config": {"precision": 4}, "env": {"MODE": "fast"}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary: Value = body_json(response.into_body()).await;
        assert_eq!(summary["config"]["precision"], 4);
        assert_eq!(summary["env"]["MODE"], "fast");
    }

    #[tokio::test]
    async fn test_uninstall_returns_no_content() {
        let app = test_app().await;
        let created = install(&app, json!({"manifest": manifest("math"), "auto_start": true})).await;
        let uri = format!("/api/plugins/{}", created.id);
        let response = send(&app, "DELETE", &uri, None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&app, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(app.runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_logs_endpoint() {
        let app = test_app().await;
        let created = install(&app, json!({"manifest": manifest("math")})).await;
        let response = send(
            &app,
            "GET",
            &format!("/api/plugins/{}/logs?tail=5", created.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["lines"], json!([]));
    }

    #[tokio::test]
    async fn test_registry_sources_and_search() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            json!({"plugins": [{"manifest": manifest("math"), "downloads": 10}]}).to_string(),
        )
        .unwrap();
        let app = test_app().await;

        let response = send(
            &app,
            "POST",
            "/api/registry/sources",
            Some(json!({"name": "local", "url": dir.path().to_str().unwrap(), "kind": "local"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let source: Value = body_json(response.into_body()).await;
        let source_id = source["id"].as_str().unwrap().to_string();

        let response = send(&app, "POST", "/api/registry/refresh", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let outcomes: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(outcomes[0]["plugin_count"], 1);

        let response = send(&app, "GET", "/api/registry/plugins?q=math", None).await;
        let entries: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["manifest"]["id"], "math");

        let response = send(&app, "GET", "/api/registry/sources", None).await;
        let sources: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(sources.len(), 1);

        let uri = format!("/api/registry/sources/{}", source_id);
        let response = send(&app, "DELETE", &uri, None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = send(&app, "DELETE", &uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_source_is_bad_request() {
        let app = test_app().await;
        let response = send(
            &app,
            "POST",
            "/api/registry/sources",
            Some(json!({"name": "bad", "url": "ftp://example.com/index.json", "kind": "url"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_source_is_bad_request() {
        let app = test_app().await;
        let body = json!({"name": "official", "url": "https://example.com/index.json"});
        let first = send(&app, "POST", "/api/registry/sources", Some(body.clone())).await;
        assert!(first.status().is_success());
        let second = send(&app, "POST", "/api/registry/sources", Some(body)).await;
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }
}
