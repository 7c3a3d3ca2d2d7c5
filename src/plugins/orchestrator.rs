//! The plugin lifecycle state machine.
//!
//! Every status change goes through [`Orchestrator::transition`], which
//! checks the transition table, persists, and only then publishes the
//! event. Lifecycle operations on one instance are serialised by a
//! per-instance `tokio::sync::Mutex`; different instances run concurrently.
//! Boot reconciliation is the one path that writes statuses directly; it
//! still publishes the corrected status once the write lands.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowforge_common::{DependencyKind, Manifest};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::db::DbHandle;
use super::events::{EventBus, EventKind, PluginEvent};
use super::health::{self, HealthTracker};
use super::logs::LogBuffer;
use super::models::{
    ConfigMap, HealthStatus, InstanceUpdate, Operation, PluginInstance, PluginStatus,
};
use super::reconcile::{Correction, plan_reconciliation};
use super::registry::ManifestResolver;
use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, managed_labels};
use crate::config::FlowforgeConfig;
use crate::errors::PluginError;

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub port_range: RangeInclusive<u16>,
    pub stop_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub log_buffer_lines: usize,
}

impl From<&FlowforgeConfig> for OrchestratorSettings {
    fn from(config: &FlowforgeConfig) -> Self {
        Self {
            port_range: config.ports.range(),
            stop_timeout: config.stop_timeout(),
            health_interval: Duration::from_secs(config.health.interval_secs),
            health_timeout: Duration::from_secs(config.health.timeout_secs),
            log_buffer_lines: config.docker.log_buffer_lines,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&FlowforgeConfig::default())
    }
}

/// Where the manifest of a new installation comes from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Manifest(Box<Manifest>),
    /// `id` or `id@version`, resolved through the registry.
    Reference(String),
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: ManifestSource,
    pub config: ConfigMap,
    pub env: HashMap<String, String>,
    pub auto_start: bool,
}

impl InstallRequest {
    pub fn manifest(manifest: Manifest) -> Self {
        Self::from_source(ManifestSource::Manifest(Box::new(manifest)))
    }

    pub fn reference(reference: impl Into<String>) -> Self {
        Self::from_source(ManifestSource::Reference(reference.into()))
    }

    fn from_source(source: ManifestSource) -> Self {
        Self {
            source,
            config: ConfigMap::new(),
            env: HashMap::new(),
            auto_start: false,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Readiness snapshot for `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub ready: bool,
    pub docker_reachable: bool,
    pub plugins: usize,
    pub running: usize,
    pub event_subscribers: usize,
}

/// A start attempt that failed, with the container it left behind.
struct LaunchFailure {
    error: PluginError,
    container_id: Option<String>,
    /// The previously recorded container could not be removed and is
    /// still owned by the instance.
    kept_previous: bool,
}

impl LaunchFailure {
    fn before_create(err: RuntimeError) -> Self {
        Self {
            error: err.into(),
            container_id: None,
            kept_previous: false,
        }
    }
}

/// Treat "already gone" as success.
fn ignore_not_found(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub struct Orchestrator {
    db: DbHandle,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<dyn ManifestResolver>,
    events: EventBus,
    settings: OrchestratorSettings,
    http: reqwest::Client,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Cancels the health and log tasks of a running instance.
    watchers: DashMap<String, CancellationToken>,
    health: DashMap<String, HealthTracker>,
    logs: DashMap<String, LogBuffer>,
    ready: AtomicBool,
    boot_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<dyn ManifestResolver>,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            runtime,
            resolver,
            events,
            settings,
            http: reqwest::Client::new(),
            locks: DashMap::new(),
            watchers: DashMap::new(),
            health: DashMap::new(),
            logs: DashMap::new(),
            ready: AtomicBool::new(false),
            boot_lock: Mutex::new(()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    // ── Readiness ─────────────────────────────────────────────────────

    /// Ping the engine and, when it answers, reconcile and mark ready.
    /// Returns the resulting readiness.
    pub async fn boot(self: &Arc<Self>) -> bool {
        let _boot = self.boot_lock.lock().await;
        if self.is_ready() {
            return true;
        }
        if !self.runtime.ping().await {
            warn!("Container runtime unreachable; plugin operations are disabled until it responds");
            return false;
        }
        if let Err(e) = self.reconcile_on_boot().await {
            error!(error = %e, "Boot reconciliation failed; staying not ready");
            return false;
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("Plugin orchestrator ready");
        true
    }

    /// Fail with `RuntimeUnavailable` unless the engine has answered at
    /// least once. A late engine is picked up here.
    async fn ensure_ready(self: &Arc<Self>) -> Result<(), PluginError> {
        if self.is_ready() || self.boot().await {
            Ok(())
        } else {
            Err(PluginError::RuntimeUnavailable(
                "container engine is not reachable".to_string(),
            ))
        }
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, PluginError> {
        let docker_reachable = self.runtime.ping().await;
        let instances = self.list().await?;
        Ok(OrchestratorStatus {
            ready: self.is_ready(),
            docker_reachable,
            plugins: instances.len(),
            running: instances
                .iter()
                .filter(|i| i.status == PluginStatus::Running)
                .count(),
            event_subscribers: self.events.subscriber_count(),
        })
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<PluginInstance>, PluginError> {
        Ok(self.db.call(|db| db.list_instances()).await?)
    }

    pub async fn get(&self, id: &str) -> Result<PluginInstance, PluginError> {
        let id = id.to_string();
        Ok(self.db.call(move |db| db.get_instance(&id)).await?)
    }

    /// The most recent buffered output lines of an instance, oldest first.
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> Result<Vec<String>, PluginError> {
        self.get(id).await?;
        Ok(self
            .logs
            .get(id)
            .map(|buffer| buffer.tail(tail))
            .unwrap_or_default())
    }

    // ── Lifecycle operations ──────────────────────────────────────────

    /// Install a plugin and optionally start it.
    ///
    /// Validation happens before anything is written. A failed auto-start
    /// does not fail the install: the returned instance is in `error` with
    /// the message recorded.
    pub async fn install(
        self: &Arc<Self>,
        request: InstallRequest,
    ) -> Result<PluginInstance, PluginError> {
        self.ensure_ready().await?;
        let InstallRequest {
            source,
            config,
            env,
            auto_start,
        } = request;

        let manifest = match source {
            ManifestSource::Manifest(manifest) => *manifest,
            ManifestSource::Reference(reference) => self.resolver.resolve(&reference).await?,
        };
        manifest.validate()?;
        let missing = manifest.missing_required_env(&env);
        if !missing.is_empty() {
            return Err(PluginError::Validation(
                missing
                    .into_iter()
                    .map(|name| format!("missing required environment variable {}", name))
                    .collect(),
            ));
        }
        self.check_dependencies(&manifest).await;

        let instance = PluginInstance::new(manifest, config, env);
        let range = self.settings.port_range.clone();
        let instance = self
            .db
            .call(move |db| db.install_with_port(instance, range))
            .await?;

        let lock = self.lock_for(&instance.id);
        let _guard = lock.lock().await;

        info!(
            instance_id = %instance.id,
            forgehook = %instance.manifest.key(),
            host_port = instance.host_port,
            "Installing plugin"
        );
        self.events.publish(
            PluginEvent::new(EventKind::Installing, &instance.id).with_data(json!({
                "forgehook_id": instance.forgehook_id,
                "version": instance.manifest.version,
                "host_port": instance.host_port,
            })),
        );

        let installed = self
            .settle(&instance, PluginStatus::Installed, InstanceUpdate::default(), None)
            .await?;
        if let Some(hook) = &installed.manifest.hooks.post_install {
            debug!(instance_id = %installed.id, hook = %hook, "post_install hook declared");
        }

        if !auto_start {
            return Ok(installed);
        }
        match self.start_locked(installed).await {
            Ok(running) => Ok(running),
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Auto-start after install failed");
                self.get(&instance.id).await
            }
        }
    }

    pub async fn start(self: &Arc<Self>, id: &str) -> Result<PluginInstance, PluginError> {
        self.ensure_ready().await?;
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        guard(&instance, Operation::Start)?;
        self.start_locked(instance).await
    }

    /// Stop a running plugin. `timeout` defaults to the configured grace
    /// period before the engine kills the container.
    pub async fn stop(
        self: &Arc<Self>,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<PluginInstance, PluginError> {
        self.ensure_ready().await?;
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        guard(&instance, Operation::Stop)?;
        self.stop_locked(instance, timeout.unwrap_or(self.settings.stop_timeout))
            .await
    }

    /// Stop (when running) then start, under one lock acquisition.
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<PluginInstance, PluginError> {
        self.ensure_ready().await?;
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let mut instance = self.get(id).await?;
        guard(&instance, Operation::Restart)?;
        if instance.status == PluginStatus::Running {
            instance = self.stop_locked(instance, self.settings.stop_timeout).await?;
        }
        self.start_locked(instance).await
    }

    pub async fn uninstall(self: &Arc<Self>, id: &str) -> Result<(), PluginError> {
        self.ensure_ready().await?;
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let mut instance = self.get(id).await?;
        guard(&instance, Operation::Uninstall)?;
        if instance.status == PluginStatus::Running {
            instance = self.stop_locked(instance, self.settings.stop_timeout).await?;
        }

        let uninstalling = self
            .transition(&instance, PluginStatus::Uninstalling, InstanceUpdate::default(), None)
            .await?;
        info!(instance_id = %id, "Uninstalling plugin");
        self.cancel_watchers(id);

        if let Some(container_id) = &uninstalling.container_id
            && let Err(e) = ignore_not_found(self.runtime.remove(container_id).await)
        {
            let err = PluginError::from(e);
            self.fail(&uninstalling, &err.to_string(), false).await;
            return Err(err);
        }

        if let Err(e) = self.finish_uninstall(id).await {
            self.fail(&uninstalling, &e.to_string(), false).await;
            return Err(e);
        }
        Ok(())
    }

    /// Merge new configuration and environment into a stopped instance.
    ///
    /// Keys in `config` overwrite; a `null` value removes the key. Keys in
    /// `env` overwrite; an empty value removes the variable. Required
    /// variables are checked against the merged result.
    pub async fn update_config(
        &self,
        id: &str,
        config: Option<ConfigMap>,
        env: Option<HashMap<String, String>>,
    ) -> Result<PluginInstance, PluginError> {
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        guard(&instance, Operation::UpdateConfig)?;

        let mut merged_config = instance.config.clone();
        for (key, value) in config.unwrap_or_default() {
            if value.is_null() {
                merged_config.remove(&key);
            } else {
                merged_config.insert(key, value);
            }
        }
        let mut merged_env = instance.env.clone();
        for (name, value) in env.unwrap_or_default() {
            if value.is_empty() {
                merged_env.remove(&name);
            } else {
                merged_env.insert(name, value);
            }
        }

        let missing = instance.manifest.missing_required_env(&merged_env);
        if !missing.is_empty() {
            return Err(PluginError::Validation(
                missing
                    .into_iter()
                    .map(|name| format!("missing required environment variable {}", name))
                    .collect(),
            ));
        }

        let update = InstanceUpdate {
            config: Some(merged_config),
            env: Some(merged_env),
            ..Default::default()
        };
        let owned = id.to_string();
        let updated = self
            .db
            .call(move |db| db.update_instance(&owned, &update))
            .await?;
        info!(instance_id = %id, "Updated plugin configuration");
        Ok(updated)
    }

    // ── Reconciliation ────────────────────────────────────────────────

    /// Align recorded statuses with the containers the engine reports,
    /// then resume health polling for everything that is running.
    pub async fn reconcile_on_boot(self: &Arc<Self>) -> Result<Vec<Correction>, PluginError> {
        let stored = self.list().await?;
        let observed = self.runtime.list_managed().await?;
        let corrections = plan_reconciliation(&stored, &observed);

        for correction in &corrections {
            let lock = self.lock_for(correction.instance_id());
            let _guard = lock.lock().await;
            if let Err(e) = self.apply_correction(correction).await {
                error!(
                    instance_id = %correction.instance_id(),
                    error = %e,
                    "Failed to apply reconciliation correction"
                );
            }
        }

        for instance in self.list().await? {
            if instance.status == PluginStatus::Running {
                self.spawn_watchers(&instance);
            }
        }
        info!(corrections = corrections.len(), "Reconciliation complete");
        Ok(corrections)
    }

    async fn apply_correction(&self, correction: &Correction) -> Result<(), PluginError> {
        let update = match correction {
            Correction::MarkRunning { container_id, .. } => {
                InstanceUpdate::status(PluginStatus::Running)
                    .with_container_id(Some(container_id.clone()))
                    .clear_error()
            }
            Correction::MarkStopped {
                clear_container, ..
            } => {
                let mut update =
                    InstanceUpdate::status(PluginStatus::Stopped).with_stopped_at(Utc::now());
                if *clear_container {
                    update = update.with_container_id(None);
                }
                update.health_status = Some(HealthStatus::Unknown);
                update
            }
            Correction::MarkError { message, .. } => {
                InstanceUpdate::failed(message.clone()).with_container_id(None)
            }
            Correction::FinishUninstall {
                instance_id,
                container_id,
            } => {
                warn!(instance_id = %instance_id, "Finishing interrupted uninstall");
                if let Some(container_id) = container_id {
                    ignore_not_found(self.runtime.remove(container_id).await)?;
                }
                return self.finish_uninstall(instance_id).await;
            }
        };

        warn!(
            instance_id = %correction.instance_id(),
            correction = ?correction,
            "Correcting recorded plugin status"
        );
        let id = correction.instance_id().to_string();
        let corrected = self
            .db
            .call(move |db| db.update_instance(&id, &update))
            .await?;

        let mut data = json!({ "reconciled": true });
        if let Some(message) = &corrected.error {
            data["error"] = json!(message);
        }
        self.events.publish(
            PluginEvent::new(EventKind::for_status(corrected.status), &corrected.id)
                .with_data(data),
        );
        Ok(())
    }

    // ── Health ────────────────────────────────────────────────────────

    /// Run one health probe. Skipped (returns `None`) while a lifecycle
    /// operation holds the instance lock, when the instance is not
    /// running, or when the engine has no verdict yet.
    pub async fn check_health(&self, id: &str) -> Option<HealthStatus> {
        let lock = self.lock_existing(id).await.ok()?;
        let Ok(_guard) = lock.try_lock() else {
            debug!(instance_id = %id, "Lifecycle operation in progress; skipping health check");
            return None;
        };

        let instance = self.get(id).await.ok()?;
        if instance.status != PluginStatus::Running {
            return None;
        }
        let container_id = instance.container_id.as_deref()?;
        let timeout = instance
            .manifest
            .health_check
            .as_ref()
            .and_then(|h| h.timeout_secs)
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.health_timeout);

        let verdict = health::probe(
            self.runtime.as_ref(),
            &self.http,
            container_id,
            instance.host_port,
            instance.manifest.health_path(),
            timeout,
        )
        .await?;
        let threshold = instance
            .manifest
            .health_check
            .as_ref()
            .and_then(|h| h.retries)
            .unwrap_or(health::FAILURE_THRESHOLD);
        let status = self
            .health
            .entry(id.to_string())
            .or_insert_with(|| HealthTracker::resume(instance.health_status, threshold))
            .record(verdict);

        let update = InstanceUpdate {
            last_health_check: Some(Utc::now()),
            health_status: Some(status),
            ..Default::default()
        };
        let owned = id.to_string();
        if let Err(e) = self
            .db
            .call(move |db| db.update_instance(&owned, &update))
            .await
        {
            warn!(instance_id = %id, error = %e, "Failed to record health check");
            return None;
        }

        if status != instance.health_status {
            info!(
                instance_id = %id,
                previous = %instance.health_status,
                health = %status,
                "Plugin health changed"
            );
            self.events.publish(PluginEvent::new(EventKind::Health, id).with_data(json!({
                "health_status": status,
                "previous": instance.health_status,
            })));
        }
        Some(status)
    }

    /// Cancel every background task. Containers keep running.
    pub fn shutdown(&self) {
        for entry in self.watchers.iter() {
            entry.value().cancel();
        }
        self.watchers.clear();
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// The operation lock of a stored instance. Unknown ids fail with
    /// `NotFound` and leave no entry behind.
    async fn lock_existing(&self, id: &str) -> Result<Arc<Mutex<()>>, PluginError> {
        if let Some(lock) = self.locks.get(id) {
            return Ok(lock.clone());
        }
        self.get(id).await?;
        Ok(self.lock_for(id))
    }

    /// Move an instance to `next`, persist `update` with it, then publish.
    async fn transition(
        &self,
        instance: &PluginInstance,
        next: PluginStatus,
        mut update: InstanceUpdate,
        data: Option<Value>,
    ) -> Result<PluginInstance, PluginError> {
        if !instance.status.can_transition_to(next) {
            return Err(PluginError::IllegalTransition {
                id: instance.id.clone(),
                from: instance.status,
                to: next,
            });
        }
        update.status = Some(next);
        let id = instance.id.clone();
        let updated = self
            .db
            .call(move |db| db.update_instance(&id, &update))
            .await?;

        debug!(instance_id = %updated.id, from = %instance.status, to = %next, "Plugin status changed");
        let mut event = PluginEvent::new(EventKind::for_status(next), &updated.id);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.events.publish(event);
        Ok(updated)
    }

    /// Leave a transitional status. If that fails the instance is moved to
    /// `error`, so no operation returns with it still in flight.
    async fn settle(
        &self,
        instance: &PluginInstance,
        next: PluginStatus,
        update: InstanceUpdate,
        data: Option<Value>,
    ) -> Result<PluginInstance, PluginError> {
        match self.transition(instance, next, update, data).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                self.fail(instance, &e.to_string(), false).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, instance: &PluginInstance, message: &str, clear_container: bool) {
        error!(
            instance_id = %instance.id,
            status = %instance.status,
            error = %message,
            "Plugin operation failed"
        );
        let mut update = InstanceUpdate::failed(message);
        if clear_container {
            update = update.with_container_id(None);
        }
        if let Err(e) = self
            .transition(
                instance,
                PluginStatus::Error,
                update,
                Some(json!({ "error": message })),
            )
            .await
        {
            error!(instance_id = %instance.id, error = %e, "Failed to record plugin error");
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        instance: PluginInstance,
    ) -> Result<PluginInstance, PluginError> {
        let starting = self
            .transition(
                &instance,
                PluginStatus::Starting,
                InstanceUpdate::default().clear_error(),
                None,
            )
            .await?;
        if let Some(hook) = &starting.manifest.hooks.pre_start {
            debug!(instance_id = %starting.id, hook = %hook, "pre_start hook declared");
        }

        let container_id = match self.launch(&starting).await {
            Ok(container_id) => container_id,
            Err(failure) => {
                if let Some(container_id) = &failure.container_id {
                    self.discard_container(container_id).await;
                }
                self.fail(&starting, &failure.error.to_string(), !failure.kept_previous)
                    .await;
                return Err(failure.error);
            }
        };

        let update = InstanceUpdate::default()
            .with_container_id(Some(container_id.clone()))
            .with_started_at(Utc::now())
            .clear_error();
        let data = json!({
            "container_id": container_id,
            "host_port": starting.host_port,
        });
        let running = match self
            .transition(&starting, PluginStatus::Running, update, Some(data))
            .await
        {
            Ok(running) => running,
            Err(e) => {
                self.discard_container(&container_id).await;
                self.fail(&starting, &e.to_string(), true).await;
                return Err(e);
            }
        };

        info!(
            instance_id = %running.id,
            container_id = %container_id,
            host_port = running.host_port,
            "Plugin started"
        );
        if let Some(hook) = &running.manifest.hooks.post_start {
            debug!(instance_id = %running.id, hook = %hook, "post_start hook declared");
        }
        self.spawn_watchers(&running);
        Ok(running)
    }

    /// Pull if needed, create and start the container.
    async fn launch(&self, instance: &PluginInstance) -> Result<String, LaunchFailure> {
        // A stopped instance still owns its previous container.
        if let Some(previous) = &instance.container_id {
            ignore_not_found(self.runtime.remove(previous).await).map_err(|e| LaunchFailure {
                error: e.into(),
                container_id: None,
                kept_previous: true,
            })?;
        }

        let image = instance.manifest.image.reference();
        let present = self
            .runtime
            .image_exists(&image)
            .await
            .map_err(LaunchFailure::before_create)?;
        if !present {
            info!(instance_id = %instance.id, image = %image, "Pulling image");
            self.runtime
                .pull_image(&image)
                .await
                .map_err(LaunchFailure::before_create)?;
        }

        let spec = container_spec(instance);
        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(LaunchFailure::before_create)?;
        if let Err(e) = self.runtime.start(&container_id).await {
            return Err(LaunchFailure {
                error: e.into(),
                container_id: Some(container_id),
                kept_previous: false,
            });
        }
        Ok(container_id)
    }

    async fn discard_container(&self, container_id: &str) {
        if let Err(e) = ignore_not_found(self.runtime.remove(container_id).await) {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }
    }

    async fn stop_locked(
        &self,
        instance: PluginInstance,
        timeout: Duration,
    ) -> Result<PluginInstance, PluginError> {
        let stopping = self
            .transition(&instance, PluginStatus::Stopping, InstanceUpdate::default(), None)
            .await?;
        if let Some(hook) = &stopping.manifest.hooks.pre_stop {
            debug!(instance_id = %stopping.id, hook = %hook, "pre_stop hook declared");
        }
        self.cancel_watchers(&stopping.id);

        if let Some(container_id) = &stopping.container_id
            && let Err(e) = ignore_not_found(self.runtime.stop(container_id, timeout).await)
        {
            let err = PluginError::from(e);
            self.fail(&stopping, &err.to_string(), false).await;
            return Err(err);
        }

        let mut update = InstanceUpdate::default().with_stopped_at(Utc::now());
        update.health_status = Some(HealthStatus::Unknown);
        let stopped = self
            .settle(&stopping, PluginStatus::Stopped, update, None)
            .await?;
        self.health.remove(&stopped.id);
        info!(instance_id = %stopped.id, "Plugin stopped");
        Ok(stopped)
    }

    async fn finish_uninstall(&self, id: &str) -> Result<(), PluginError> {
        let owned = id.to_string();
        self.db.call(move |db| db.remove_instance(&owned)).await?;
        self.cancel_watchers(id);
        self.health.remove(id);
        self.logs.remove(id);
        self.locks.remove(id);
        self.events.publish(PluginEvent::new(EventKind::Uninstalled, id));
        info!(instance_id = %id, "Plugin uninstalled");
        Ok(())
    }

    async fn check_dependencies(&self, manifest: &Manifest) {
        let required: Vec<&str> = manifest
            .dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Plugin && !d.optional)
            .map(|d| d.id.as_str())
            .collect();
        if required.is_empty() {
            return;
        }
        match self.list().await {
            Ok(instances) => {
                for dependency in required {
                    if !instances.iter().any(|i| i.forgehook_id == dependency) {
                        warn!(
                            forgehook = %manifest.id,
                            dependency = %dependency,
                            "Plugin dependency is not installed"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not check plugin dependencies"),
        }
    }

    // ── Background tasks ──────────────────────────────────────────────

    fn spawn_watchers(self: &Arc<Self>, instance: &PluginInstance) {
        let Some(container_id) = instance.container_id.clone() else {
            return;
        };
        let token = CancellationToken::new();
        if let Some(previous) = self.watchers.insert(instance.id.clone(), token.clone()) {
            previous.cancel();
        }
        self.logs
            .entry(instance.id.clone())
            .or_insert_with(|| LogBuffer::new(self.settings.log_buffer_lines));

        let every = instance
            .manifest
            .health_check
            .as_ref()
            .and_then(|h| h.interval_secs)
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.health_interval);

        let orchestrator = Arc::clone(self);
        let id = instance.id.clone();
        let cancel = token.clone();
        tokio::spawn(async move { orchestrator.poll_health(id, every, cancel).await });

        let orchestrator = Arc::clone(self);
        let id = instance.id.clone();
        tokio::spawn(async move { orchestrator.capture_logs(id, container_id, token).await });
    }

    fn cancel_watchers(&self, id: &str) {
        if let Some((_, token)) = self.watchers.remove(id) {
            token.cancel();
        }
    }

    async fn poll_health(self: Arc<Self>, id: String, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_health(&id).await;
                }
            }
        }
        debug!(instance_id = %id, "Health polling stopped");
    }

    async fn capture_logs(self: Arc<Self>, id: String, container_id: String, cancel: CancellationToken) {
        let mut stream = self.runtime.stream_logs(&container_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(line)) => self.record_log_line(&id, line),
                    Some(Err(e)) => {
                        debug!(instance_id = %id, error = %e, "Log stream failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!(instance_id = %id, "Log capture stopped");
    }

    fn record_log_line(&self, id: &str, line: String) {
        if let Some(mut buffer) = self.logs.get_mut(id) {
            buffer.push(line.clone());
        }
        self.events
            .publish(PluginEvent::new(EventKind::Log, id).with_data(json!({ "line": line })));
    }
}

fn guard(instance: &PluginInstance, operation: Operation) -> Result<(), PluginError> {
    if instance.status.permits(operation) {
        Ok(())
    } else {
        Err(PluginError::InvalidState {
            id: instance.id.clone(),
            status: instance.status,
            operation,
        })
    }
}

/// Container definition for an instance: published port bound on
/// loopback, manifest defaults overlaid with the instance env, labels and
/// resource limits.
pub fn container_spec(instance: &PluginInstance) -> ContainerSpec {
    let manifest = &instance.manifest;
    ContainerSpec {
        name: instance.container_name.clone(),
        image: manifest.image.reference(),
        env: manifest.merged_env(&instance.env),
        container_port: manifest.port,
        host_port: instance.host_port,
        labels: managed_labels(&instance.id, &instance.forgehook_id),
        memory_bytes: manifest.resources.memory_bytes(),
        nano_cpus: manifest.resources.nano_cpus(),
    }
}
