use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;

use super::models::*;

/// Typed failures raised inside the store's `anyhow` chains.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("No free host port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}

fn instance_not_found(id: &str) -> anyhow::Error {
    StoreError::NotFound {
        kind: "Plugin instance",
        id: id.to_string(),
    }
    .into()
}

fn source_not_found(id: &str) -> anyhow::Error {
    StoreError::NotFound {
        kind: "Registry source",
        id: id.to_string(),
    }
    .into()
}

/// Async-safe handle to the plugin database.
///
/// Wraps `PluginDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PluginDb>>,
}

impl DbHandle {
    pub fn new(db: PluginDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PluginDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PluginDb {
    conn: Connection,
}

impl PluginDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS plugin_instances (
                    id TEXT PRIMARY KEY,
                    forgehook_id TEXT NOT NULL,
                    manifest TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'installing',
                    container_id TEXT,
                    container_name TEXT NOT NULL,
                    host_port INTEGER NOT NULL,
                    config TEXT NOT NULL DEFAULT '{}',
                    env TEXT NOT NULL DEFAULT '{}',
                    installed_at TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT,
                    last_health_check TEXT,
                    health_status TEXT NOT NULL DEFAULT 'unknown',
                    error TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_plugin_instances_port
                    ON plugin_instances(host_port);
                CREATE INDEX IF NOT EXISTS idx_plugin_instances_forgehook
                    ON plugin_instances(forgehook_id);

                CREATE TABLE IF NOT EXISTS registry_sources (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    index_json TEXT,
                    fetched_at TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_registry_sources_url
                    ON registry_sources(url);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Plugin instances ──────────────────────────────────────────────

    pub fn create_instance(&self, instance: &PluginInstance) -> Result<()> {
        insert_instance(&self.conn, instance)
    }

    /// Reserve the lowest free host port in `range` and insert the
    /// instance with it, in one transaction. The UNIQUE index on
    /// `host_port` rejects any reservation that slips past the scan.
    pub fn install_with_port(
        &self,
        mut instance: PluginInstance,
        range: RangeInclusive<u16>,
    ) -> Result<PluginInstance> {
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let in_use = query_ports(&tx)?;
        let port = range
            .clone()
            .find(|p| !in_use.contains(p))
            .ok_or(StoreError::PortsExhausted {
                start: *range.start(),
                end: *range.end(),
            })?;
        instance.host_port = port;
        insert_instance(&tx, &instance)?;

        tx.commit().context("Failed to commit port reservation")?;
        Ok(instance)
    }

    pub fn list_instances(&self) -> Result<Vec<PluginInstance>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM plugin_instances ORDER BY installed_at, id",
                INSTANCE_COLUMNS
            ))
            .context("Failed to prepare list_instances")?;
        let rows = stmt
            .query_map([], InstanceRow::from_row)
            .context("Failed to query plugin instances")?;
        let mut instances = Vec::new();
        for row in rows {
            let r = row.context("Failed to read plugin instance row")?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    pub fn get_instance(&self, id: &str) -> Result<PluginInstance> {
        load_instance(&self.conn, id)?.ok_or_else(|| instance_not_found(id))
    }

    /// Atomic read-modify-write of one instance.
    pub fn update_instance(&self, id: &str, update: &InstanceUpdate) -> Result<PluginInstance> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let mut instance = load_instance(&tx, id)?.ok_or_else(|| instance_not_found(id))?;
        update.apply(&mut instance);
        write_instance(&tx, &instance)?;

        tx.commit().context("Failed to commit instance update")?;
        Ok(instance)
    }

    pub fn remove_instance(&self, id: &str) -> Result<()> {
        let count = self
            .conn
            .execute("DELETE FROM plugin_instances WHERE id = ?1", params![id])
            .context("Failed to delete plugin instance")?;
        if count == 0 {
            return Err(instance_not_found(id));
        }
        Ok(())
    }

    pub fn ports_in_use(&self) -> Result<Vec<u16>> {
        query_ports(&self.conn)
    }

    // ── Registry sources ──────────────────────────────────────────────

    /// Insert a source, or update name/url/kind/enabled of an existing id.
    /// The cached index is left alone.
    pub fn upsert_source(&self, source: &RegistrySource) -> Result<RegistrySource> {
        self.conn
            .execute(
                "INSERT INTO registry_sources (id, name, url, kind, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    url = excluded.url,
                    kind = excluded.kind,
                    enabled = excluded.enabled",
                params![
                    source.id,
                    source.name,
                    source.url,
                    source.kind.as_str(),
                    source.enabled
                ],
            )
            .context("Failed to upsert registry source")?;
        self.get_source(&source.id)
    }

    pub fn list_sources(&self) -> Result<Vec<RegistrySource>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, url, kind, enabled, index_json, fetched_at, last_error
                 FROM registry_sources ORDER BY created_at, name",
            )
            .context("Failed to prepare list_sources")?;
        let rows = stmt
            .query_map([], SourceRow::from_row)
            .context("Failed to query registry sources")?;
        let mut sources = Vec::new();
        for row in rows {
            let r = row.context("Failed to read registry source row")?;
            sources.push(r.into_source()?.0);
        }
        Ok(sources)
    }

    pub fn get_source(&self, id: &str) -> Result<RegistrySource> {
        self.conn
            .query_row(
                "SELECT id, name, url, kind, enabled, index_json, fetched_at, last_error
                 FROM registry_sources WHERE id = ?1",
                params![id],
                SourceRow::from_row,
            )
            .optional()
            .context("Failed to query registry source")?
            .ok_or_else(|| source_not_found(id))?
            .into_source()
            .map(|(source, _)| source)
    }

    pub fn find_source_by_url(&self, url: &str) -> Result<Option<RegistrySource>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, url, kind, enabled, index_json, fetched_at, last_error
                 FROM registry_sources WHERE url = ?1",
                params![url],
                SourceRow::from_row,
            )
            .optional()
            .context("Failed to query registry source by url")?;
        row.map(|r| r.into_source().map(|(source, _)| source))
            .transpose()
    }

    pub fn delete_source(&self, id: &str) -> Result<()> {
        let count = self
            .conn
            .execute("DELETE FROM registry_sources WHERE id = ?1", params![id])
            .context("Failed to delete registry source")?;
        if count == 0 {
            return Err(source_not_found(id));
        }
        Ok(())
    }

    /// Cache a freshly fetched index and clear any previous fetch error.
    pub fn store_index(
        &self,
        id: &str,
        index: &RegistryIndex,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_string(index).context("Failed to serialize registry index")?;
        let count = self
            .conn
            .execute(
                "UPDATE registry_sources SET index_json = ?1, fetched_at = ?2, last_error = NULL
                 WHERE id = ?3",
                params![json, fetched_at.to_rfc3339(), id],
            )
            .context("Failed to store registry index")?;
        if count == 0 {
            return Err(source_not_found(id));
        }
        Ok(())
    }

    /// Record a failed fetch. The previously cached index stays usable.
    pub fn store_fetch_error(&self, id: &str, message: &str) -> Result<()> {
        let count = self
            .conn
            .execute(
                "UPDATE registry_sources SET last_error = ?1 WHERE id = ?2",
                params![message, id],
            )
            .context("Failed to store registry fetch error")?;
        if count == 0 {
            return Err(source_not_found(id));
        }
        Ok(())
    }

    /// The cached index of a source, if one has been fetched.
    pub fn cached_index(&self, id: &str) -> Result<Option<(RegistryIndex, DateTime<Utc>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, url, kind, enabled, index_json, fetched_at, last_error
                 FROM registry_sources WHERE id = ?1",
                params![id],
                SourceRow::from_row,
            )
            .optional()
            .context("Failed to query registry source")?
            .ok_or_else(|| source_not_found(id))?;
        let (source, index) = row.into_source()?;
        Ok(index.zip(source.fetched_at))
    }

    /// Every cached plugin across enabled sources.
    pub fn cached_plugins(&self) -> Result<Vec<RegistryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, url, kind, enabled, index_json, fetched_at, last_error
                 FROM registry_sources WHERE enabled = 1 ORDER BY created_at, name",
            )
            .context("Failed to prepare cached_plugins")?;
        let rows = stmt
            .query_map([], SourceRow::from_row)
            .context("Failed to query registry sources")?;
        let mut entries = Vec::new();
        for row in rows {
            let (source, index) = row.context("Failed to read registry source row")?.into_source()?;
            for plugin in index.map(|i| i.plugins).unwrap_or_default() {
                entries.push(RegistryEntry {
                    source_id: source.id.clone(),
                    source_name: source.name.clone(),
                    plugin,
                });
            }
        }
        Ok(entries)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const INSTANCE_COLUMNS: &str = "id, forgehook_id, manifest, status, container_id, container_name, \
     host_port, config, env, installed_at, started_at, stopped_at, last_health_check, \
     health_status, error";

/// Raw row from `plugin_instances`, converted after the query so JSON and
/// enum parse failures surface as `anyhow` errors with context.
struct InstanceRow {
    id: String,
    forgehook_id: String,
    manifest: String,
    status: String,
    container_id: Option<String>,
    container_name: String,
    host_port: u16,
    config: String,
    env: String,
    installed_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    last_health_check: Option<String>,
    health_status: String,
    error: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            forgehook_id: row.get(1)?,
            manifest: row.get(2)?,
            status: row.get(3)?,
            container_id: row.get(4)?,
            container_name: row.get(5)?,
            host_port: row.get(6)?,
            config: row.get(7)?,
            env: row.get(8)?,
            installed_at: row.get(9)?,
            started_at: row.get(10)?,
            stopped_at: row.get(11)?,
            last_health_check: row.get(12)?,
            health_status: row.get(13)?,
            error: row.get(14)?,
        })
    }

    fn into_instance(self) -> Result<PluginInstance> {
        let status = PluginStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Bad status for instance {}", self.id))?;
        let health_status = HealthStatus::from_str(&self.health_status)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Bad health status for instance {}", self.id))?;
        let manifest = serde_json::from_str(&self.manifest)
            .with_context(|| format!("Bad manifest JSON for instance {}", self.id))?;
        let config: ConfigMap = serde_json::from_str(&self.config)
            .with_context(|| format!("Bad config JSON for instance {}", self.id))?;
        let env: HashMap<String, String> = serde_json::from_str(&self.env)
            .with_context(|| format!("Bad env JSON for instance {}", self.id))?;

        Ok(PluginInstance {
            installed_at: parse_time(&self.installed_at)?,
            started_at: parse_opt_time(self.started_at.as_deref())?,
            stopped_at: parse_opt_time(self.stopped_at.as_deref())?,
            last_health_check: parse_opt_time(self.last_health_check.as_deref())?,
            id: self.id,
            forgehook_id: self.forgehook_id,
            manifest,
            status,
            container_id: self.container_id,
            container_name: self.container_name,
            host_port: self.host_port,
            config,
            env,
            health_status,
            error: self.error,
        })
    }
}

struct SourceRow {
    id: String,
    name: String,
    url: String,
    kind: String,
    enabled: bool,
    index_json: Option<String>,
    fetched_at: Option<String>,
    last_error: Option<String>,
}

impl SourceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            kind: row.get(3)?,
            enabled: row.get(4)?,
            index_json: row.get(5)?,
            fetched_at: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_source(self) -> Result<(RegistrySource, Option<RegistryIndex>)> {
        let kind = SourceKind::from_str(&self.kind)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Bad kind for registry source {}", self.id))?;
        let index: Option<RegistryIndex> = self
            .index_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Bad cached index for registry source {}", self.id))?;
        let source = RegistrySource {
            fetched_at: parse_opt_time(self.fetched_at.as_deref())?,
            plugin_count: index.as_ref().map_or(0, |i| i.plugins.len()),
            id: self.id,
            name: self.name,
            url: self.url,
            kind,
            enabled: self.enabled,
            last_error: self.last_error,
        };
        Ok((source, index))
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Bad timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_opt_time(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_time).transpose()
}

fn query_ports(conn: &Connection) -> Result<Vec<u16>> {
    let mut stmt = conn
        .prepare("SELECT host_port FROM plugin_instances ORDER BY host_port")
        .context("Failed to prepare ports_in_use")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, u16>(0))
        .context("Failed to query ports in use")?;
    let mut ports = Vec::new();
    for row in rows {
        ports.push(row.context("Failed to read port row")?);
    }
    Ok(ports)
}

fn load_instance(conn: &Connection, id: &str) -> Result<Option<PluginInstance>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM plugin_instances WHERE id = ?1", INSTANCE_COLUMNS),
            params![id],
            InstanceRow::from_row,
        )
        .optional()
        .context("Failed to query plugin instance")?;
    row.map(InstanceRow::into_instance).transpose()
}

fn insert_instance(conn: &Connection, instance: &PluginInstance) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO plugin_instances ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            INSTANCE_COLUMNS
        ),
        params![
            instance.id,
            instance.forgehook_id,
            serde_json::to_string(&instance.manifest).context("Failed to serialize manifest")?,
            instance.status.as_str(),
            instance.container_id,
            instance.container_name,
            instance.host_port,
            serde_json::to_string(&instance.config).context("Failed to serialize config")?,
            serde_json::to_string(&instance.env).context("Failed to serialize env")?,
            instance.installed_at.to_rfc3339(),
            instance.started_at.map(|t| t.to_rfc3339()),
            instance.stopped_at.map(|t| t.to_rfc3339()),
            instance.last_health_check.map(|t| t.to_rfc3339()),
            instance.health_status.as_str(),
            instance.error,
        ],
    )
    .with_context(|| format!("Failed to insert plugin instance {}", instance.id))?;
    Ok(())
}

fn write_instance(tx: &Transaction<'_>, instance: &PluginInstance) -> Result<()> {
    tx.execute(
        "UPDATE plugin_instances SET
            status = ?1, container_id = ?2, config = ?3, env = ?4, started_at = ?5,
            stopped_at = ?6, last_health_check = ?7, health_status = ?8, error = ?9
         WHERE id = ?10",
        params![
            instance.status.as_str(),
            instance.container_id,
            serde_json::to_string(&instance.config).context("Failed to serialize config")?,
            serde_json::to_string(&instance.env).context("Failed to serialize env")?,
            instance.started_at.map(|t| t.to_rfc3339()),
            instance.stopped_at.map(|t| t.to_rfc3339()),
            instance.last_health_check.map(|t| t.to_rfc3339()),
            instance.health_status.as_str(),
            instance.error,
            instance.id,
        ],
    )
    .with_context(|| format!("Failed to update plugin instance {}", instance.id))?;
    Ok(())
}
