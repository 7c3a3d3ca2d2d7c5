//! ForgeHook plugin lifecycle back-end.
//!
//! ## Overview
//!
//! A ForgeHook is a containerised microservice described by a manifest.
//! This subsystem installs, starts, stops, restarts and uninstalls plugin
//! instances as Docker containers, tracks their state in SQLite, reports
//! their health, and pushes every lifecycle change to WebSocket clients.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)          │
//! │   (UI)   │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (event stream, ping/pong)          │
//!                       │         │                                        │
//!                       │         │ install / start / stop / uninstall     │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (state machine, per-id locks)  │
//!                       │    │        │          │            │            │
//!                       │    v        v          v            v            │
//!                       │  db.rs  runtime.rs  registry.rs  events.rs       │
//!                       │ (SQLite) (trait)    (indexes)    (broadcast)     │
//!                       │             │                                    │
//!                       │             v                                    │
//!                       │         docker.rs  (bollard)                     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                           |
//! |-------------|----------------------------------------------------------|
//! | `models`    | `PluginInstance`, `PluginStatus` transition table        |
//! | `health`    | Probe + three-strike `HealthTracker`                     |
//! | `logs`      | Bounded per-instance `LogBuffer`                         |
//! | `reconcile` | Pure boot-time planner comparing store and engine        |
//!
//! ## Typical Request Flow (install with `auto_start`)
//!
//! 1. `POST /api/plugins` → `api::install_plugin()`
//! 2. The manifest is taken from the body or resolved through
//!    `RegistryClient` (`id` or `id@version`) and validated together with
//!    the required environment.
//! 3. `PluginDb::install_with_port` reserves the lowest free host port and
//!    inserts the `installing` row in one transaction.
//! 4. The orchestrator moves the instance to `installed`, then `starting`,
//!    pulls the image if missing, creates and starts the container, and
//!    records `running`. Each step is persisted before its event is
//!    published on the `EventBus`.
//! 5. Health polling and log capture start as background tasks, cancelled
//!    when the instance stops or is uninstalled.

pub mod api;
pub mod db;
pub mod docker;
pub mod events;
pub mod health;
pub mod logs;
pub mod models;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod ws;
