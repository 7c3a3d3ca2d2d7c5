//! Orchestrator server command: `flowforge serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use flowforge::config::{FLOWFORGE_DIR, FlowforgeConfig};
use flowforge::logging::init_logging;
use tracing::info;

/// Flags that win over file and environment configuration.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub cors: bool,
}

pub async fn cmd_serve(project_dir: &Path, overrides: ServeOverrides, verbose: bool) -> Result<()> {
    let mut config = FlowforgeConfig::resolve(&project_dir.join(FLOWFORGE_DIR))?;
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    config.server.cors |= overrides.cors;

    // Relative paths are relative to the project, not the shell.
    config.server.db_path = anchor(project_dir, &config.server.db_path);
    if let Some(dir) = &config.logging.dir {
        config.logging.dir = Some(anchor(project_dir, dir));
    }

    let _guard = init_logging(&config.logging, verbose)?;
    info!(
        db_path = %config.server.db_path.display(),
        port_range = ?config.ports.range(),
        "Starting FlowForge"
    );

    flowforge::plugins::server::start_server(config).await
}

fn anchor(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        project_dir.join(path)
    } else {
        path.to_path_buf()
    }
}
