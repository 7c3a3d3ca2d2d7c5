//! Project initialization command: `flowforge init`.

use anyhow::{Context, Result};
use flowforge::config::{CONFIG_FILE, FLOWFORGE_DIR, FlowforgeConfig};
use flowforge::plugins::db::PluginDb;

pub fn cmd_init(project_dir: &std::path::Path, force: bool) -> Result<()> {
    let flowforge_dir = project_dir.join(FLOWFORGE_DIR);
    std::fs::create_dir_all(&flowforge_dir)
        .with_context(|| format!("Failed to create {}", flowforge_dir.display()))?;

    let config_path = flowforge_dir.join(CONFIG_FILE);
    let wrote_config = if config_path.exists() && !force {
        false
    } else {
        FlowforgeConfig::default().save(&config_path)?;
        true
    };

    let config = FlowforgeConfig::load(&config_path)?;
    let db_path = if config.server.db_path.is_relative() {
        project_dir.join(&config.server.db_path)
    } else {
        config.server.db_path.clone()
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    PluginDb::new(&db_path).context("Failed to initialize plugin database")?;

    println!("Initialized FlowForge at {}", flowforge_dir.display());
    println!();
    if wrote_config {
        println!("  {}  (default configuration)", CONFIG_FILE);
    } else {
        println!("  {}  (kept existing; use --force to overwrite)", CONFIG_FILE);
    }
    println!("  {}", db_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add registry sources under [registry] in {}", CONFIG_FILE);
    println!("  2. Run `flowforge serve` to start the orchestrator");

    Ok(())
}
