//! Configuration view and validation commands: `flowforge config`.

use anyhow::{Context, Result};
use flowforge::config::{CONFIG_FILE, FLOWFORGE_DIR, FlowforgeConfig};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let flowforge_dir = project_dir.join(FLOWFORGE_DIR);
    let config_path = flowforge_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("FlowForge Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; showing defaults.", CONFIG_FILE);
            }
            println!("Effective values (with env overrides):");
            println!();

            let config = FlowforgeConfig::resolve(&flowforge_dir)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = FlowforgeConfig::resolve(&flowforge_dir)?;
            let problems = config.validate();
            if !problems.is_empty() {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("Configuration has {} problem(s)", problems.len());
            }
            if config_path.exists() {
                println!("Configuration is valid.");
            } else {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&flowforge_dir)?;
            FlowforgeConfig::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path");
            println!("  - [ports] range_start, range_end");
            println!("  - [registry] sources and cache_ttl_secs");
            println!();
        }
    }

    Ok(())
}
