use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "flowforge")]
#[command(version, about = "ForgeHook plugin lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory containing `.flowforge/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator and its HTTP/WebSocket API
    Serve {
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides server.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Permissive CORS for a UI dev server on another origin
        #[arg(long)]
        cors: bool,
    },
    /// Create `.flowforge/` with a default configuration and database
    Init {
        /// Overwrite an existing flowforge.toml
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Work with ForgeHook manifests
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report every problem
    Validate,
    /// Write a default flowforge.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum ManifestCommands {
    /// Check a manifest file (JSON or YAML)
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            cors,
        } => {
            let overrides = cmd::ServeOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                cors: *cors,
            };
            cmd::cmd_serve(&project_dir, overrides, cli.verbose).await?;
        }
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Manifest { command } => cmd::cmd_manifest(command.clone())?,
    }

    Ok(())
}
