//! Manifest checking command: `flowforge manifest validate`.

use std::path::Path;

use anyhow::{Context, Result};
use flowforge_common::{Manifest, ManifestError};

use super::super::ManifestCommands;

pub fn cmd_manifest(command: ManifestCommands) -> Result<()> {
    match command {
        ManifestCommands::Validate { file } => validate_file(&file),
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let manifest = parse_manifest(path, &content)?;

    if let Err(ManifestError::Invalid { id, problems }) = manifest.validate() {
        println!("Manifest {} has problems:", id);
        for problem in &problems {
            println!("  - {}", problem);
        }
        anyhow::bail!("Manifest {} is invalid", path.display());
    }

    println!("Manifest {} is valid.", manifest.key());
    println!("  image: {}", manifest.image.reference());
    println!("  port:  {}", manifest.port);
    if !manifest.environment.is_empty() {
        let names: Vec<&str> = manifest.environment.iter().map(|e| e.name.as_str()).collect();
        println!("  env:   {}", names.join(", "));
    }
    Ok(())
}

fn parse_manifest(path: &Path, content: &str) -> Result<Manifest> {
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
    if is_yaml {
        serde_yaml::from_str(content)
            .with_context(|| format!("Failed to parse YAML manifest: {}", path.display()))
    } else {
        Manifest::from_json(content)
            .with_context(|| format!("Failed to parse JSON manifest: {}", path.display()))
    }
}
