//! `tracing` subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Keeps the file writer flushing; hold it for the life of the process.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` when set, otherwise the configured directive. `verbose`
/// raises everything from this crate to `trace`.
pub fn build_filter(level: &str, verbose: bool) -> Result<EnvFilter> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(level),
    }
    .with_context(|| format!("Invalid log filter '{}'", level))?;

    if verbose {
        let directive = "flowforge=trace"
            .parse()
            .context("Invalid verbose log directive")?;
        Ok(filter.add_directive(directive))
    } else {
        Ok(filter)
    }
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

fn file_layer(dir: &Path, format: LogFormat) -> Result<(BoxedLayer, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "flowforge.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed(),
    };
    Ok((layer, guard))
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let filter = build_filter(&config.level, verbose)?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format)];
    let file_guard = match &config.dir {
        Some(dir) => {
            let (layer, guard) = file_layer(dir, config.format)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
