//! Typed error hierarchy for the plugin orchestrator.
//!
//! `PluginError` is what every orchestrator operation returns. The lower
//! layers keep their own enums:
//! - `RuntimeError` (`plugins::runtime`) for container engine failures
//! - `RegistryError` (`plugins::registry`) for manifest resolution
//! - `StoreError` (`plugins::db`) raised inside `anyhow` chains by the store

use flowforge_common::ManifestError;
use thiserror::Error;

use crate::plugins::db::StoreError;
use crate::plugins::models::{Operation, PluginStatus};
use crate::plugins::registry::RegistryError;
use crate::plugins::runtime::RuntimeError;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Cannot {operation} plugin {id} while it is {status}")]
    InvalidState {
        id: String,
        status: PluginStatus,
        operation: Operation,
    },

    /// A status change the transition table forbids. Indicates a bug in
    /// the caller, never a user error.
    #[error("Illegal transition for plugin {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: PluginStatus,
        to: PluginStatus,
    },

    #[error("No free host port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Registry(RegistryError),

    #[error("Container runtime error: {0}")]
    Runtime(#[source] RuntimeError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl PluginError {
    /// Stable snake_case identifier used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidState { .. } => "invalid_state",
            Self::IllegalTransition { .. } => "internal",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Registry(_) => "registry",
            Self::Runtime(_) => "runtime",
            Self::Database(_) => "database",
        }
    }
}

impl From<ManifestError> for PluginError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Invalid { problems, .. } => Self::Validation(problems),
            ManifestError::Parse(e) => Self::Validation(vec![e.to_string()]),
        }
    }
}

impl From<RuntimeError> for PluginError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => Self::RuntimeUnavailable(msg),
            other => Self::Runtime(other),
        }
    }
}

impl From<RegistryError> for PluginError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(reference) => {
                Self::NotFound(format!("Registry plugin {}", reference))
            }
            RegistryError::InvalidManifest(e) => e.into(),
            other => Self::Registry(other),
        }
    }
}

impl From<anyhow::Error> for PluginError {
    /// Store failures arrive as `anyhow` chains; typed store errors are
    /// recovered by downcasting.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::NotFound { kind, id }) => Self::NotFound(format!("{} {}", kind, id)),
            Some(StoreError::PortsExhausted { start, end }) => Self::ResourceExhausted {
                start: *start,
                end: *end,
            },
            None => Self::Database(err),
        }
    }
}
