//! Boot-time reconciliation planning.
//!
//! Compares what the store believes with what the engine reports and
//! produces corrections. Planning is pure; the orchestrator applies the
//! result under each instance's lock.

use std::collections::HashMap;

use super::models::{PluginInstance, PluginStatus};
use super::runtime::ManagedContainer;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    /// A container is running for an instance not recorded as running.
    MarkRunning {
        instance_id: String,
        container_id: String,
    },
    /// The container exited or vanished. `clear_container` drops the
    /// recorded id when the container no longer exists.
    MarkStopped {
        instance_id: String,
        clear_container: bool,
    },
    /// A transitional status whose operation cannot be resumed.
    MarkError { instance_id: String, message: String },
    /// An uninstall was in flight; finish removing it.
    FinishUninstall {
        instance_id: String,
        container_id: Option<String>,
    },
}

impl Correction {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::MarkRunning { instance_id, .. }
            | Self::MarkStopped { instance_id, .. }
            | Self::MarkError { instance_id, .. }
            | Self::FinishUninstall { instance_id, .. } => instance_id,
        }
    }
}

/// Plan corrections for every stored instance.
///
/// A container is matched by the recorded container id first, then by
/// the instance label, so a container created just before a crash (and
/// never recorded) is adopted rather than orphaned.
pub fn plan_reconciliation(
    stored: &[PluginInstance],
    observed: &[ManagedContainer],
) -> Vec<Correction> {
    let by_id: HashMap<&str, &ManagedContainer> =
        observed.iter().map(|c| (c.id.as_str(), c)).collect();
    let by_instance: HashMap<&str, &ManagedContainer> = observed
        .iter()
        .filter_map(|c| c.instance_id.as_deref().map(|i| (i, c)))
        .collect();

    let mut corrections = Vec::new();
    for instance in stored {
        let container = instance
            .container_id
            .as_deref()
            .and_then(|id| by_id.get(id))
            .or_else(|| by_instance.get(instance.id.as_str()))
            .copied();
        if let Some(correction) = plan_one(instance, container) {
            corrections.push(correction);
        }
    }
    corrections
}

fn plan_one(instance: &PluginInstance, container: Option<&ManagedContainer>) -> Option<Correction> {
    let instance_id = instance.id.clone();

    if instance.status == PluginStatus::Uninstalling {
        return Some(Correction::FinishUninstall {
            instance_id,
            container_id: container
                .map(|c| c.id.clone())
                .or_else(|| instance.container_id.clone()),
        });
    }

    match container {
        Some(c) if c.running => {
            let recorded = instance.container_id.as_deref() == Some(c.id.as_str());
            if instance.status == PluginStatus::Running && recorded {
                None
            } else {
                Some(Correction::MarkRunning {
                    instance_id,
                    container_id: c.id.clone(),
                })
            }
        }
        Some(_) => match instance.status {
            PluginStatus::Running | PluginStatus::Starting | PluginStatus::Stopping => {
                Some(Correction::MarkStopped {
                    instance_id,
                    clear_container: false,
                })
            }
            PluginStatus::Installing => Some(Correction::MarkError {
                instance_id,
                message: INTERRUPTED_MESSAGE.to_string(),
            }),
            _ => None,
        },
        None => match instance.status {
            PluginStatus::Installing | PluginStatus::Starting => Some(Correction::MarkError {
                instance_id,
                message: INTERRUPTED_MESSAGE.to_string(),
            }),
            PluginStatus::Running | PluginStatus::Stopping => Some(Correction::MarkStopped {
                instance_id,
                clear_container: true,
            }),
            _ => None,
        },
    }
}
