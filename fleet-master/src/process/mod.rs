//! Process manager adapter.
//!
//! The orchestrator only talks to runners through [`ProcessManager`]. Every
//! call is idempotent and may fail transiently; failures are retried by the
//! next poll cycle rather than here.

mod systemd;

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{Role, RunnerObservation};

use crate::node_api::NodeApiError;
use crate::runner::RunnerSlot;

pub use systemd::SystemdProcessManager;

pub type SharedProcessManager = Arc<dyn ProcessManager>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessManagerError {
    #[error("systemctl {action} {unit} failed: {detail}")]
    Systemctl {
        action: &'static str,
        unit: String,
        detail: String,
    },
    #[error(transparent)]
    NodeApi(#[from] NodeApiError),
    #[error("cannot load node secret {path}: {reason}")]
    Secret { path: String, reason: String },
    #[error("runner {index} cannot take role {role}: {reason}")]
    Rejected {
        index: usize,
        role: Role,
        reason: String,
    },
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Observe the runner as it actually is, never as it was last asked to be.
    async fn query(&self, slot: &RunnerSlot) -> RunnerObservation;

    /// Move the runner towards `role`. Does not wait for the transition to finish.
    async fn start(&self, slot: &RunnerSlot, role: Role) -> Result<(), ProcessManagerError>;

    /// Stop the runner; stopping a stopped runner succeeds.
    async fn stop(&self, slot: &RunnerSlot) -> Result<(), ProcessManagerError>;
}
