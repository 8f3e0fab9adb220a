use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use shared_types::{ObservedState, Role, RunnerObservation};
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use super::{ProcessManager, ProcessManagerError};
use crate::node_api::{NodeApi, NodeApiError, NodeStats};
use crate::runner::RunnerSlot;

/// Runners supervised as systemd units, with leadership driven over REST.
pub struct SystemdProcessManager {
    apis: HashMap<usize, NodeApi>,
    node_secret_path: PathBuf,
    rest_grace: TimeDelta,
    /// Launches issued by this process. Lost on restart, which only makes
    /// unreachable units look `Unknown` and get stopped.
    launched: Mutex<HashMap<usize, DateTime<Utc>>>,
}

impl SystemdProcessManager {
    pub fn new(
        slots: &[RunnerSlot],
        node_secret_path: PathBuf,
        rest_grace: Duration,
        request_timeout: Duration,
    ) -> Result<Self, NodeApiError> {
        let apis = slots
            .iter()
            .map(|slot| Ok((slot.index, NodeApi::new(slot.rest_url(), request_timeout)?)))
            .collect::<Result<HashMap<_, _>, NodeApiError>>()?;

        Ok(Self {
            apis,
            node_secret_path,
            rest_grace: TimeDelta::from_std(rest_grace).unwrap_or_else(|_| TimeDelta::days(365)),
            launched: Mutex::new(HashMap::new()),
        })
    }

    fn api(&self, slot: &RunnerSlot, role: Role) -> Result<&NodeApi, ProcessManagerError> {
        self.apis
            .get(&slot.index)
            .ok_or_else(|| ProcessManagerError::Rejected {
                index: slot.index,
                role,
                reason: "no REST endpoint configured".to_string(),
            })
    }

    async fn launch(&self, slot: &RunnerSlot) -> Result<(), ProcessManagerError> {
        run_systemctl("start", &slot.unit).await?;
        self.launched
            .lock()
            .await
            .entry(slot.index)
            .or_insert_with(Utc::now);
        info!(runner = slot.index, unit = %slot.unit, "runner launched");
        Ok(())
    }

    async fn demote(&self, slot: &RunnerSlot, api: &NodeApi) -> Result<(), ProcessManagerError> {
        for id in api.leaders().await? {
            api.remove_leader(id).await?;
            info!(runner = slot.index, leader_id = id, "leader id removed");
        }
        Ok(())
    }

    async fn promote(&self, slot: &RunnerSlot, api: &NodeApi) -> Result<(), ProcessManagerError> {
        if !api.leaders().await?.is_empty() {
            return Ok(());
        }
        let secret = self.load_secret().await?;
        api.register_leader(&secret).await?;
        info!(runner = slot.index, "runner promoted to leader");
        Ok(())
    }

    async fn load_secret(&self) -> Result<serde_yaml::Value, ProcessManagerError> {
        let path = self.node_secret_path.display().to_string();
        let raw = tokio::fs::read_to_string(&self.node_secret_path)
            .await
            .map_err(|e| ProcessManagerError::Secret {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        serde_yaml::from_str(&raw).map_err(|e| ProcessManagerError::Secret {
            path,
            reason: e.to_string(),
        })
    }

    async fn booting_since(&self, index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.launched.lock().await.entry(index).or_insert(now)
    }

    async fn forget_launch(&self, index: usize) {
        self.launched.lock().await.remove(&index);
    }

    /// REST is down: ask systemd whether the process is there at all.
    async fn query_unit(&self, slot: &RunnerSlot, now: DateTime<Utc>) -> RunnerObservation {
        let active = unit_active(&slot.unit).await;
        let launched_at = self.launched.lock().await.get(&slot.index).copied();
        let observation = unit_observation(slot.index, &active, launched_at, now, self.rest_grace);

        match (&active, observation.state) {
            (Ok(false), _) => self.forget_launch(slot.index).await,
            (Err(e), _) => warn!(runner = slot.index, error = %e, "cannot query unit state"),
            (Ok(true), ObservedState::Unknown) => {
                warn!(runner = slot.index, unit = %slot.unit, "unit active but REST API not responding")
            }
            _ => {}
        }
        observation
    }
}

/// Role of a synced node, from its registered leader ids.
fn leadership_state<E>(leaders: &Result<Vec<u64>, E>) -> ObservedState {
    match leaders {
        Ok(ids) if ids.is_empty() => ObservedState::Standby,
        Ok(_) => ObservedState::Active,
        Err(_) => ObservedState::Unknown,
    }
}

/// Observation of a runner whose REST API answered.
fn node_observation<E>(
    index: usize,
    stats: &NodeStats,
    leaders: &Result<Vec<u64>, E>,
    booting_since: DateTime<Utc>,
) -> RunnerObservation {
    let mut observation = if stats.is_synced() {
        RunnerObservation::new(index, leadership_state(leaders))
    } else {
        RunnerObservation::new(index, ObservedState::Bootstrapping).with_booting_since(booting_since)
    };
    observation.height = stats.height();
    observation
}

/// Observation of a runner whose REST API is silent. A unit launched by us
/// is given `grace` to open its API before it counts as unknown.
fn unit_observation<E>(
    index: usize,
    active: &Result<bool, E>,
    launched_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: TimeDelta,
) -> RunnerObservation {
    match (active, launched_at) {
        (Ok(false), _) => RunnerObservation::new(index, ObservedState::Stopped),
        (Ok(true), Some(since)) if now.signed_duration_since(since) <= grace => {
            RunnerObservation::new(index, ObservedState::Bootstrapping).with_booting_since(since)
        }
        _ => RunnerObservation::new(index, ObservedState::Unknown),
    }
}

#[async_trait]
impl ProcessManager for SystemdProcessManager {
    async fn query(&self, slot: &RunnerSlot) -> RunnerObservation {
        let now = Utc::now();
        let Some(api) = self.apis.get(&slot.index) else {
            return RunnerObservation::new(slot.index, ObservedState::Unknown);
        };

        let stats = match api.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(runner = slot.index, error = %e, "node stats unavailable");
                return self.query_unit(slot, now).await;
            }
        };

        let (leaders, since) = if stats.is_synced() {
            self.forget_launch(slot.index).await;
            (api.leaders().await, now)
        } else {
            (Ok(Vec::new()), self.booting_since(slot.index, now).await)
        };
        if let Err(e) = &leaders {
            warn!(runner = slot.index, error = %e, "cannot read leader ids");
        }
        node_observation(slot.index, &stats, &leaders, since)
    }

    async fn start(&self, slot: &RunnerSlot, role: Role) -> Result<(), ProcessManagerError> {
        match role {
            Role::Stopped => self.stop(slot).await,
            Role::Bootstrapping => self.launch(slot).await,
            Role::Standby => {
                if unit_active(&slot.unit).await? {
                    let api = self.api(slot, role)?;
                    self.demote(slot, api).await
                } else {
                    self.launch(slot).await
                }
            }
            Role::Active => {
                let api = self.api(slot, role)?;
                let stats = api.stats().await?;
                if !stats.is_synced() {
                    return Err(ProcessManagerError::Rejected {
                        index: slot.index,
                        role,
                        reason: format!("node is {}", stats.state),
                    });
                }
                self.promote(slot, api).await
            }
        }
    }

    async fn stop(&self, slot: &RunnerSlot) -> Result<(), ProcessManagerError> {
        run_systemctl("stop", &slot.unit).await?;
        self.forget_launch(slot.index).await;
        info!(runner = slot.index, unit = %slot.unit, "runner stopped");
        Ok(())
    }
}

async fn unit_active(unit: &str) -> Result<bool, ProcessManagerError> {
    let status = Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .status()
        .await
        .map_err(|e| ProcessManagerError::Systemctl {
            action: "is-active",
            unit: unit.to_string(),
            detail: e.to_string(),
        })?;
    Ok(status.success())
}

/// `systemctl <action> --no-block <unit>`; the loop re-observes the outcome.
async fn run_systemctl(action: &'static str, unit: &str) -> Result<(), ProcessManagerError> {
    let output = Command::new("systemctl")
        .args([action, "--no-block", unit])
        .output()
        .await
        .map_err(|e| ProcessManagerError::Systemctl {
            action,
            unit: unit.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ProcessManagerError::Systemctl {
            action,
            unit: unit.to_string(),
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
