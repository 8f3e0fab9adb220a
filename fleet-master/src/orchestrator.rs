//! The control loop: observe, evaluate, act, sleep.
//!
//! Each cycle is self-contained. The only carried values are the cycle
//! counter (to keep the first cycle observation-only) and failure counts
//! used for reporting; neither feeds the policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use shared_types::{FleetIntent, FleetSnapshot, ObservedState, RunnerObservation, Schedule};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::plan::{plan_commands, Command};
use crate::policy::{self, PolicyConfig, PolicyInput};
use crate::pooltool::PoolTool;
use crate::process::SharedProcessManager;
use crate::runner::RunnerSlot;
use crate::schedule::SharedScheduleSource;
use crate::state::AppState;

/// Settle time after a production window before the loop resumes.
const EVENT_SETTLE_SECS: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub cycle_period: Duration,
    /// Sleep through an event starting within this margin.
    pub hibernate_margin: TimeDelta,
    pub health_log_every: u64,
    /// Consecutive failures of one runner's transition before logging at error.
    pub persistent_failure_threshold: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cycle_period: Duration::from_secs(2),
            hibernate_margin: TimeDelta::seconds(10),
            health_log_every: 30,
            persistent_failure_threshold: 5,
        }
    }
}

/// What one cycle saw and did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub observations: Vec<RunnerObservation>,
    pub schedule: Schedule,
    /// `None` on the observation-only first cycle.
    pub intent: Option<FleetIntent>,
    pub issued: Vec<Command>,
    pub failed: Vec<Command>,
    pub withheld: Vec<usize>,
}

impl CycleReport {
    pub fn observed_active(&self) -> Vec<usize> {
        active_indices(&self.observations)
    }

    /// The fleet already matches the intent: the elected leader is the only
    /// active runner and the cycle had nothing to issue, retry or hold back.
    pub fn settled(&self) -> bool {
        let Some(intent) = &self.intent else {
            return false;
        };
        let active = self.observed_active();
        let leader_holds = match intent.leader {
            Some(leader) => active == [leader],
            None => active.is_empty(),
        };
        leader_holds
            && self.issued.is_empty()
            && self.failed.is_empty()
            && self.withheld.is_empty()
    }
}

pub struct Orchestrator {
    slots: Vec<RunnerSlot>,
    process: SharedProcessManager,
    schedule: SharedScheduleSource,
    pooltool: Option<Arc<PoolTool>>,
    policy: PolicyConfig,
    settings: OrchestratorSettings,
    state: Arc<AppState>,
    shutdown: CancellationToken,
    cycle: u64,
    failures: HashMap<usize, u32>,
}

impl Orchestrator {
    pub fn new(
        slots: Vec<RunnerSlot>,
        process: SharedProcessManager,
        schedule: SharedScheduleSource,
        policy: PolicyConfig,
        settings: OrchestratorSettings,
        state: Arc<AppState>,
    ) -> Result<Self, ConfigError> {
        if slots.is_empty() {
            return Err(ConfigError::NoSlots);
        }
        Ok(Self {
            slots,
            process,
            schedule,
            pooltool: None,
            policy,
            settings,
            state,
            shutdown: CancellationToken::new(),
            cycle: 0,
            failures: HashMap::new(),
        })
    }

    pub fn with_pooltool(mut self, pooltool: Arc<PoolTool>) -> Self {
        self.pooltool = Some(pooltool);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Query every runner concurrently, in slot order.
    pub async fn observe(&self) -> Vec<RunnerObservation> {
        join_all(self.slots.iter().map(|slot| self.process.query(slot))).await
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let cycle = self.cycle;
        self.cycle += 1;

        let observations = self.observe().await;
        let schedule = match self.schedule.fetch(now, &observations).await {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(error = %e, "schedule unavailable, treating it as unknown");
                Schedule::unknown()
            }
        };
        let network_tip = self.network_tip(&observations, now).await;

        let leaders = active_indices(&observations);
        if leaders.len() > 1 {
            error!(
                runners = ?leaders,
                "multiple runners hold the leader key, stopping all but one"
            );
        }
        if observations.iter().all(|o| !o.state.is_alive() || o.state == ObservedState::Unknown) {
            warn!("no runner is alive, the pool cannot produce blocks");
        }

        let handoff = self.settle_handoff(&observations, &leaders).await;

        let mut report = CycleReport {
            cycle,
            observations,
            schedule,
            intent: None,
            issued: Vec::new(),
            failed: Vec::new(),
            withheld: Vec::new(),
        };

        if cycle == 0 {
            info!(
                leader = ?leaders.first(),
                runners = %summary(&report.observations),
                "initial observation, no transitions this cycle"
            );
            self.publish(now, &report, handoff).await;
            return report;
        }

        let intent = policy::evaluate(&PolicyInput {
            now,
            schedule: &report.schedule,
            fleet: &report.observations,
            handoff,
            network_tip,
            config: &self.policy,
        });
        let plan = plan_commands(&report.observations, &intent);
        if !plan.withheld.is_empty() {
            debug!(
                runners = ?plan.withheld,
                "promotion deferred until the previous leader has stepped down"
            );
        }
        if !plan.commands.is_empty() {
            debug!(rule = %intent.rule, leader = ?intent.leader, "applying fleet intent");
        }

        let (issued, failed) = self.execute(&plan.commands).await;
        report.issued = issued;
        report.failed = failed;
        report.withheld = plan.withheld;
        report.intent = Some(intent);

        if cycle % self.settings.health_log_every.max(1) == 0 {
            self.log_health(now, &report);
        }
        self.publish(now, &report, handoff).await;
        report
    }

    /// Issue commands in plan order. Failures are left for the next cycle.
    async fn execute(&mut self, commands: &[Command]) -> (Vec<Command>, Vec<Command>) {
        let mut issued = Vec::new();
        let mut failed = Vec::new();

        for &command in commands {
            if self.shutdown.is_cancelled() {
                info!(%command, "shutdown requested, not issuing");
                break;
            }
            let Some(slot) = self.slots.iter().find(|s| s.index == command.index()) else {
                continue;
            };

            info!(%command, "issuing transition");
            let result = match command {
                Command::Stop(_) => self.process.stop(slot).await,
                other => self.process.start(slot, other.role()).await,
            };
            match result {
                Ok(()) => issued.push(command),
                Err(e) => {
                    let count = self.failures.entry(slot.index).or_insert(0);
                    *count += 1;
                    if *count >= self.settings.persistent_failure_threshold {
                        error!(%command, failures = *count, error = %e, "transition keeps failing");
                    } else {
                        warn!(%command, failures = *count, error = %e, "transition failed, retrying next cycle");
                    }
                    failed.push(command);
                }
            }
        }

        self.failures
            .retain(|index, _| failed.iter().any(|c| c.index() == *index));
        (issued, failed)
    }

    async fn network_tip(
        &self,
        observations: &[RunnerObservation],
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let pooltool = self.pooltool.as_ref()?;
        if let Some(height) = observations.iter().filter_map(|o| o.height).max() {
            pooltool.send_height(height, now).await;
        }
        pooltool.majority_max(now).await
    }

    /// Drop a hand-off request once its target is the only leader.
    async fn settle_handoff(
        &self,
        observations: &[RunnerObservation],
        leaders: &[usize],
    ) -> Option<usize> {
        let target = self.state.handoff_target().await?;
        if !observations.iter().any(|o| o.index == target) {
            warn!(runner = target, "hand-off target is not a known runner, dropping request");
            self.state.complete_handoff(target).await;
            return None;
        }
        if leaders == [target] {
            if self.state.complete_handoff(target).await {
                info!(runner = target, "hand-off complete");
            }
            return None;
        }
        Some(target)
    }

    fn log_health(&self, now: DateTime<Utc>, report: &CycleReport) {
        let count = |state: ObservedState| {
            report
                .observations
                .iter()
                .filter(|o| o.state == state)
                .count()
        };
        let secs_until = |at: DateTime<Utc>| at.signed_duration_since(now).num_seconds();
        info!(
            cycle = report.cycle,
            rule = ?report.intent.as_ref().map(|i| i.rule),
            leader = ?report.intent.as_ref().and_then(|i| i.leader),
            active = count(ObservedState::Active),
            standby = count(ObservedState::Standby),
            bootstrapping = count(ObservedState::Bootstrapping),
            stopped = count(ObservedState::Stopped),
            unknown = count(ObservedState::Unknown),
            max_height = ?report.observations.iter().filter_map(|o| o.height).max(),
            next_event_in_secs = ?report.schedule.next_event(now).map(|e| secs_until(e.start)),
            rollover_in_secs = ?report.schedule.epoch.map(|e| secs_until(e.rollover_at)),
            "fleet health"
        );
    }

    async fn publish(&self, now: DateTime<Utc>, report: &CycleReport, handoff: Option<usize>) {
        let snapshot = FleetSnapshot {
            cycle: report.cycle,
            observed_at: Some(now),
            slots: self.slots.iter().map(RunnerSlot::info).collect(),
            runners: report.observations.clone(),
            intent: report.intent.clone(),
            handoff_target: handoff,
            next_event: report.schedule.next_event(now).copied(),
            rollover_at: report.schedule.epoch.map(|e| e.rollover_at),
        };
        self.state.publish(snapshot).await;
    }

    /// Run cycles until the shutdown token is cancelled.
    pub async fn run(mut self) {
        info!(runners = self.slots.len(), fleet_size = self.policy.fleet_size, "orchestrator started");

        while !self.shutdown.is_cancelled() {
            let report = self.run_cycle(Utc::now()).await;
            let delay = cycle_delay(Utc::now(), &report, &self.settings);
            if delay > self.settings.cycle_period {
                info!(secs = delay.as_secs(), "production window close, hibernating");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("orchestrator stopped");
    }
}

/// Delay after `report`. An unsettled fleet keeps the regular period even
/// next to an event, so a conflict is never left standing through a window.
pub fn cycle_delay(
    now: DateTime<Utc>,
    report: &CycleReport,
    settings: &OrchestratorSettings,
) -> Duration {
    if !report.settled() {
        return settings.cycle_period;
    }
    next_delay(now, &report.schedule, settings.cycle_period, settings.hibernate_margin)
}

/// Time until the next cycle. Within `hibernate_margin` of an event the loop
/// sleeps until the window has passed, so no transition lands mid-production.
pub fn next_delay(
    now: DateTime<Utc>,
    schedule: &Schedule,
    period: Duration,
    hibernate_margin: TimeDelta,
) -> Duration {
    let Some(event) = schedule.next_event(now) else {
        return period;
    };
    if !event.contains(now) && event.start.signed_duration_since(now) > hibernate_margin {
        return period;
    }
    (event.end + TimeDelta::seconds(EVENT_SETTLE_SECS))
        .signed_duration_since(now)
        .to_std()
        .map_or(period, |wake| wake.max(period))
}

fn active_indices(observations: &[RunnerObservation]) -> Vec<usize> {
    observations
        .iter()
        .filter(|o| o.state == ObservedState::Active)
        .map(|o| o.index)
        .collect()
}

fn summary(observations: &[RunnerObservation]) -> String {
    observations
        .iter()
        .map(|o| format!("{}={}", o.index, o.state))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared_types::{PolicyRule, ProductionEvent, Role};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn schedule_with(start: i64, len: i64) -> Schedule {
        let start = t0() + TimeDelta::seconds(start);
        Schedule::new(
            None,
            vec![ProductionEvent {
                start,
                end: start + TimeDelta::seconds(len),
            }],
        )
    }

    #[test]
    fn test_regular_period_without_event() {
        let delay = next_delay(t0(), &Schedule::unknown(), Duration::from_secs(2), TimeDelta::seconds(10));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_regular_period_when_event_is_far() {
        let delay = next_delay(t0(), &schedule_with(60, 2), Duration::from_secs(2), TimeDelta::seconds(10));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_hibernates_through_close_event() {
        let delay = next_delay(t0(), &schedule_with(8, 2), Duration::from_secs(2), TimeDelta::seconds(10));
        // 8s to start, 2s window, 2s settle.
        assert_eq!(delay, Duration::from_secs(12));
    }

    #[test]
    fn test_hibernates_during_running_event() {
        let delay = next_delay(t0(), &schedule_with(-1, 2), Duration::from_secs(2), TimeDelta::seconds(10));
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn test_hibernation_never_shorter_than_period() {
        let delay = next_delay(t0(), &schedule_with(-1, 2), Duration::from_secs(5), TimeDelta::seconds(10));
        assert_eq!(delay, Duration::from_secs(5));
    }

    fn report(fleet: &[ObservedState], leader: Option<usize>, schedule: Schedule) -> CycleReport {
        let observations: Vec<_> = fleet
            .iter()
            .enumerate()
            .map(|(i, s)| RunnerObservation::new(i, *s))
            .collect();
        let roles = observations
            .iter()
            .map(|o| (o.index, if Some(o.index) == leader { Role::Active } else { Role::Stopped }))
            .collect();
        CycleReport {
            cycle: 3,
            observations,
            schedule,
            intent: Some(FleetIntent {
                rule: PolicyRule::EventImminent,
                leader,
                roles,
            }),
            issued: Vec::new(),
            failed: Vec::new(),
            withheld: Vec::new(),
        }
    }

    #[test]
    fn test_settled_fleet_hibernates() {
        let settings = OrchestratorSettings::default();
        let settled = report(&[ObservedState::Active, ObservedState::Stopped], Some(0), schedule_with(5, 2));

        assert!(settled.settled());
        assert_eq!(cycle_delay(t0(), &settled, &settings), Duration::from_secs(9));
    }

    #[test]
    fn test_unsettled_fleet_keeps_cycling_before_event() {
        let settings = OrchestratorSettings::default();
        let double = report(&[ObservedState::Active, ObservedState::Active], Some(0), schedule_with(5, 2));
        let mut stopping = report(&[ObservedState::Active, ObservedState::Standby], Some(0), schedule_with(5, 2));
        stopping.issued.push(Command::Stop(1));
        let leaderless = report(&[ObservedState::Standby, ObservedState::Stopped], Some(0), schedule_with(5, 2));
        let mut first = report(&[ObservedState::Active], Some(0), schedule_with(5, 2));
        first.intent = None;

        for report in [double, stopping, leaderless, first] {
            assert!(!report.settled(), "{report:?}");
            assert_eq!(cycle_delay(t0(), &report, &settings), settings.cycle_period);
        }
    }

    #[test]
    fn test_summary_lists_states() {
        let fleet = [
            RunnerObservation::new(0, ObservedState::Active),
            RunnerObservation::new(1, ObservedState::Stopped),
        ];
        assert_eq!(summary(&fleet), "0=active 1=stopped");
    }
}
