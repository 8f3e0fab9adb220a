//! In-memory fleet used by the orchestrator tests.
//!
//! Transitions are instant except bootstrapping, which takes a fixed number
//! of `tick()` calls to reach standby.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet_master::{
    orchestrator::{Orchestrator, OrchestratorSettings},
    policy::PolicyConfig,
    process::{ProcessManager, ProcessManagerError},
    runner::RunnerSlot,
    schedule::{ScheduleError, ScheduleSource},
    AppState,
};
use shared_types::{ObservedState, Role, RunnerObservation, Schedule};

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// A transition the simulated process manager accepted, with the fleet
/// states observed right before it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub index: usize,
    pub role: Role,
    pub before: Vec<ObservedState>,
}

struct SimRunner {
    state: ObservedState,
    boot_left: u32,
    lag: u64,
}

struct Inner {
    runners: Vec<SimRunner>,
    tip: u64,
    transitions: Vec<Transition>,
    failures: HashMap<usize, u32>,
    max_active: usize,
}

impl Inner {
    fn states(&self) -> Vec<ObservedState> {
        self.runners.iter().map(|r| r.state).collect()
    }

    fn record(&mut self, index: usize, role: Role, before: Vec<ObservedState>) {
        self.transitions.push(Transition {
            index,
            role,
            before,
        });
        let active = self
            .runners
            .iter()
            .filter(|r| r.state == ObservedState::Active)
            .count();
        self.max_active = self.max_active.max(active);
    }
}

pub struct SimFleet {
    inner: Mutex<Inner>,
    sync_ticks: u32,
}

impl SimFleet {
    pub fn new(states: &[ObservedState], sync_ticks: u32) -> Arc<Self> {
        let runners = states
            .iter()
            .map(|state| SimRunner {
                state: *state,
                boot_left: sync_ticks,
                lag: 0,
            })
            .collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                runners,
                tip: 1_000,
                transitions: Vec::new(),
                failures: HashMap::new(),
                max_active: 0,
            }),
            sync_ticks,
        })
    }

    pub fn states(&self) -> Vec<ObservedState> {
        self.inner.lock().unwrap().states()
    }

    pub fn active(&self) -> Vec<usize> {
        self.states()
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == ObservedState::Active)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().unwrap().transitions.clone()
    }

    /// Highest number of simultaneously active runners after any transition.
    pub fn max_active(&self) -> usize {
        self.inner.lock().unwrap().max_active
    }

    /// Advance the chain one block and progress bootstrapping runners.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tip += 1;
        for runner in inner.runners.iter_mut() {
            if runner.state == ObservedState::Bootstrapping {
                runner.boot_left = runner.boot_left.saturating_sub(1);
                if runner.boot_left == 0 {
                    runner.state = ObservedState::Standby;
                }
            }
        }
    }

    /// Change a runner behind the orchestrator's back.
    pub fn set(&self, index: usize, state: ObservedState) {
        let mut inner = self.inner.lock().unwrap();
        inner.runners[index].state = state;
        inner.runners[index].boot_left = self.sync_ticks;
    }

    /// Report `index` this many blocks behind the tip.
    pub fn fall_behind(&self, index: usize, blocks: u64) {
        self.inner.lock().unwrap().runners[index].lag = blocks;
    }

    /// Fail the next `times` transitions issued for `index`.
    pub fn fail_next(&self, index: usize, times: u32) {
        self.inner.lock().unwrap().failures.insert(index, times);
    }

    fn take_failure(inner: &mut Inner, index: usize) -> bool {
        match inner.failures.get_mut(&index) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

fn rejected(index: usize, role: Role, reason: &str) -> ProcessManagerError {
    ProcessManagerError::Rejected {
        index,
        role,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ProcessManager for SimFleet {
    async fn query(&self, slot: &RunnerSlot) -> RunnerObservation {
        let inner = self.inner.lock().unwrap();
        let runner = &inner.runners[slot.index];
        let observation = RunnerObservation::new(slot.index, runner.state);
        if runner.state.is_synced() {
            observation.with_height(inner.tip.saturating_sub(runner.lag))
        } else {
            observation
        }
    }

    async fn start(&self, slot: &RunnerSlot, role: Role) -> Result<(), ProcessManagerError> {
        let mut inner = self.inner.lock().unwrap();
        if Self::take_failure(&mut inner, slot.index) {
            return Err(rejected(slot.index, role, "injected failure"));
        }

        let before = inner.states();
        let sync_ticks = self.sync_ticks;
        let runner = &mut inner.runners[slot.index];
        match (runner.state, role) {
            (_, Role::Stopped) => runner.state = ObservedState::Stopped,
            (ObservedState::Stopped, Role::Bootstrapping | Role::Standby) => {
                runner.state = ObservedState::Bootstrapping;
                runner.boot_left = sync_ticks;
            }
            (ObservedState::Active, Role::Standby) => runner.state = ObservedState::Standby,
            (ObservedState::Standby | ObservedState::Active, Role::Active) => {
                runner.state = ObservedState::Active
            }
            (_, Role::Active) => return Err(rejected(slot.index, role, "not synced")),
            _ => {}
        }
        inner.record(slot.index, role, before);
        Ok(())
    }

    async fn stop(&self, slot: &RunnerSlot) -> Result<(), ProcessManagerError> {
        let mut inner = self.inner.lock().unwrap();
        if Self::take_failure(&mut inner, slot.index) {
            return Err(rejected(slot.index, Role::Stopped, "injected failure"));
        }
        let before = inner.states();
        inner.runners[slot.index].state = ObservedState::Stopped;
        inner.record(slot.index, Role::Stopped, before);
        Ok(())
    }
}

/// Schedule source returning whatever the test sets.
pub struct FixedSchedule {
    schedule: Mutex<Option<Schedule>>,
}

impl FixedSchedule {
    pub fn new(schedule: Schedule) -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(Some(schedule)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(None),
        })
    }

    pub fn set(&self, schedule: Schedule) {
        *self.schedule.lock().unwrap() = Some(schedule);
    }
}

#[async_trait]
impl ScheduleSource for FixedSchedule {
    async fn fetch(
        &self,
        _now: DateTime<Utc>,
        _fleet: &[RunnerObservation],
    ) -> Result<Schedule, ScheduleError> {
        self.schedule
            .lock()
            .unwrap()
            .clone()
            .ok_or(ScheduleError::NoSource)
    }
}

pub fn slots(count: usize) -> Vec<RunnerSlot> {
    (0..count)
        .map(|index| RunnerSlot {
            index,
            unit: format!("jorm_runner@{index}.service"),
            rest_host: "127.0.0.1".to_string(),
            rest_port: 3100 + index as u16,
            storage_path: format!("/tmp/runner-{index}"),
            config_path: format!("/tmp/runner-{index}.yaml"),
        })
        .collect()
}

pub struct Harness {
    pub fleet: Arc<SimFleet>,
    pub schedule: Arc<FixedSchedule>,
    pub state: Arc<AppState>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(states: &[ObservedState], schedule: Arc<FixedSchedule>) -> Self {
        Self::with_policy(states, schedule, PolicyConfig::default())
    }

    pub fn with_policy(
        states: &[ObservedState],
        schedule: Arc<FixedSchedule>,
        policy: PolicyConfig,
    ) -> Self {
        let fleet = SimFleet::new(states, 1);
        let slots = slots(states.len());
        let state = AppState::new(&slots);
        let orchestrator = Orchestrator::new(
            slots,
            fleet.clone(),
            schedule.clone(),
            policy,
            OrchestratorSettings::default(),
            Arc::clone(&state),
        )
        .unwrap();
        Self {
            fleet,
            schedule,
            state,
            orchestrator,
        }
    }
}
