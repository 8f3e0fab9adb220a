//! Role-selection policy.
//!
//! A pure function from (time, schedule, observed fleet) to the desired fleet
//! configuration. Nothing here is carried across cycles, so a restarted
//! orchestrator computes the same intent as the one it replaced.
//!
//! Rules live in [`POLICY_TABLE`] and are evaluated in order; the first rule
//! whose predicate holds decides the roles. A corrective pass then runs for
//! every rule: unknown runners and observed leaders other than the elected one
//! are stopped.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use shared_types::{FleetIntent, ObservedState, PolicyRule, Role, RunnerObservation, Schedule};

/// Margins and thresholds. Every margin must be positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Live runners allowed in steady state.
    pub fleet_size: usize,
    pub pre_rollover_margin: TimeDelta,
    pub event_lead_margin: TimeDelta,
    /// Warm-up is only started when no event or rollover is closer than this.
    pub warmup_horizon: TimeDelta,
    /// Blocks an active runner may trail the best synced runner and stay leader.
    pub leader_lag_tolerance: u64,
    /// Blocks a standby may trail the known tip before it is restarted.
    pub max_height_lag: u64,
    pub max_boot_time: TimeDelta,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            fleet_size: 3,
            pre_rollover_margin: TimeDelta::seconds(30),
            event_lead_margin: TimeDelta::seconds(30),
            warmup_horizon: TimeDelta::seconds(300),
            leader_lag_tolerance: 1,
            max_height_lag: 5,
            max_boot_time: TimeDelta::seconds(900),
        }
    }
}

/// Everything a single evaluation may look at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub now: DateTime<Utc>,
    pub schedule: &'a Schedule,
    /// Observations ordered by slot index.
    pub fleet: &'a [RunnerObservation],
    /// Operator-requested hand-off target.
    pub handoff: Option<usize>,
    /// Network tip reported by an external tracker.
    pub network_tip: Option<u64>,
    pub config: &'a PolicyConfig,
}

impl PolicyInput<'_> {
    fn runner(&self, index: usize) -> Option<&RunnerObservation> {
        self.fleet.iter().find(|o| o.index == index)
    }

    fn in_state(&self, state: ObservedState) -> impl Iterator<Item = &RunnerObservation> {
        self.fleet.iter().filter(move |o| o.state == state)
    }
}

/// Roles chosen by a rule before the corrective pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub leader: Option<usize>,
    pub roles: BTreeMap<usize, Role>,
}

pub struct PolicyEntry {
    pub rule: PolicyRule,
    pub applies: fn(&PolicyInput<'_>) -> bool,
    pub decide: fn(&PolicyInput<'_>) -> Decision,
}

/// Ordered policy table, first match wins. The last entry always applies.
pub static POLICY_TABLE: [PolicyEntry; 4] = [
    PolicyEntry {
        rule: PolicyRule::EpochRollover,
        applies: rollover_imminent,
        decide: single_runner,
    },
    PolicyEntry {
        rule: PolicyRule::ScheduleUnknown,
        applies: schedule_unknown,
        decide: single_runner,
    },
    PolicyEntry {
        rule: PolicyRule::EventImminent,
        applies: event_imminent,
        decide: event_guard,
    },
    PolicyEntry {
        rule: PolicyRule::SteadyState,
        applies: always,
        decide: steady_state,
    },
];

pub fn select_rule(input: &PolicyInput<'_>) -> &'static PolicyEntry {
    POLICY_TABLE
        .iter()
        .find(|entry| (entry.applies)(input))
        .unwrap_or(&POLICY_TABLE[POLICY_TABLE.len() - 1])
}

/// Compute the fleet intent for this cycle.
pub fn evaluate(input: &PolicyInput<'_>) -> FleetIntent {
    let entry = select_rule(input);
    let Decision { leader, mut roles } = (entry.decide)(input);
    correct(input, leader, &mut roles);

    FleetIntent {
        rule: entry.rule,
        leader,
        roles,
    }
}

fn correct(input: &PolicyInput<'_>, leader: Option<usize>, roles: &mut BTreeMap<usize, Role>) {
    // A lone outgoing leader may be demoted; competing leaders are stopped.
    let conflict = input.in_state(ObservedState::Active).count() > 1;
    for obs in input.fleet {
        let role = roles.entry(obs.index).or_insert(Role::Stopped);
        match obs.state {
            ObservedState::Unknown => *role = Role::Stopped,
            ObservedState::Active if Some(obs.index) != leader => {
                if conflict || *role != Role::Standby {
                    *role = Role::Stopped;
                }
            }
            _ => {}
        }
    }

    for (index, role) in roles.iter_mut() {
        if *role == Role::Active && Some(*index) != leader {
            *role = Role::Stopped;
        }
    }
}

// ----------------------------------------------------------------------------
// Predicates
// ----------------------------------------------------------------------------

fn rollover_imminent(input: &PolicyInput<'_>) -> bool {
    input.schedule.epoch.is_some_and(|boundary| {
        boundary
            .rollover_at
            .checked_sub_signed(input.config.pre_rollover_margin)
            .map_or(true, |threshold| input.now >= threshold)
    })
}

fn schedule_unknown(input: &PolicyInput<'_>) -> bool {
    input.schedule.next_event(input.now).is_none()
}

fn event_imminent(input: &PolicyInput<'_>) -> bool {
    input.schedule.next_event(input.now).is_some_and(|event| {
        event
            .start
            .checked_sub_signed(input.config.event_lead_margin)
            .map_or(true, |threshold| input.now >= threshold)
    })
}

fn always(_: &PolicyInput<'_>) -> bool {
    true
}

/// Warming a runner is only allowed far from any event and from the rollover.
fn warmup_allowed(input: &PolicyInput<'_>) -> bool {
    let Some(horizon) = input.now.checked_add_signed(input.config.warmup_horizon) else {
        return false;
    };
    let event_clear = input
        .schedule
        .next_event(input.now)
        .map_or(true, |event| event.start > horizon);
    let rollover_clear = input
        .schedule
        .epoch
        .map_or(true, |boundary| boundary.rollover_at > horizon);
    event_clear && rollover_clear
}

// ----------------------------------------------------------------------------
// Leader election
// ----------------------------------------------------------------------------

/// Higher height first, then lower index.
fn by_rank(a: &&RunnerObservation, b: &&RunnerObservation) -> Ordering {
    b.rank_height()
        .cmp(&a.rank_height())
        .then(a.index.cmp(&b.index))
}

fn best<'a>(runners: impl Iterator<Item = &'a RunnerObservation>) -> Option<&'a RunnerObservation> {
    runners.min_by(by_rank)
}

/// Pick the runner that should hold the key among synced runners.
///
/// The best active runner keeps leadership unless it trails the best synced
/// runner by more than `tolerance` blocks.
pub fn elect_leader(fleet: &[RunnerObservation], tolerance: u64) -> Option<usize> {
    let synced_max = fleet
        .iter()
        .filter(|o| o.state.is_synced())
        .map(RunnerObservation::rank_height)
        .max()?;

    if let Some(active) = best(fleet.iter().filter(|o| o.state == ObservedState::Active)) {
        if active.rank_height().saturating_add(tolerance) >= synced_max {
            return Some(active.index);
        }
    }

    best(fleet.iter().filter(|o| o.state.is_synced())).map(|o| o.index)
}

// ----------------------------------------------------------------------------
// Decisions
// ----------------------------------------------------------------------------

/// Exactly one runner is kept; every other one is stopped.
fn single_runner(input: &PolicyInput<'_>) -> Decision {
    let keep = elect_leader(input.fleet, input.config.leader_lag_tolerance)
        .or_else(|| best(input.in_state(ObservedState::Bootstrapping)).map(|o| o.index))
        .or_else(|| input.in_state(ObservedState::Stopped).next().map(|o| o.index));

    let roles = input
        .fleet
        .iter()
        .map(|o| {
            let role = if Some(o.index) == keep {
                Role::Active
            } else {
                Role::Stopped
            };
            (o.index, role)
        })
        .collect();

    Decision { leader: keep, roles }
}

/// An event is close: the current leader stays, one synced spare at most, and
/// bootstrapping runners are evicted unless nothing else is alive.
fn event_guard(input: &PolicyInput<'_>) -> Decision {
    let leader = best(input.in_state(ObservedState::Active))
        .map(|o| o.index)
        .or_else(|| elect_leader(input.fleet, input.config.leader_lag_tolerance));
    let spare = best(
        input
            .in_state(ObservedState::Standby)
            .filter(|o| Some(o.index) != leader),
    )
    .map(|o| o.index);

    // With nobody synced a single candidate cannot fork the chain.
    let leader = leader
        .or_else(|| best(input.in_state(ObservedState::Bootstrapping)).map(|o| o.index))
        .or_else(|| input.in_state(ObservedState::Stopped).next().map(|o| o.index));

    let roles = input
        .fleet
        .iter()
        .map(|o| {
            let role = if Some(o.index) == leader {
                Role::Active
            } else if Some(o.index) == spare {
                Role::Standby
            } else {
                Role::Stopped
            };
            (o.index, role)
        })
        .collect();

    Decision { leader, roles }
}

fn steady_state(input: &PolicyInput<'_>) -> Decision {
    let config = input.config;
    let warmup = warmup_allowed(input);
    let known_max = input
        .fleet
        .iter()
        .filter_map(|o| o.height)
        .chain(input.network_tip)
        .max()
        .unwrap_or(0);

    let target = input.handoff.and_then(|index| input.runner(index));
    let mut leader = elect_leader(input.fleet, config.leader_lag_tolerance);
    if let Some(target) = target {
        // The incoming runner only takes over once it is synced; the planner
        // holds its promotion until the outgoing leader is no longer active.
        if target.state.is_synced() {
            leader = Some(target.index);
        }
    }

    let anyone_booting = input
        .in_state(ObservedState::Bootstrapping)
        .next()
        .is_some();
    if leader.is_none() && !anyone_booting {
        leader = input.in_state(ObservedState::Stopped).next().map(|o| o.index);
    }

    let mut roles = BTreeMap::new();
    let mut waiting = Vec::new();
    let mut demoted = None;
    for obs in input.fleet {
        if Some(obs.index) == leader {
            roles.insert(obs.index, Role::Active);
            continue;
        }
        let role = match obs.state {
            ObservedState::Unknown => Role::Stopped,
            // Outgoing leader of a hand-off stays warm as a standby.
            ObservedState::Active => {
                demoted = Some(obs.index);
                Role::Standby
            }
            ObservedState::Standby => {
                let stuck = obs.rank_height().saturating_add(config.max_height_lag) < known_max;
                if stuck && warmup {
                    Role::Stopped
                } else {
                    Role::Standby
                }
            }
            ObservedState::Bootstrapping => {
                let timed_out = obs.booting_since.is_some_and(|since| {
                    input.now.signed_duration_since(since) > config.max_boot_time
                });
                if timed_out {
                    Role::Stopped
                } else {
                    Role::Bootstrapping
                }
            }
            ObservedState::Stopped => {
                waiting.push(obs.index);
                Role::Stopped
            }
        };
        roles.insert(obs.index, role);
    }

    let mut alive = roles.values().filter(|r| **r != Role::Stopped).count();
    if let Some(index) = demoted {
        if alive > config.fleet_size {
            roles.insert(index, Role::Stopped);
            alive -= 1;
        }
    }

    if warmup {
        // A requested hand-off target is warmed first and even past the fleet size.
        let handoff_target = target.map(|t| t.index);
        waiting.sort_by_key(|index| Some(*index) != handoff_target);
        for index in waiting {
            if alive < config.fleet_size || Some(index) == handoff_target {
                roles.insert(index, Role::Bootstrapping);
                alive += 1;
            }
        }
    }

    Decision { leader, roles }
}
