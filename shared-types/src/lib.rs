//! Shared fleet types
//!
//! These types are used by both:
//! - the orchestrator loop (observation, policy, command planning)
//! - the admin API (status snapshots served as JSON)
//!
//! Serializable with serde so a snapshot can go straight over HTTP.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Runner roles and states
// ============================================================================

/// Role the orchestrator wants a runner to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Stopped,
    Bootstrapping,
    /// Fully synced, leader capability disabled.
    Standby,
    /// Permitted to use the signing credential.
    Active,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Stopped => write!(f, "stopped"),
            Role::Bootstrapping => write!(f, "bootstrapping"),
            Role::Standby => write!(f, "standby"),
            Role::Active => write!(f, "active"),
        }
    }
}

/// State of a runner as reported by the process manager.
///
/// `Unknown` means the runner may be alive but its leadership could not be
/// established, so it must be treated as a potential leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Stopped,
    Bootstrapping,
    Standby,
    Active,
    Unknown,
}

impl ObservedState {
    /// Whether the runner process is (possibly) alive.
    pub fn is_alive(self) -> bool {
        !matches!(self, ObservedState::Stopped)
    }

    /// Whether the runner finished its initial block sync.
    pub fn is_synced(self) -> bool {
        matches!(self, ObservedState::Standby | ObservedState::Active)
    }
}

impl std::fmt::Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservedState::Stopped => write!(f, "stopped"),
            ObservedState::Bootstrapping => write!(f, "bootstrapping"),
            ObservedState::Standby => write!(f, "standby"),
            ObservedState::Active => write!(f, "active"),
            ObservedState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One runner slot as seen during a single poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerObservation {
    pub index: usize,
    pub state: ObservedState,
    /// Last block height reported by the runner, if reachable.
    pub height: Option<u64>,
    /// When the current bootstrap started, if known to this process.
    pub booting_since: Option<DateTime<Utc>>,
}

impl RunnerObservation {
    pub fn new(index: usize, state: ObservedState) -> Self {
        Self {
            index,
            state,
            height: None,
            booting_since: None,
        }
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_booting_since(mut self, since: DateTime<Utc>) -> Self {
        self.booting_since = Some(since);
        self
    }

    /// Height used for ranking; unreachable runners rank lowest.
    pub fn rank_height(&self) -> u64 {
        self.height.unwrap_or(0)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Window `[start, end)` in which the fleet's key may be asked to lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductionEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ProductionEvent {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochBoundary {
    pub rollover_at: DateTime<Utc>,
}

/// Upcoming production events plus the next epoch rollover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub epoch: Option<EpochBoundary>,
    /// Ordered by start, non-overlapping.
    pub events: Vec<ProductionEvent>,
}

impl Schedule {
    /// Nothing learned yet (cold start).
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn new(epoch: Option<EpochBoundary>, mut events: Vec<ProductionEvent>) -> Self {
        events.sort();
        events.dedup();
        Self { epoch, events }
    }

    /// First event that has not finished at `now`.
    pub fn next_event(&self, now: DateTime<Utc>) -> Option<&ProductionEvent> {
        self.events.iter().find(|e| e.end > now)
    }
}

// ============================================================================
// Intent
// ============================================================================

/// Policy table entry that produced an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    EpochRollover,
    ScheduleUnknown,
    EventImminent,
    SteadyState,
}

impl std::fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyRule::EpochRollover => write!(f, "epoch_rollover"),
            PolicyRule::ScheduleUnknown => write!(f, "schedule_unknown"),
            PolicyRule::EventImminent => write!(f, "event_imminent"),
            PolicyRule::SteadyState => write!(f, "steady_state"),
        }
    }
}

/// Desired fleet configuration for one cycle. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetIntent {
    pub rule: PolicyRule,
    pub leader: Option<usize>,
    pub roles: BTreeMap<usize, Role>,
}

impl FleetIntent {
    pub fn role_of(&self, index: usize) -> Role {
        self.roles.get(&index).copied().unwrap_or(Role::Stopped)
    }

    pub fn count(&self, role: Role) -> usize {
        self.roles.values().filter(|r| **r == role).count()
    }
}

// ============================================================================
// Status snapshot
// ============================================================================

/// Static resources of a runner slot, reported alongside its observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub index: usize,
    pub unit: String,
    pub rest_port: u16,
    pub storage_path: String,
    pub config_path: String,
}

/// Latest view of the fleet, published after every cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub cycle: u64,
    pub observed_at: Option<DateTime<Utc>>,
    pub slots: Vec<SlotInfo>,
    pub runners: Vec<RunnerObservation>,
    pub intent: Option<FleetIntent>,
    pub handoff_target: Option<usize>,
    pub next_event: Option<ProductionEvent>,
    pub rollover_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
