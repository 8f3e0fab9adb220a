//! Translate an intent into process-manager commands.
//!
//! Promotions are the only commands that can create a second leader, so they
//! are withheld whenever another runner is observed active (or might be), and
//! whenever this same plan releases a leader. The next cycle re-observes and
//! promotes once the outgoing leader is confirmed stopped or demoted.

use shared_types::{FleetIntent, ObservedState, Role, RunnerObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop the runner process.
    Stop(usize),
    /// Remove leader capability, keep the process running.
    Demote(usize),
    /// Start the runner process; it bootstraps on its own.
    Launch(usize),
    /// Register the leader secret on a synced runner.
    Promote(usize),
}

impl Command {
    pub fn index(self) -> usize {
        match self {
            Command::Stop(i) | Command::Demote(i) | Command::Launch(i) | Command::Promote(i) => i,
        }
    }

    /// The role asked from the process manager when this command is issued.
    pub fn role(self) -> Role {
        match self {
            Command::Stop(_) => Role::Stopped,
            Command::Demote(_) => Role::Standby,
            Command::Launch(_) => Role::Bootstrapping,
            Command::Promote(_) => Role::Active,
        }
    }

    fn order(self) -> u8 {
        match self {
            Command::Stop(_) => 0,
            Command::Demote(_) => 1,
            Command::Launch(_) => 2,
            Command::Promote(_) => 3,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Stop(i) => write!(f, "stop runner {i}"),
            Command::Demote(i) => write!(f, "demote runner {i}"),
            Command::Launch(i) => write!(f, "launch runner {i}"),
            Command::Promote(i) => write!(f, "promote runner {i}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Ordered: stops, demotions, launches, promotions.
    pub commands: Vec<Command>,
    /// Promotions deferred to a later cycle.
    pub withheld: Vec<usize>,
}

fn command_for(obs: &RunnerObservation, desired: Role) -> Option<Command> {
    let index = obs.index;
    match (obs.state, desired) {
        (ObservedState::Stopped, Role::Stopped) => None,
        (_, Role::Stopped) => Some(Command::Stop(index)),
        (ObservedState::Stopped, _) => Some(Command::Launch(index)),
        (ObservedState::Active, Role::Standby | Role::Bootstrapping) => Some(Command::Demote(index)),
        (ObservedState::Standby, Role::Active) => Some(Command::Promote(index)),
        // Bootstrapping runners finish syncing on their own and are never promoted
        // directly; unknown runners are always asked to stop by the policy.
        _ => None,
    }
}

pub fn plan_commands(fleet: &[RunnerObservation], intent: &FleetIntent) -> Plan {
    let mut commands: Vec<Command> = fleet
        .iter()
        .filter_map(|obs| command_for(obs, intent.role_of(obs.index)))
        .collect();

    let was_active = |index: usize| {
        fleet
            .iter()
            .any(|o| o.index == index && o.state == ObservedState::Active)
    };
    let releases_leader = commands.iter().any(|c| match c {
        Command::Stop(i) | Command::Demote(i) => was_active(*i),
        _ => false,
    });
    let other_leader = |index: usize| {
        fleet.iter().any(|o| {
            o.index != index && matches!(o.state, ObservedState::Active | ObservedState::Unknown)
        })
    };

    let mut withheld = Vec::new();
    commands.retain(|c| match c {
        Command::Promote(i) if releases_leader || other_leader(*i) => {
            withheld.push(*i);
            false
        }
        _ => true,
    });
    commands.sort_by_key(|c| c.order());

    Plan { commands, withheld }
}
