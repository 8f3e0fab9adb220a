//! Schedule source: upcoming production windows and the next epoch rollover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use shared_types::{EpochBoundary, ObservedState, ProductionEvent, RunnerObservation, Schedule};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::node_api::{NodeApi, NodeApiError, NodeSettings};
use crate::runner::RunnerSlot;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no synced runner available to read the schedule from")]
    NoSource,
    #[error(transparent)]
    NodeApi(#[from] NodeApiError),
    #[error("invalid chain settings: {0}")]
    Settings(String),
}

pub type SharedScheduleSource = Arc<dyn ScheduleSource>;

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Current schedule. An empty schedule is the cold-start case, not an error.
    async fn fetch(
        &self,
        now: DateTime<Utc>,
        fleet: &[RunnerObservation],
    ) -> Result<Schedule, ScheduleError>;
}

/// Epoch arithmetic derived from the genesis settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    pub block0: DateTime<Utc>,
    pub slot_duration: TimeDelta,
    pub epoch_length: TimeDelta,
}

impl EpochClock {
    pub fn new(
        block0: DateTime<Utc>,
        slot_duration_secs: u64,
        slots_per_epoch: u64,
    ) -> Result<Self, ScheduleError> {
        let slot = i64::try_from(slot_duration_secs)
            .ok()
            .filter(|s| *s > 0)
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| ScheduleError::Settings(format!("slot duration {slot_duration_secs}")))?;
        let epoch_length = slot_duration_secs
            .checked_mul(slots_per_epoch)
            .and_then(|secs| i64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| ScheduleError::Settings(format!("slots per epoch {slots_per_epoch}")))?;

        Ok(Self {
            block0,
            slot_duration: slot,
            epoch_length,
        })
    }

    pub fn from_settings(settings: &NodeSettings) -> Result<Self, ScheduleError> {
        Self::new(
            settings.block0()?,
            settings.slot_duration,
            settings.slots_per_epoch,
        )
    }

    /// Epoch number at `now`; times before genesis count as epoch 0.
    pub fn epoch_at(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = now.signed_duration_since(self.block0).num_seconds().max(0);
        elapsed.div_euclid(self.epoch_length.num_seconds())
    }

    /// The rollover that ends the epoch containing `now`.
    pub fn next_rollover(&self, now: DateTime<Utc>) -> Option<EpochBoundary> {
        let epochs = self.epoch_at(now).checked_add(1)?;
        let offset = self
            .epoch_length
            .num_seconds()
            .checked_mul(epochs)
            .and_then(TimeDelta::try_seconds)?;
        let rollover_at = self.block0.checked_add_signed(offset)?;
        Some(EpochBoundary { rollover_at })
    }

    /// Production window of a slot scheduled at `start`.
    pub fn window(&self, start: DateTime<Utc>) -> ProductionEvent {
        ProductionEvent {
            start,
            end: start + self.slot_duration,
        }
    }
}

/// Reads the schedule from the runners themselves: genesis settings from any
/// synced runner, leader logs from the runner holding the key.
pub struct NodeScheduleSource {
    apis: HashMap<usize, NodeApi>,
    clock: Mutex<Option<EpochClock>>,
    /// Last learned schedule, reused until its epoch rolls over.
    learned: Mutex<Option<Schedule>>,
}

impl NodeScheduleSource {
    pub fn new(slots: &[RunnerSlot], request_timeout: Duration) -> Result<Self, NodeApiError> {
        let apis = slots
            .iter()
            .map(|slot| Ok((slot.index, NodeApi::new(slot.rest_url(), request_timeout)?)))
            .collect::<Result<HashMap<_, _>, NodeApiError>>()?;
        Ok(Self::with_apis(apis))
    }

    pub fn with_apis(apis: HashMap<usize, NodeApi>) -> Self {
        Self {
            apis,
            clock: Mutex::new(None),
            learned: Mutex::new(None),
        }
    }

    async fn clock(&self, candidates: &[&RunnerObservation]) -> Result<EpochClock, ScheduleError> {
        if let Some(clock) = *self.clock.lock().await {
            return Ok(clock);
        }

        let mut last_error = ScheduleError::NoSource;
        for obs in candidates {
            let Some(api) = self.apis.get(&obs.index) else {
                continue;
            };
            match api.settings().await.map_err(ScheduleError::from).and_then(|s| EpochClock::from_settings(&s)) {
                Ok(clock) => {
                    info!(
                        block0 = %clock.block0,
                        slot_secs = clock.slot_duration.num_seconds(),
                        epoch_secs = clock.epoch_length.num_seconds(),
                        "chain settings learned"
                    );
                    *self.clock.lock().await = Some(clock);
                    return Ok(clock);
                }
                Err(e) => {
                    debug!(runner = obs.index, error = %e, "settings unavailable");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn leader_events(
        &self,
        api: &NodeApi,
        clock: &EpochClock,
    ) -> Result<Vec<ProductionEvent>, ScheduleError> {
        let logs = api.leader_logs().await?;
        let events = logs
            .iter()
            .filter_map(|log| match log.scheduled_at() {
                Ok(start) => Some(clock.window(start)),
                Err(e) => {
                    warn!(error = %e, "skipping leader log entry");
                    None
                }
            })
            .collect();
        Ok(events)
    }
}

#[async_trait]
impl ScheduleSource for NodeScheduleSource {
    async fn fetch(
        &self,
        now: DateTime<Utc>,
        fleet: &[RunnerObservation],
    ) -> Result<Schedule, ScheduleError> {
        let mut candidates: Vec<&RunnerObservation> =
            fleet.iter().filter(|o| o.state.is_synced()).collect();
        candidates.sort_by_key(|o| (o.state != ObservedState::Active, std::cmp::Reverse(o.rank_height()), o.index));

        let clock = self.clock(&candidates).await?;
        let Some(boundary) = clock.next_rollover(now) else {
            return Err(ScheduleError::Settings("rollover out of range".to_string()));
        };

        let cached = self
            .learned
            .lock()
            .await
            .clone()
            .filter(|s| s.epoch == Some(boundary));
        if let Some(schedule) = cached.as_ref() {
            if schedule.next_event(now).is_some() {
                return Ok(schedule.clone());
            }
        }

        // Only the runner holding the key knows the leader schedule.
        let leader = candidates
            .iter()
            .find(|o| o.state == ObservedState::Active)
            .and_then(|o| self.apis.get(&o.index));
        if let Some(api) = leader {
            match self.leader_events(api, &clock).await {
                Ok(events) => {
                    let schedule = Schedule::new(Some(boundary), events);
                    info!(
                        events = schedule.events.len(),
                        rollover_at = %boundary.rollover_at,
                        "leader schedule learned"
                    );
                    *self.learned.lock().await = Some(schedule.clone());
                    return Ok(schedule);
                }
                Err(e) => warn!(error = %e, "cannot read leader schedule"),
            }
        }

        Ok(cached.unwrap_or_else(|| Schedule::new(Some(boundary), Vec::new())))
    }
}
