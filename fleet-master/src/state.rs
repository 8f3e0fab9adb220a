use std::sync::Arc;

use shared_types::FleetSnapshot;
use tokio::sync::{Mutex, RwLock};

use crate::runner::RunnerSlot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("runner {index} does not exist (fleet has {slots} slots)")]
    NoSuchRunner { index: usize, slots: usize },
}

/// State shared between the orchestrator loop and the admin API.
///
/// Holds no intent: only the last published snapshot and the operator's
/// pending hand-off request.
pub struct AppState {
    slot_count: usize,
    snapshot: RwLock<FleetSnapshot>,
    handoff: Mutex<Option<usize>>,
}

impl AppState {
    pub fn new(slots: &[RunnerSlot]) -> Arc<Self> {
        let snapshot = FleetSnapshot {
            slots: slots.iter().map(RunnerSlot::info).collect(),
            ..FleetSnapshot::default()
        };
        Arc::new(Self {
            slot_count: slots.len(),
            snapshot: RwLock::new(snapshot),
            handoff: Mutex::new(None),
        })
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn publish(&self, snapshot: FleetSnapshot) {
        *self.snapshot.write().await = snapshot;
    }

    /// Ask the loop to move leadership to `index`. Replaces a pending request.
    pub async fn request_handoff(&self, index: usize) -> Result<Option<usize>, HandoffError> {
        if index >= self.slot_count {
            return Err(HandoffError::NoSuchRunner {
                index,
                slots: self.slot_count,
            });
        }
        Ok(self.handoff.lock().await.replace(index))
    }

    pub async fn cancel_handoff(&self) -> Option<usize> {
        self.handoff.lock().await.take()
    }

    pub async fn handoff_target(&self) -> Option<usize> {
        *self.handoff.lock().await
    }

    /// Clear the request if it still targets `index`.
    pub async fn complete_handoff(&self, index: usize) -> bool {
        let mut handoff = self.handoff.lock().await;
        if *handoff == Some(index) {
            *handoff = None;
            true
        } else {
            false
        }
    }
}
