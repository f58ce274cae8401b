//! Optional event stream emitted while a run progresses.

use ar_types::{FailureReason, TrialId, TrialStatus};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        resumed: bool,
    },
    BatchProposed {
        batch: usize,
        size: usize,
    },
    ProposalDiscarded {
        configuration: String,
        reason: String,
    },
    TrialStarted {
        trial_id: TrialId,
        number: usize,
    },
    TrialRetrying {
        trial_id: TrialId,
        attempt: u32,
        reason: FailureReason,
    },
    TrialFinished {
        trial_id: TrialId,
        status: TrialStatus,
    },
    FrontierChanged {
        size: usize,
        evicted: usize,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Best-effort publisher; a missing or disconnected receiver is not an error.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<RunEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<RunEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}
