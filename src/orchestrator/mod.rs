//! Orchestrator.
//!
//! Owns `CycleState` and is its only writer. One event loop serializes
//! monitor events, ranking updates and operator commands, and drives each
//! cycle: pause rankings, snapshot, execute, advance the state, distribute,
//! clear the old snapshot, switch the monitor, resume rankings, publish.

mod runner;
pub mod state;

pub use runner::{Orchestrator, Services, distribution_key, recover};
pub use state::CycleStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::errors::TriggerError;
use crate::executor::PendingExecution;
use crate::model::{AssetId, CycleState, CyclePhase, MonitorPhase, ProgressReading};

/// Read-only view published by the event loop after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub active_asset_id: AssetId,
    pub generation: u64,
    pub phase: CyclePhase,
    pub monitor_phase: MonitorPhase,
    pub cycle_running: bool,
    /// Set after a failed cycle; threshold signals for the asset are
    /// ignored until a manual trigger.
    pub held: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reading: Option<ProgressReading>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub asset: AssetId,
    pub generation: u64,
}

/// What `evolver recover` changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub state: CycleState,
    pub cleared_marker: Option<PendingExecution>,
}

pub(crate) enum Command {
    Trigger {
        /// Asset and generation the caller saw; a trigger for anything else
        /// is refused.
        expected: Option<(AssetId, u64)>,
        reply: oneshot::Sender<Result<TriggerAck, TriggerError>>,
    },
}

/// Cloneable handle for the HTTP layer and the binary.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusReport>,
}

impl OrchestratorHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, status: watch::Receiver<StatusReport>) -> Self {
        Self { commands, status }
    }

    /// Current phase, active asset and generation. No side effects.
    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }

    /// Ask the event loop to re-attempt the cycle for a held or halted
    /// asset. With `expected`, the trigger only applies to that asset and
    /// generation. Returns once the request is accepted or refused, not
    /// when the cycle ends.
    pub async fn trigger(
        &self,
        expected: Option<(AssetId, u64)>,
    ) -> Result<TriggerAck, TriggerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Trigger { expected, reply })
            .await
            .map_err(|_| TriggerError::Unavailable("orchestrator is not running".to_string()))?;
        rx.await.map_err(|_| {
            TriggerError::Unavailable("orchestrator stopped before answering the trigger".to_string())
        })?
    }
}
