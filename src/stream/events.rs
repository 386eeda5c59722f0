use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AssetId, CyclePhase, MonitorPhase, ParticipantRecord, ProgressReading, ReadingSource,
};

/// Every event on the wire is `{type, payload, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn now(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    ProgressUpdate {
        asset_id: AssetId,
        progress_fraction: f64,
        valuation_estimate: f64,
        complete: bool,
        phase: MonitorPhase,
        source: ReadingSource,
    },
    ThresholdReached {
        asset_id: AssetId,
        generation: u64,
        progress_fraction: f64,
        valuation_estimate: f64,
    },
    CycleComplete {
        /// Generation of the successor.
        generation: u64,
        retired_asset_id: AssetId,
        new_asset_id: AssetId,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_ref: Option<String>,
        participant_count: usize,
        distributed_amount: u64,
        batches_succeeded: usize,
        batches_failed: usize,
    },
    ParticipantRankingUpdate {
        asset_id: AssetId,
        participants: Vec<ParticipantRecord>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        asset_id: Option<AssetId>,
        needs_operator: bool,
    },
    /// Sent to each new subscriber before anything else.
    InitialState {
        active_asset_id: AssetId,
        generation: u64,
        phase: CyclePhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_reading: Option<ProgressReading>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ProgressUpdate { .. } => "progress_update",
            EventPayload::ThresholdReached { .. } => "threshold_reached",
            EventPayload::CycleComplete { .. } => "cycle_complete",
            EventPayload::ParticipantRankingUpdate { .. } => "participant_ranking_update",
            EventPayload::Error { .. } => "error",
            EventPayload::InitialState { .. } => "initial_state",
        }
    }

    pub fn progress(reading: &ProgressReading, phase: MonitorPhase) -> Self {
        EventPayload::ProgressUpdate {
            asset_id: reading.asset_id.clone(),
            progress_fraction: reading.progress_fraction,
            valuation_estimate: reading.valuation_estimate,
            complete: reading.complete,
            phase,
            source: reading.source,
        }
    }
}
