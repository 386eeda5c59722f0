//! Typed error hierarchy for the evolution lifecycle.
//!
//! One enum per subsystem:
//! - `FeedError`: progress reads (transient, absorbed unless retries run out)
//! - `EnumerationError`: holder snapshot sources
//! - `SubmissionError`: atomic claim/mint/seed sequence
//! - `DistributionError`: a single airdrop batch
//! - `StateError`: persisted cycle state
//! - `StoreError`: key-value backend
//! - `TriggerError`: a manual cycle trigger the event loop refused
//!
//! `CycleError` is what the orchestrator sees when a cycle aborts.

use thiserror::Error;

/// Errors from the progress feed adapter.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Transient feed error for {asset}: {message}")]
    Transient { asset: String, message: String },

    #[error("Polling {asset} failed {failures} consecutive times")]
    RetriesExhausted { asset: String, failures: u32 },

    #[error("Invalid asset account data: {0}")]
    Decode(String),
}

/// Errors from holder enumeration.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("Holder source '{source_name}' failed: {message}")]
    Source { source_name: String, message: String },

    #[error("All holder sources failed for {asset} (primary: {primary}; fallback: {fallback})")]
    AllSourcesFailed {
        asset: String,
        primary: String,
        fallback: String,
    },

    #[error("No participants with a non-zero balance for {asset}")]
    NoParticipants { asset: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the atomic execution sequence.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Failed to build {operation} operation: {message}")]
    Build { operation: String, message: String },

    #[error("Atomic submission rejected after {attempts} attempt(s): {message}")]
    Rejected { attempts: u32, message: String },

    /// Some but not all operations landed. Never retried automatically.
    #[error("Partial landing: {landed}/{total} operations landed ({message})")]
    PartialLanding {
        landed: usize,
        total: usize,
        reference: Option<String>,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a single distribution batch.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("Batch {batch_index} failed: {message}")]
    Batch { batch_index: usize, message: String },

    #[error("Nothing to distribute: {0}")]
    Empty(String),
}

/// Errors reading or writing the persisted cycle state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Persisted cycle state is corrupt ({key} = {value:?}): {reason}")]
    Corrupt {
        key: String,
        value: String,
        reason: String,
    },

    #[error("No cycle state persisted and no genesis asset configured")]
    MissingGenesis,

    #[error("Execution for generation {generation} on {asset} was interrupted; operator recovery required")]
    InterruptedExecution { generation: u64, asset: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the key-value backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Value at {key} is not {expected}")]
    WrongType { key: String, expected: String },
}

/// Why a manual trigger did not start a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error(
        "Trigger was for {expected_asset} generation {expected_generation}, but {active_asset} generation {generation} is active"
    )]
    Stale {
        expected_asset: String,
        expected_generation: u64,
        active_asset: String,
        generation: u64,
    },

    #[error("{asset} is neither held after a failed cycle nor halted; nothing to re-attempt")]
    NothingToRetry { asset: String },

    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// Any failure that aborts a running cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] EnumerationError),

    #[error("Execution failed: {0}")]
    Execution(#[from] SubmissionError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot start a cycle while phase is {phase}")]
    WrongPhase { phase: String },
}

impl CycleError {
    /// Partial landings leave ledger state that needs a human to reconcile.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            CycleError::Execution(SubmissionError::PartialLanding { .. })
                | CycleError::State(StateError::InterruptedExecution { .. })
        )
    }
}
