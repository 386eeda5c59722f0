//! Atomic Execution Sequencer.
//!
//! Builds claim (optional), mint and seed in that order and submits them as
//! one atomic bundle. A rejected bundle is retried with the escalated tip
//! until the fee schedule runs out; a partial landing is never retried.
//!
//! The sequencer does not touch `CycleState`. It writes a
//! `pending_execution` marker before the first submission and an audit
//! record under `execution:{generation}` after every attempt.

mod fees;

pub use fees::FeeSchedule;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{ExecutionConfig, MetadataConfig};
use crate::errors::{StoreError, SubmissionError};
use crate::ledger::{AssetMetadata, AtomicBundle, LedgerProgram, Operation, SubmissionOutcome};
use crate::model::{AssetId, ExecutionResult, ParticipantRecord};
use crate::store::KeyValueStore;

pub const PENDING_EXECUTION_KEY: &str = "pending_execution";

pub fn execution_key(generation: u64) -> String {
    format!("execution:{}", generation)
}

/// Written before submission; its presence after a restart means an
/// execution may have landed without the state being updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExecution {
    pub generation: u64,
    pub asset: AssetId,
    pub successor: AssetId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub tip: u64,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audit entry for one run of the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub generation: u64,
    pub retiring_asset: AssetId,
    pub successor: Option<AssetId>,
    pub participant_count: usize,
    pub attempts: Vec<AttemptRecord>,
    pub success: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of [`ExecutionSequencer::execute`]. `error` is set exactly when
/// `result.success` is false.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    pub error: Option<SubmissionError>,
}

impl ExecutionOutcome {
    fn failed(cycle_id: u64, attempts: u32, error: SubmissionError) -> Self {
        let reference = match &error {
            SubmissionError::PartialLanding { reference, .. } => reference.clone(),
            _ => None,
        };
        Self {
            result: ExecutionResult {
                cycle_id,
                success: false,
                new_asset_id: None,
                transaction_ref: reference,
                error: Some(error.to_string()),
                attempts,
            },
            error: Some(error),
        }
    }
}

pub struct ExecutionSequencer {
    ledger: Arc<dyn LedgerProgram>,
    store: Arc<dyn KeyValueStore>,
    config: ExecutionConfig,
    metadata: MetadataConfig,
    fees: FeeSchedule,
}

impl ExecutionSequencer {
    pub fn new(
        ledger: Arc<dyn LedgerProgram>,
        store: Arc<dyn KeyValueStore>,
        config: ExecutionConfig,
        metadata: MetadataConfig,
    ) -> Self {
        let fees = FeeSchedule::from_config(&config);
        Self {
            ledger,
            store,
            config,
            metadata,
            fees,
        }
    }

    /// Retire `asset` (current `generation`) and create its successor.
    pub async fn execute(
        &self,
        asset: &AssetId,
        generation: u64,
        participants: &[ParticipantRecord],
    ) -> ExecutionOutcome {
        let metadata = AssetMetadata::for_generation(
            generation + 1,
            &self.metadata.name_prefix,
            &self.metadata.symbol_prefix,
            &self.metadata.base_uri,
        );
        info!(
            asset = %asset.short(),
            generation,
            successor_name = %metadata.name,
            participants = participants.len(),
            claim = self.config.claim_enabled,
            "executing sequence"
        );

        let (operations, successor) = match self.build_operations(asset, &metadata).await {
            Ok(built) => built,
            Err(e) => {
                error!(asset = %asset.short(), error = %e, "failed to build operations");
                return ExecutionOutcome::failed(generation, 0, e);
            }
        };

        let pending = PendingExecution {
            generation,
            asset: asset.clone(),
            successor: successor.clone(),
            started_at: Utc::now(),
        };
        if let Err(e) = self.write_json(PENDING_EXECUTION_KEY, &pending).await {
            return ExecutionOutcome::failed(generation, 0, e.into());
        }

        let mut record = ExecutionRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            generation,
            retiring_asset: asset.clone(),
            successor: Some(successor.clone()),
            participant_count: participants.len(),
            attempts: Vec::new(),
            success: None,
            started_at: pending.started_at,
            finished_at: None,
        };

        let mut attempt = 0;
        let mut last_error = String::new();
        while let Some(tip) = self.fees.fee_for_attempt(attempt) {
            let bundle = AtomicBundle::new(operations.clone(), tip);
            let outcome = match self.ledger.submit_atomic(&bundle).await {
                Ok(outcome) => outcome,
                Err(e) => SubmissionOutcome::Rejected {
                    error: format!("{:#}", e),
                },
            };
            attempt += 1;

            match outcome {
                SubmissionOutcome::Landed { reference } => {
                    info!(asset = %asset.short(), successor = %successor, attempt, tip, reference = %reference, "sequence landed");
                    record.attempts.push(AttemptRecord {
                        attempt,
                        tip,
                        outcome: "landed".to_string(),
                        reference: Some(reference.clone()),
                        error: None,
                    });
                    self.finish_record(&mut record, true).await;
                    return ExecutionOutcome {
                        result: ExecutionResult {
                            cycle_id: generation,
                            success: true,
                            new_asset_id: Some(successor),
                            transaction_ref: Some(reference),
                            error: None,
                            attempts: attempt,
                        },
                        error: None,
                    };
                }
                SubmissionOutcome::Rejected { error } => {
                    warn!(asset = %asset.short(), attempt, tip, error = %error, "sequence rejected");
                    record.attempts.push(AttemptRecord {
                        attempt,
                        tip,
                        outcome: "rejected".to_string(),
                        reference: None,
                        error: Some(error.clone()),
                    });
                    self.save_record(&record).await;
                    last_error = error;
                }
                SubmissionOutcome::PartialLanding {
                    landed,
                    reference,
                    error,
                } => {
                    error!(
                        asset = %asset.short(),
                        landed,
                        total = operations.len(),
                        error = %error,
                        "partial landing, operator action required"
                    );
                    record.attempts.push(AttemptRecord {
                        attempt,
                        tip,
                        outcome: "partial".to_string(),
                        reference: reference.clone(),
                        error: Some(error.clone()),
                    });
                    self.finish_record(&mut record, false).await;
                    // The pending marker stays so a restart halts for recovery.
                    return ExecutionOutcome::failed(
                        generation,
                        attempt,
                        SubmissionError::PartialLanding {
                            landed,
                            total: operations.len(),
                            reference,
                            message: error,
                        },
                    );
                }
            }
        }

        self.finish_record(&mut record, false).await;
        if let Err(e) = self.store.del(PENDING_EXECUTION_KEY).await {
            warn!(error = %e, "failed to clear pending execution marker");
        }
        ExecutionOutcome::failed(
            generation,
            attempt,
            SubmissionError::Rejected {
                attempts: attempt,
                message: last_error,
            },
        )
    }

    /// Every stored run for a generation, oldest first.
    pub async fn records(&self, generation: u64) -> Result<Vec<ExecutionRecord>, StoreError> {
        let key = execution_key(generation);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|_| StoreError::WrongType {
                key,
                expected: "a list of execution records".to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn build_operations(
        &self,
        asset: &AssetId,
        metadata: &AssetMetadata,
    ) -> Result<(Vec<Operation>, AssetId), SubmissionError> {
        let build_err = |operation: &str, e: anyhow::Error| SubmissionError::Build {
            operation: operation.to_string(),
            message: format!("{:#}", e),
        };

        let mut operations = Vec::with_capacity(3);
        if self.config.claim_enabled {
            let claim = self
                .ledger
                .build_claim_op(asset)
                .await
                .map_err(|e| build_err("claim", e))?;
            operations.push(claim);
        }

        let mint = self
            .ledger
            .build_mint_op(metadata)
            .await
            .map_err(|e| build_err("mint", e))?;
        let successor = mint.asset_id.clone();
        operations.push(mint.operation);

        let seed = self
            .ledger
            .build_seed_op(&successor, self.config.seed_amount, self.config.slippage_bps)
            .await
            .map_err(|e| build_err("seed", e))?;
        operations.push(seed);

        Ok((operations, successor))
    }

    async fn finish_record(&self, record: &mut ExecutionRecord, success: bool) {
        record.success = Some(success);
        record.finished_at = Some(Utc::now());
        self.save_record(record).await;
    }

    /// Replace this run's entry in the generation's list, appending on the
    /// first write. Audit writes never fail the sequence.
    async fn save_record(&self, record: &ExecutionRecord) {
        let result = async {
            let mut runs = self.records(record.generation).await?;
            match runs.iter_mut().find(|r| r.run_id == record.run_id) {
                Some(existing) => *existing = record.clone(),
                None => runs.push(record.clone()),
            }
            self.write_json(&execution_key(record.generation), &runs)
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(generation = record.generation, error = %e, "failed to write execution record");
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?;
        self.store.set(key, &json).await
    }
}
