//! Distribution Dispenser.
//!
//! Splits the ranked participants into fixed-size batches and sends each
//! batch an equal share of the successor in one transfer transaction,
//! creating recipient accounts where missing. Batches go out one after
//! another with a fixed pause. A failed batch is recorded and the rest
//! still run; nothing is re-driven automatically.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::DistributionConfig;
use crate::errors::DistributionError;
use crate::ledger::{Transfer, TransferLedger};
use crate::model::{AssetId, DistributionBatchResult, ParticipantRecord};

/// Equal per-participant share in base units, rounded down.
pub fn share_per_participant(total_amount: u64, participants: usize) -> u64 {
    if participants == 0 {
        return 0;
    }
    total_amount / participants as u64
}

pub struct Dispenser {
    ledger: Arc<dyn TransferLedger>,
    batch_size: usize,
    batch_delay: Duration,
}

impl Dispenser {
    pub fn new(ledger: Arc<dyn TransferLedger>, config: &DistributionConfig) -> Self {
        Self {
            ledger,
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        }
    }

    pub async fn distribute(
        &self,
        asset: &AssetId,
        participants: &[ParticipantRecord],
        total_amount: u64,
    ) -> Result<Vec<DistributionBatchResult>, DistributionError> {
        let mut seen = HashSet::new();
        let recipients: Vec<&str> = participants
            .iter()
            .map(|p| p.identity.as_str())
            .filter(|id| seen.insert(*id))
            .collect();

        if recipients.is_empty() {
            return Err(DistributionError::Empty("no participants".to_string()));
        }
        let amount_each = share_per_participant(total_amount, recipients.len());
        if amount_each == 0 {
            return Err(DistributionError::Empty(format!(
                "{} base units cannot be split across {} participants",
                total_amount,
                recipients.len()
            )));
        }

        let batches: Vec<&[&str]> = recipients.chunks(self.batch_size).collect();
        info!(
            asset = %asset.short(),
            recipients = recipients.len(),
            batches = batches.len(),
            amount_each,
            "starting distribution"
        );

        let mut results = Vec::with_capacity(batches.len());
        for (batch_index, batch) in batches.iter().enumerate() {
            let outcome = self.send_batch(asset, batch, amount_each).await;
            let result = match outcome {
                Ok(reference) => {
                    info!(batch_index, recipients = batch.len(), reference = %reference, "batch sent");
                    DistributionBatchResult {
                        batch_index,
                        recipient_count: batch.len(),
                        recipients: batch.iter().map(|r| r.to_string()).collect(),
                        amount_each,
                        success: true,
                        transaction_ref: Some(reference),
                        error: None,
                    }
                }
                Err(e) => {
                    let err = DistributionError::Batch {
                        batch_index,
                        message: format!("{:#}", e),
                    };
                    warn!(error = %err, "batch failed");
                    DistributionBatchResult {
                        batch_index,
                        recipient_count: batch.len(),
                        recipients: batch.iter().map(|r| r.to_string()).collect(),
                        amount_each,
                        success: false,
                        transaction_ref: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(result);

            if batch_index + 1 < batches.len() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(asset = %asset.short(), succeeded, total = results.len(), "distribution finished");
        Ok(results)
    }

    async fn send_batch(
        &self,
        asset: &AssetId,
        batch: &[&str],
        amount_each: u64,
    ) -> anyhow::Result<String> {
        let mut transfers = Vec::with_capacity(batch.len());
        for recipient in batch {
            let exists = match self.ledger.account_exists(recipient, asset).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(recipient, error = %e, "account lookup failed, will create");
                    false
                }
            };
            transfers.push(Transfer {
                recipient: recipient.to_string(),
                amount: amount_each,
                create_account: !exists,
            });
        }
        self.ledger.submit_transfers(asset, &transfers).await
    }
}
