//! Ledger collaborators.
//!
//! The lifecycle never encodes program instructions itself. It asks a
//! [`LedgerProgram`] to build claim / mint / seed operations as opaque
//! payloads and to submit them together, reads holders through a
//! [`HolderSource`], and moves the successor asset through a
//! [`TransferLedger`].

pub mod relay;
pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{AssetId, AssetState};

pub use relay::RelayLedger;
pub use rpc::{DasHolderSource, RpcClient, ScanHolderSource};

/// Which step of the atomic sequence an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Claim,
    Mint,
    Seed,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Claim => write!(f, "claim"),
            OperationKind::Mint => write!(f, "mint"),
            OperationKind::Seed => write!(f, "seed"),
        }
    }
}

/// A built, not yet submitted, ledger operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// Program-specific encoded instruction, opaque to the lifecycle.
    pub payload: String,
    /// Keys that must sign, by the names the program adapter knows them by.
    #[serde(default)]
    pub signers: Vec<String>,
}

/// A freshly built mint operation and the id the successor will have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintOperation {
    pub operation: Operation,
    pub asset_id: AssetId,
}

/// Display metadata for a successor asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub name: String,
    pub symbol: String,
    pub uri: String,
}

impl AssetMetadata {
    /// Deterministic metadata for a generation: the prefixes followed by the
    /// generation zero-padded to three digits.
    pub fn for_generation(
        generation: u64,
        name_prefix: &str,
        symbol_prefix: &str,
        base_uri: &str,
    ) -> Self {
        Self {
            name: format!("{}{:03}", name_prefix, generation),
            symbol: format!("{}{:03}", symbol_prefix, generation),
            uri: base_uri.to_string(),
        }
    }
}

/// Operations that must land together or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicBundle {
    pub operations: Vec<Operation>,
    pub signers: Vec<String>,
    /// Priority tip for this attempt, in quote base units.
    pub tip: u64,
}

impl AtomicBundle {
    /// Collect the operations in order and the union of their signers.
    pub fn new(operations: Vec<Operation>, tip: u64) -> Self {
        let mut signers: Vec<String> = Vec::new();
        for op in &operations {
            for s in &op.signers {
                if !signers.contains(s) {
                    signers.push(s.clone());
                }
            }
        }
        Self {
            operations,
            signers,
            tip,
        }
    }
}

/// What the ledger reports after an atomic submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Every operation landed.
    Landed { reference: String },
    /// Nothing landed; safe to retry.
    Rejected { error: String },
    /// Some operations landed and some did not.
    PartialLanding {
        landed: usize,
        reference: Option<String>,
        error: String,
    },
}

/// Program-specific operations.
#[async_trait]
pub trait LedgerProgram: Send + Sync {
    /// Current curve state, or `None` when the account does not exist yet.
    async fn fetch_asset_state(&self, asset: &AssetId) -> anyhow::Result<Option<AssetState>>;

    async fn build_claim_op(&self, retiring: &AssetId) -> anyhow::Result<Operation>;

    async fn build_mint_op(&self, metadata: &AssetMetadata) -> anyhow::Result<MintOperation>;

    async fn build_seed_op(
        &self,
        asset: &AssetId,
        amount: u64,
        slippage_bps: u16,
    ) -> anyhow::Result<Operation>;

    async fn submit_atomic(&self, bundle: &AtomicBundle) -> anyhow::Result<SubmissionOutcome>;
}

/// One holder account as reported by a holder source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderBalance {
    pub owner: String,
    /// Whole units.
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HolderPage {
    pub holders: Vec<HolderBalance>,
    pub has_more: bool,
}

/// Paginated enumeration of an asset's holder accounts.
#[async_trait]
pub trait HolderSource: Send + Sync {
    fn name(&self) -> &str;

    /// Pages are numbered from 1.
    async fn fetch_page(&self, asset: &AssetId, page: u32, limit: u32)
    -> anyhow::Result<HolderPage>;
}

/// One recipient inside a distribution batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub recipient: String,
    /// Base units.
    pub amount: u64,
    /// The recipient has no account for this asset yet.
    pub create_account: bool,
}

/// Asset transfers from the operator account.
#[async_trait]
pub trait TransferLedger: Send + Sync {
    async fn account_exists(&self, owner: &str, asset: &AssetId) -> anyhow::Result<bool>;

    /// Operator's balance of `asset`, in base units.
    async fn operator_balance(&self, asset: &AssetId) -> anyhow::Result<u64>;

    /// Submit one transaction carrying every transfer; returns its reference.
    async fn submit_transfers(&self, asset: &AssetId, transfers: &[Transfer])
    -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, signers: &[&str]) -> Operation {
        Operation {
            kind,
            payload: String::new(),
            signers: signers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn metadata_pads_generation() {
        let meta = AssetMetadata::for_generation(7, "Evolver", "EVO", "https://x");
        assert_eq!(meta.name, "Evolver007");
        assert_eq!(meta.symbol, "EVO007");
        let meta = AssetMetadata::for_generation(1234, "E", "E", "u");
        assert_eq!(meta.name, "E1234");
    }

    #[test]
    fn bundle_collects_signers_without_duplicates() {
        let bundle = AtomicBundle::new(
            vec![
                op(OperationKind::Mint, &["operator", "new_mint"]),
                op(OperationKind::Seed, &["operator"]),
            ],
            42,
        );
        assert_eq!(bundle.signers, vec!["operator", "new_mint"]);
        assert_eq!(bundle.operations[0].kind, OperationKind::Mint);
        assert_eq!(bundle.tip, 42);
    }

    #[test]
    fn operation_kind_serializes_lowercase() {
        let json = serde_json::to_string(&OperationKind::Seed).unwrap();
        assert_eq!(json, "\"seed\"");
    }
}
