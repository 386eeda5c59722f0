//! HTTP adapter for the program relay.
//!
//! The relay owns the operator keys and the program-specific encoding. It
//! builds operations on request, returns raw curve account bytes and
//! submits signed transactions. Account existence checks go straight to the
//! node over JSON-RPC.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    AssetMetadata, AtomicBundle, LedgerProgram, MintOperation, Operation, OperationKind,
    RpcClient, SubmissionOutcome, Transfer, TransferLedger,
};
use crate::model::{AssetId, AssetState};

#[derive(Debug, Deserialize)]
struct CurveAccountResponse {
    /// Base64 account data; absent when the account does not exist.
    data: Option<String>,
}

#[derive(Debug, Serialize)]
struct SeedRequest<'a> {
    asset: &'a str,
    amount: u64,
    slippage_bps: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BundleStatus {
    Landed,
    Rejected,
    Partial,
}

#[derive(Debug, Deserialize)]
struct BundleResponse {
    status: BundleStatus,
    reference: Option<String>,
    #[serde(default)]
    landed: usize,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    amount: u64,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    asset: &'a str,
    transfers: &'a [Transfer],
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    reference: String,
}

pub struct RelayLedger {
    http: reqwest::Client,
    base_url: String,
    rpc: RpcClient,
}

impl RelayLedger {
    pub fn new(base_url: impl Into<String>, rpc: RpcClient, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build relay HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rpc,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        self.http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("relay POST {} failed", path))?
            .error_for_status()
            .with_context(|| format!("relay POST {} returned an error status", path))?
            .json::<T>()
            .await
            .with_context(|| format!("relay POST {} returned an unreadable body", path))
    }

    async fn build_op(
        &self,
        kind: OperationKind,
        body: &serde_json::Value,
    ) -> anyhow::Result<Operation> {
        let op: Operation = self.post(&format!("/ops/{}", kind), body).await?;
        if op.kind != kind {
            bail!("relay returned a {} operation for a {} request", op.kind, kind);
        }
        Ok(op)
    }
}

#[async_trait]
impl LedgerProgram for RelayLedger {
    async fn fetch_asset_state(&self, asset: &AssetId) -> anyhow::Result<Option<AssetState>> {
        let path = format!("/assets/{}/curve", asset);
        let resp: CurveAccountResponse = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .with_context(|| format!("relay GET {} failed", path))?
            .error_for_status()
            .with_context(|| format!("relay GET {} returned an error status", path))?
            .json()
            .await
            .context("curve account response unreadable")?;

        let Some(encoded) = resp.data else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .context("curve account data is not valid base64")?;
        Ok(Some(AssetState::decode(&bytes)?))
    }

    async fn build_claim_op(&self, retiring: &AssetId) -> anyhow::Result<Operation> {
        self.build_op(
            OperationKind::Claim,
            &serde_json::json!({ "asset": retiring.as_str() }),
        )
        .await
    }

    async fn build_mint_op(&self, metadata: &AssetMetadata) -> anyhow::Result<MintOperation> {
        let mint: MintOperation = self.post("/ops/mint", metadata).await?;
        if mint.operation.kind != OperationKind::Mint {
            bail!("relay returned a {} operation for a mint request", mint.operation.kind);
        }
        Ok(mint)
    }

    async fn build_seed_op(
        &self,
        asset: &AssetId,
        amount: u64,
        slippage_bps: u16,
    ) -> anyhow::Result<Operation> {
        let body = serde_json::to_value(SeedRequest {
            asset: asset.as_str(),
            amount,
            slippage_bps,
        })?;
        self.build_op(OperationKind::Seed, &body).await
    }

    async fn submit_atomic(&self, bundle: &AtomicBundle) -> anyhow::Result<SubmissionOutcome> {
        let resp: BundleResponse = self.post("/bundles", bundle).await?;
        debug!(status = ?resp.status, reference = ?resp.reference, "bundle response");
        let error = resp.error.unwrap_or_else(|| "unspecified".to_string());
        Ok(match resp.status {
            BundleStatus::Landed => SubmissionOutcome::Landed {
                reference: resp
                    .reference
                    .context("relay reported a landed bundle without a reference")?,
            },
            BundleStatus::Rejected => SubmissionOutcome::Rejected { error },
            BundleStatus::Partial => SubmissionOutcome::PartialLanding {
                landed: resp.landed,
                reference: resp.reference,
                error,
            },
        })
    }
}

#[async_trait]
impl TransferLedger for RelayLedger {
    async fn account_exists(&self, owner: &str, asset: &AssetId) -> anyhow::Result<bool> {
        self.rpc.token_account_exists(owner, asset).await
    }

    async fn operator_balance(&self, asset: &AssetId) -> anyhow::Result<u64> {
        let resp: BalanceResponse = self
            .http
            .get(self.url("/operator/balance"))
            .query(&[("asset", asset.as_str())])
            .send()
            .await
            .context("relay GET /operator/balance failed")?
            .error_for_status()
            .context("relay GET /operator/balance returned an error status")?
            .json()
            .await
            .context("balance response unreadable")?;
        Ok(resp.amount)
    }

    async fn submit_transfers(
        &self,
        asset: &AssetId,
        transfers: &[Transfer],
    ) -> anyhow::Result<String> {
        let resp: TransferResponse = self
            .post(
                "/transfers",
                &TransferRequest {
                    asset: asset.as_str(),
                    transfers,
                },
            )
            .await?;
        Ok(resp.reference)
    }
}
