//! In-memory collaborators for tests and local dry runs.
//!
//! Real implementations: `RelayLedger`, `DasHolderSource`,
//! `ScanHolderSource`, `StreamPublisher`. Test doubles: [`MockLedger`],
//! [`StaticHolders`], [`RecordingPublisher`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ledger::{
    AssetMetadata, AtomicBundle, HolderBalance, HolderPage, HolderSource, LedgerProgram,
    MintOperation, Operation, OperationKind, SubmissionOutcome, Transfer, TransferLedger,
};
use crate::model::{AssetId, AssetState};
use crate::stream::{LifecycleEvent, Publisher};

/// Scriptable ledger. Everything it is asked to do is recorded.
#[derive(Default)]
pub struct MockLedger {
    /// Served first, one per `fetch_asset_state` call.
    pub queued_states: Mutex<VecDeque<anyhow::Result<Option<AssetState>>>>,
    /// Per-asset state, checked after the queue.
    pub asset_states: Mutex<HashMap<AssetId, AssetState>>,
    /// Served once the queue is empty and no per-asset state matches.
    pub state: Mutex<Option<AssetState>>,
    /// One per submission; `Landed` when empty.
    pub outcomes: Mutex<VecDeque<SubmissionOutcome>>,
    pub submitted: Mutex<Vec<AtomicBundle>>,
    pub minted: Mutex<Vec<AssetMetadata>>,
    pub fail_build: Mutex<Option<OperationKind>>,
    pub existing_accounts: Mutex<HashSet<String>>,
    pub operator_balance: Mutex<u64>,
    /// Zero-based transfer calls that fail.
    pub failing_transfer_calls: Mutex<HashSet<usize>>,
    pub transfers: Mutex<Vec<Vec<Transfer>>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: AssetState) -> Self {
        let ledger = Self::default();
        ledger.set_state(state);
        ledger
    }

    pub fn set_state(&self, state: AssetState) {
        *lock(&self.state) = Some(state);
    }

    pub fn set_asset_state(&self, asset: &AssetId, state: AssetState) {
        lock(&self.asset_states).insert(asset.clone(), state);
    }

    pub fn queue_outcome(&self, outcome: SubmissionOutcome) {
        lock(&self.outcomes).push_back(outcome);
    }

    pub fn submitted(&self) -> Vec<AtomicBundle> {
        lock(&self.submitted).clone()
    }

    pub fn transfers(&self) -> Vec<Vec<Transfer>> {
        lock(&self.transfers).clone()
    }

    pub fn set_operator_balance(&self, amount: u64) {
        *lock(&self.operator_balance) = amount;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn op(kind: OperationKind, signers: &[&str]) -> Operation {
    Operation {
        kind,
        payload: format!("{}-payload", kind),
        signers: signers.iter().map(|s| s.to_string()).collect(),
    }
}

impl MockLedger {
    fn check_build(&self, kind: OperationKind) -> anyhow::Result<()> {
        if *lock(&self.fail_build) == Some(kind) {
            anyhow::bail!("{} builder unavailable", kind);
        }
        Ok(())
    }
}

/// A curve at the given quote reserve with a billion-unit supply.
pub fn curve_state(virtual_quote: f64, complete: bool) -> AssetState {
    AssetState {
        virtual_base: 1_000_000_000.0,
        virtual_quote,
        real_base: 0.0,
        real_quote: 0.0,
        total_supply: 1_000_000_000.0,
        complete,
    }
}

#[async_trait]
impl LedgerProgram for MockLedger {
    async fn fetch_asset_state(&self, asset: &AssetId) -> anyhow::Result<Option<AssetState>> {
        if let Some(next) = lock(&self.queued_states).pop_front() {
            return next;
        }
        if let Some(state) = lock(&self.asset_states).get(asset) {
            return Ok(Some(*state));
        }
        Ok(*lock(&self.state))
    }

    async fn build_claim_op(&self, _retiring: &AssetId) -> anyhow::Result<Operation> {
        self.check_build(OperationKind::Claim)?;
        Ok(op(OperationKind::Claim, &["operator"]))
    }

    async fn build_mint_op(&self, metadata: &AssetMetadata) -> anyhow::Result<MintOperation> {
        self.check_build(OperationKind::Mint)?;
        let mut minted = lock(&self.minted);
        minted.push(metadata.clone());
        Ok(MintOperation {
            operation: op(OperationKind::Mint, &["operator", "successor"]),
            asset_id: AssetId::new(format!("Successor{}", minted.len())),
        })
    }

    async fn build_seed_op(
        &self,
        _asset: &AssetId,
        _amount: u64,
        _slippage_bps: u16,
    ) -> anyhow::Result<Operation> {
        self.check_build(OperationKind::Seed)?;
        Ok(op(OperationKind::Seed, &["operator"]))
    }

    async fn submit_atomic(&self, bundle: &AtomicBundle) -> anyhow::Result<SubmissionOutcome> {
        let n = {
            let mut submitted = lock(&self.submitted);
            submitted.push(bundle.clone());
            submitted.len()
        };
        Ok(lock(&self.outcomes)
            .pop_front()
            .unwrap_or_else(|| SubmissionOutcome::Landed {
                reference: format!("bundle-{}", n),
            }))
    }
}

#[async_trait]
impl TransferLedger for MockLedger {
    async fn account_exists(&self, owner: &str, _asset: &AssetId) -> anyhow::Result<bool> {
        Ok(lock(&self.existing_accounts).contains(owner))
    }

    async fn operator_balance(&self, _asset: &AssetId) -> anyhow::Result<u64> {
        Ok(*lock(&self.operator_balance))
    }

    async fn submit_transfers(
        &self,
        _asset: &AssetId,
        transfers: &[Transfer],
    ) -> anyhow::Result<String> {
        let call = {
            let mut log = lock(&self.transfers);
            log.push(transfers.to_vec());
            log.len() - 1
        };
        if lock(&self.failing_transfer_calls).contains(&call) {
            anyhow::bail!("transfer {} dropped", call);
        }
        Ok(format!("transfer-{}", call))
    }
}

/// Serves a fixed holder list in pages, or always fails.
pub struct StaticHolders {
    name: &'static str,
    holders: Vec<HolderBalance>,
    fail: bool,
    pages_served: Mutex<u32>,
}

impl StaticHolders {
    pub fn new(name: &'static str, holders: Vec<HolderBalance>) -> Self {
        Self {
            name,
            holders,
            fail: false,
            pages_served: Mutex::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, Vec::new())
        }
    }

    pub fn pages_served(&self) -> u32 {
        *lock(&self.pages_served)
    }
}

pub fn holder(owner: &str, amount: f64) -> HolderBalance {
    HolderBalance {
        owner: owner.to_string(),
        amount,
    }
}

#[async_trait]
impl HolderSource for StaticHolders {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch_page(
        &self,
        _asset: &AssetId,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<HolderPage> {
        if self.fail {
            anyhow::bail!("{} unavailable", self.name);
        }
        *lock(&self.pages_served) += 1;
        let start = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
        let end = start.saturating_add(limit as usize).min(self.holders.len());
        let holders = self.holders.get(start..end).unwrap_or_default().to_vec();
        Ok(HolderPage {
            has_more: end < self.holders.len(),
            holders,
        })
    }
}

/// Keeps every published event and wakes waiters on each one.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<LifecycleEvent>>,
    notify: Notify,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(|e| e.payload.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.payload.kind() == kind)
            .count()
    }

    /// Wait until at least `n` events of `kind` were published and return
    /// the n-th one.
    pub async fn wait_for_nth(&self, kind: &str, n: usize) -> LifecycleEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = lock(&self.events)
                .iter()
                .filter(|e| e.payload.kind() == kind)
                .nth(n.saturating_sub(1))
            {
                return event.clone();
            }
            notified.await;
        }
    }

    pub async fn wait_for(&self, kind: &str) -> LifecycleEvent {
        self.wait_for_nth(kind, 1).await
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: &LifecycleEvent) {
        lock(&self.events).push(event.clone());
        self.notify.notify_waiters();
    }
}
