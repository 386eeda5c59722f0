use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::CycleStore;
use super::{Command, OrchestratorHandle, RecoveryReport, StatusReport, TriggerAck};
use crate::broadcast::{RankingBroadcaster, RankingUpdate};
use crate::config::EvolverConfig;
use crate::dispenser::Dispenser;
use crate::errors::{CycleError, StateError, SubmissionError, TriggerError};
use crate::executor::{ExecutionOutcome, ExecutionSequencer};
use crate::feed::{FeedSettings, PushHub};
use crate::ledger::{HolderSource, LedgerProgram, TransferLedger};
use crate::model::{
    AssetId, CyclePhase, CycleState, DistributionBatchResult, MonitorPhase, ParticipantRecord,
    ProgressReading,
};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorSettings, PhaseMonitor};
use crate::price::PriceFeed;
use crate::snapshot::SnapshotEngine;
use crate::store::KeyValueStore;
use crate::stream::{EventPayload, LifecycleEvent, Publisher};

const MONITOR_CHANNEL: usize = 256;
const RANKING_CHANNEL: usize = 4;
const COMMAND_CHANNEL: usize = 8;

pub fn distribution_key(generation: u64) -> String {
    format!("distribution:{}", generation)
}

/// External collaborators the orchestrator is wired with.
pub struct Services {
    pub ledger: Arc<dyn LedgerProgram>,
    pub transfers: Arc<dyn TransferLedger>,
    pub primary_holders: Arc<dyn HolderSource>,
    pub fallback_holders: Arc<dyn HolderSource>,
    pub price: Arc<dyn PriceFeed>,
    pub store: Arc<dyn KeyValueStore>,
    pub publisher: Arc<dyn Publisher>,
    pub push: PushHub,
}

pub struct Orchestrator {
    cycles: CycleStore,
    store: Arc<dyn KeyValueStore>,
    state: CycleState,
    halted: Option<String>,
    hold: Option<AssetId>,
    cycle_running: bool,
    last_reading: Option<ProgressReading>,
    monitor: PhaseMonitor,
    monitor_rx: mpsc::Receiver<MonitorEvent>,
    snapshot: Arc<SnapshotEngine>,
    executor: ExecutionSequencer,
    dispenser: Dispenser,
    transfers: Arc<dyn TransferLedger>,
    broadcaster: RankingBroadcaster,
    ranking_rx: mpsc::Receiver<RankingUpdate>,
    publisher: Arc<dyn Publisher>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<StatusReport>,
}

impl Orchestrator {
    /// Load (or seed) the persisted state and wire every component. A
    /// corrupt state is returned as an error; nothing is reinitialised.
    pub async fn new(
        config: EvolverConfig,
        services: Services,
    ) -> Result<(Self, OrchestratorHandle), CycleError> {
        let cycles = CycleStore::new(services.store.clone());
        let genesis = config.genesis_asset.as_deref().map(AssetId::from);
        let state = cycles.load_or_init(genesis.as_ref()).await?;
        let hold = cycles.hold().await?;

        let mut halted = None;
        if let Some(pending) = cycles.pending_execution().await? {
            if pending.generation < state.generation {
                info!(
                    generation = pending.generation,
                    current = state.generation,
                    "clearing stale pending execution marker"
                );
                cycles.clear_pending_execution().await?;
            } else if state.phase == CyclePhase::Executing {
                let err = StateError::InterruptedExecution {
                    generation: pending.generation,
                    asset: pending.asset.to_string(),
                };
                error!(
                    error = %err,
                    successor = %pending.successor,
                    "execution may have landed; not resuming"
                );
                halted = Some(err.to_string());
            } else {
                warn!(
                    generation = pending.generation,
                    asset = %pending.asset.short(),
                    "pending execution marker left by a partial landing"
                );
            }
        }

        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CHANNEL);
        let feeds = FeedSettings::new(&config, services.ledger.clone(), services.price.clone());
        let monitor = PhaseMonitor::new(
            MonitorSettings::from_config(&config),
            feeds,
            services.push.clone(),
            monitor_tx,
        );

        let snapshot = Arc::new(SnapshotEngine::new(
            services.primary_holders.clone(),
            services.fallback_holders.clone(),
            services.store.clone(),
            config.snapshot.clone(),
        ));
        let executor = ExecutionSequencer::new(
            services.ledger.clone(),
            services.store.clone(),
            config.execution.clone(),
            config.metadata.clone(),
        );
        let dispenser = Dispenser::new(services.transfers.clone(), &config.distribution);

        let (ranking_tx, ranking_rx) = mpsc::channel(RANKING_CHANNEL);
        let broadcaster = RankingBroadcaster::new(snapshot.clone(), &config.broadcast, ranking_tx);

        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL);
        let (status, status_rx) = watch::channel(StatusReport {
            active_asset_id: state.active_asset_id.clone(),
            generation: state.generation,
            phase: state.phase,
            monitor_phase: MonitorPhase::Stopped,
            cycle_running: false,
            held: hold.as_ref() == Some(&state.active_asset_id),
            halted: halted.clone(),
            last_reading: None,
            last_updated_at: state.last_updated_at,
        });

        let orchestrator = Self {
            cycles,
            store: services.store,
            state,
            halted,
            hold,
            cycle_running: false,
            last_reading: None,
            monitor,
            monitor_rx,
            snapshot,
            executor,
            dispenser,
            transfers: services.transfers,
            broadcaster,
            ranking_rx,
            publisher: services.publisher,
            commands,
            status,
        };
        Ok((orchestrator, OrchestratorHandle::new(command_tx, status_rx)))
    }

    /// Resume from the persisted phase and process events until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CycleError> {
        match self.halted.clone() {
            Some(reason) => self.publish(EventPayload::Error {
                message: reason,
                asset_id: Some(self.state.active_asset_id.clone()),
                needs_operator: true,
            }),
            None => self.resume().await?,
        }
        self.refresh_status();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(event) = self.monitor_rx.recv() => self.handle_monitor_event(event).await,
                Some(update) = self.ranking_rx.recv() => self.handle_ranking(update),
            }
        }

        self.monitor.stop().await;
        self.broadcaster.stop().await;
        info!(generation = self.state.generation, "orchestrator stopped");
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), CycleError> {
        let asset = self.state.active_asset_id.clone();
        let phase = match self.state.phase {
            CyclePhase::Intensive => MonitorPhase::Intensive,
            CyclePhase::Executing => {
                warn!(
                    asset = %asset.short(),
                    "previous cycle stopped before submission, resuming at casual"
                );
                MonitorPhase::Casual
            }
            CyclePhase::Idle | CyclePhase::Casual => MonitorPhase::Casual,
        };
        self.cycles
            .set_phase(&mut self.state, phase.as_cycle_phase())
            .await?;
        info!(
            asset = %asset.short(),
            generation = self.state.generation,
            phase = %phase,
            held = self.is_held(),
            "resuming lifecycle"
        );
        self.monitor.start(asset.clone(), phase).await;
        self.broadcaster.start(asset).await;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger { expected, reply } => {
                let asset = self.state.active_asset_id.clone();
                let generation = self.state.generation;
                if let Err(e) = self.check_trigger(expected) {
                    warn!(asset = %asset.short(), generation, error = %e, "manual trigger refused");
                    let _ = reply.send(Err(e));
                    return;
                }
                let _ = reply.send(Ok(TriggerAck {
                    asset: asset.clone(),
                    generation,
                }));
                info!(asset = %asset.short(), generation, "manual cycle trigger");

                if self.halted.take().is_some() {
                    warn!("manual trigger overrides the interrupted-execution halt");
                    if let Err(e) = self.cycles.clear_pending_execution().await {
                        self.fail_cycle(e.into()).await;
                        return;
                    }
                }
                self.release_hold().await;
                self.start_cycle(None).await;
            }
        }
    }

    /// A trigger only re-attempts a failed or interrupted cycle, and only for
    /// the asset and generation the caller expected.
    fn check_trigger(&self, expected: Option<(AssetId, u64)>) -> Result<(), TriggerError> {
        if let Some((expected_asset, expected_generation)) = expected {
            if expected_asset != self.state.active_asset_id
                || expected_generation != self.state.generation
            {
                return Err(TriggerError::Stale {
                    expected_asset: expected_asset.to_string(),
                    expected_generation,
                    active_asset: self.state.active_asset_id.to_string(),
                    generation: self.state.generation,
                });
            }
        }
        if self.halted.is_none() && !self.is_held() {
            return Err(TriggerError::NothingToRetry {
                asset: self.state.active_asset_id.to_string(),
            });
        }
        Ok(())
    }

    async fn handle_monitor_event(&mut self, event: MonitorEvent) {
        if event.run_id != self.monitor.current_run() || event.asset != self.state.active_asset_id {
            debug!(run_id = event.run_id, asset = %event.asset.short(), "dropping event from a stopped monitor run");
            return;
        }

        match event.kind {
            MonitorEventKind::Progress(reading) => {
                let phase = self.monitor.status().phase;
                self.publish(EventPayload::progress(&reading, phase));
                self.last_reading = Some(reading);
                self.refresh_status();
            }
            MonitorEventKind::PhaseChanged { from, to } => {
                info!(asset = %event.asset.short(), from = %from, to = %to, "monitor phase changed");
                if to.is_watching() {
                    if let Err(e) = self.cycles.set_phase(&mut self.state, to.as_cycle_phase()).await {
                        warn!(error = %e, "failed to persist monitor phase");
                    }
                }
                self.refresh_status();
            }
            MonitorEventKind::ThresholdReached(reading) => {
                self.last_reading = Some(reading.clone());
                if self.is_held() {
                    warn!(
                        asset = %event.asset.short(),
                        "threshold reached after a failed cycle, waiting for a manual trigger"
                    );
                    self.monitor.stop().await;
                    self.refresh_status();
                    return;
                }
                self.start_cycle(Some(reading)).await;
            }
            MonitorEventKind::Error(message) => {
                warn!(asset = %event.asset.short(), error = %message, "monitor error");
                self.publish(EventPayload::Error {
                    message,
                    asset_id: Some(event.asset),
                    needs_operator: false,
                });
            }
        }
    }

    fn handle_ranking(&self, update: RankingUpdate) {
        if self.cycle_running || update.asset != self.state.active_asset_id {
            debug!(asset = %update.asset.short(), "dropping ranking for inactive asset");
            return;
        }
        self.publish(EventPayload::ParticipantRankingUpdate {
            asset_id: update.asset,
            participants: update.participants,
        });
    }

    async fn start_cycle(&mut self, reading: Option<ProgressReading>) {
        if let Some(reading) = reading {
            self.publish(EventPayload::ThresholdReached {
                asset_id: reading.asset_id.clone(),
                generation: self.state.generation,
                progress_fraction: reading.progress_fraction,
                valuation_estimate: reading.valuation_estimate,
            });
        }

        self.cycle_running = true;
        let result = self.run_cycle().await;
        self.cycle_running = false;
        if let Err(e) = result {
            self.fail_cycle(e).await;
        }
        self.refresh_status();
    }

    async fn run_cycle(&mut self) -> Result<(), CycleError> {
        let asset = self.state.active_asset_id.clone();
        let generation = self.state.generation;
        let started = std::time::Instant::now();
        info!(asset = %asset.short(), generation, "cycle started");

        self.monitor.stop().await;
        self.broadcaster.pause();
        self.cycles
            .set_phase(&mut self.state, CyclePhase::Executing)
            .await?;
        self.refresh_status();

        let participants = self.snapshot.capture_snapshot(&asset).await?;

        let ExecutionOutcome { result, error } = self
            .executor
            .execute(&asset, generation, &participants)
            .await;
        if let Some(e) = error {
            return Err(e.into());
        }
        let Some(successor) = result.new_asset_id.clone() else {
            return Err(SubmissionError::Rejected {
                attempts: result.attempts,
                message: "sequence landed without a successor id".to_string(),
            }
            .into());
        };

        if let Err(e) = self.cycles.advance(&mut self.state, successor.clone()).await {
            error!(error = %e, successor = %successor, "sequence landed but the cycle state was not updated");
            return Err(StateError::InterruptedExecution {
                generation,
                asset: asset.to_string(),
            }
            .into());
        }
        if let Err(e) = self.cycles.clear_pending_execution().await {
            warn!(error = %e, "failed to clear pending execution marker");
        }
        self.release_hold().await;
        self.last_reading = None;
        self.refresh_status();

        let batches = self.distribute(&successor, &participants).await;
        if let Err(e) = self.snapshot.clear_snapshot(&asset).await {
            warn!(asset = %asset.short(), error = %e, "failed to clear snapshot");
        }

        self.monitor.switch_token(successor.clone()).await;
        self.resume_rankings(&successor).await;

        let succeeded: Vec<&DistributionBatchResult> = batches.iter().filter(|b| b.success).collect();
        let distributed_amount: u64 = succeeded
            .iter()
            .map(|b| b.amount_each * b.recipient_count as u64)
            .sum();
        self.publish(EventPayload::CycleComplete {
            generation: self.state.generation,
            retired_asset_id: asset.clone(),
            new_asset_id: successor.clone(),
            transaction_ref: result.transaction_ref,
            participant_count: participants.len(),
            distributed_amount,
            batches_succeeded: succeeded.len(),
            batches_failed: batches.len() - succeeded.len(),
        });
        info!(
            retired = %asset.short(),
            successor = %successor.short(),
            generation = self.state.generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cycle complete"
        );
        Ok(())
    }

    /// Send the operator's whole successor balance to the participants.
    /// Never fails the cycle; problems are logged and published.
    async fn distribute(
        &self,
        successor: &AssetId,
        participants: &[ParticipantRecord],
    ) -> Vec<DistributionBatchResult> {
        let amount = match self.transfers.operator_balance(successor).await {
            Ok(amount) => amount,
            Err(e) => {
                warn!(successor = %successor.short(), error = %e, "failed to read operator balance");
                self.publish(EventPayload::Error {
                    message: format!("distribution skipped: {:#}", e),
                    asset_id: Some(successor.clone()),
                    needs_operator: true,
                });
                return Vec::new();
            }
        };

        let batches = match self.dispenser.distribute(successor, participants, amount).await {
            Ok(batches) => batches,
            Err(e) => {
                warn!(successor = %successor.short(), error = %e, "distribution skipped");
                self.publish(EventPayload::Error {
                    message: e.to_string(),
                    asset_id: Some(successor.clone()),
                    needs_operator: true,
                });
                return Vec::new();
            }
        };

        match serde_json::to_string(&batches) {
            Ok(json) => {
                if let Err(e) = self.store.set(&distribution_key(self.state.generation), &json).await {
                    warn!(error = %e, "failed to persist distribution results");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize distribution results"),
        }

        let failed: Vec<usize> = batches
            .iter()
            .filter(|b| !b.success)
            .map(|b| b.batch_index)
            .collect();
        if !failed.is_empty() {
            self.publish(EventPayload::Error {
                message: format!("distribution batches failed: {:?}", failed),
                asset_id: Some(successor.clone()),
                needs_operator: true,
            });
        }
        batches
    }

    /// Surface the failure and keep watching the still-active asset. The
    /// asset is held so the cycle is only re-attempted by a trigger.
    async fn fail_cycle(&mut self, err: CycleError) {
        let asset = self.state.active_asset_id.clone();
        error!(asset = %asset.short(), generation = self.state.generation, error = %err, "cycle failed");
        self.publish(EventPayload::Error {
            message: err.to_string(),
            asset_id: Some(asset.clone()),
            needs_operator: err.needs_operator(),
        });

        if matches!(err, CycleError::State(StateError::InterruptedExecution { .. })) {
            self.halted = Some(err.to_string());
            self.refresh_status();
            return;
        }

        if let Err(e) = self.cycles.set_hold(&asset).await {
            warn!(error = %e, "failed to persist cycle hold");
        }
        self.hold = Some(asset.clone());
        if let Err(e) = self.cycles.set_phase(&mut self.state, CyclePhase::Casual).await {
            error!(error = %e, "failed to reset phase after cycle failure");
        }
        info!(asset = %asset.short(), "recovering: monitoring the same asset from casual");
        self.monitor.start(asset.clone(), MonitorPhase::Casual).await;
        self.resume_rankings(&asset).await;
        self.refresh_status();
    }

    async fn resume_rankings(&mut self, asset: &AssetId) {
        if self.broadcaster.is_running() {
            self.broadcaster.switch_asset(asset.clone());
            self.broadcaster.resume();
        } else {
            self.broadcaster.start(asset.clone()).await;
        }
    }

    async fn release_hold(&mut self) {
        if self.hold.take().is_some() {
            if let Err(e) = self.cycles.clear_hold().await {
                warn!(error = %e, "failed to clear cycle hold");
            }
        }
    }

    fn is_held(&self) -> bool {
        self.hold.as_ref() == Some(&self.state.active_asset_id)
    }

    fn publish(&self, payload: EventPayload) {
        self.publisher.publish(&LifecycleEvent::now(payload));
    }

    fn refresh_status(&self) {
        self.status.send_replace(StatusReport {
            active_asset_id: self.state.active_asset_id.clone(),
            generation: self.state.generation,
            phase: self.state.phase,
            monitor_phase: self.monitor.status().phase,
            cycle_running: self.cycle_running,
            held: self.is_held(),
            halted: self.halted.clone(),
            last_reading: self.last_reading.clone(),
            last_updated_at: self.state.last_updated_at,
        });
    }
}

/// Operator recovery after an interrupted execution: drop the pending
/// marker and return to Casual. Refused when there is nothing to recover.
pub async fn recover(store: Arc<dyn KeyValueStore>) -> Result<RecoveryReport, CycleError> {
    let cycles = CycleStore::new(store);
    let mut state = cycles.load().await?.ok_or(StateError::MissingGenesis)?;
    let pending = cycles.pending_execution().await?;
    if state.phase != CyclePhase::Executing && pending.is_none() {
        return Err(CycleError::WrongPhase {
            phase: state.phase.to_string(),
        });
    }
    cycles.clear_pending_execution().await?;
    cycles.set_phase(&mut state, CyclePhase::Casual).await?;
    info!(
        asset = %state.active_asset_id.short(),
        generation = state.generation,
        cleared = pending.is_some(),
        "cycle state recovered"
    );
    Ok(RecoveryReport {
        state,
        cleared_marker: pending,
    })
}
