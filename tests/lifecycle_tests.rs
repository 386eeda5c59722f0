//! End-to-end lifecycle scenarios against in-memory collaborators.
//!
//! Time is paused, so the 30s casual poll and the 500ms batch delay cost
//! nothing.

use std::sync::Arc;
use std::time::Duration;

use evolver::config::EvolverConfig;
use evolver::errors::{CycleError, StateError, TriggerError};
use evolver::executor::{PENDING_EXECUTION_KEY, PendingExecution};
use evolver::feed::{PushHub, TradeUpdate};
use evolver::ledger::{HolderBalance, SubmissionOutcome};
use evolver::model::{AssetId, CyclePhase, CycleState, MonitorPhase};
use evolver::orchestrator::{CycleStore, Orchestrator, OrchestratorHandle, Services};
use evolver::price::FixedPrice;
use evolver::snapshot::holders_key;
use evolver::store::{KeyValueStore, MemoryStore};
use evolver::stream::{EventPayload, LifecycleEvent};
use evolver::testing::{MockLedger, RecordingPublisher, StaticHolders, curve_state, holder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(600);

struct Harness {
    ledger: Arc<MockLedger>,
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    push: PushHub,
    handle: OrchestratorHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), CycleError>>,
}

impl Harness {
    async fn wait_for(&self, kind: &str) -> LifecycleEvent {
        self.wait_for_nth(kind, 1).await
    }

    async fn wait_for_nth(&self, kind: &str, n: usize) -> LifecycleEvent {
        tokio::time::timeout(WAIT, self.publisher.wait_for_nth(kind, n))
            .await
            .unwrap_or_else(|_| panic!("no {} event; saw {:?}", kind, self.publisher.kinds()))
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn config() -> EvolverConfig {
    let mut config = EvolverConfig::default();
    config.genesis_asset = Some("Genesis".to_string());
    config
}

fn holders(n: usize) -> Vec<HolderBalance> {
    (0..n)
        .map(|i| holder(&format!("w{}", i), (n - i) as f64 * 10.0))
        .collect()
}

/// Genesis is graduated; any other asset sits low on its curve.
fn graduated_ledger() -> Arc<MockLedger> {
    let ledger = Arc::new(MockLedger::with_state(curve_state(31.0, false)));
    ledger.set_asset_state(&AssetId::new("Genesis"), curve_state(85.0, true));
    ledger.set_operator_balance(1_000);
    ledger
}

async fn start_with(
    ledger: Arc<MockLedger>,
    store: Arc<MemoryStore>,
    primary: StaticHolders,
) -> Harness {
    let publisher = Arc::new(RecordingPublisher::new());
    let push = PushHub::new();
    let services = Services {
        ledger: ledger.clone(),
        transfers: ledger.clone(),
        primary_holders: Arc::new(primary),
        fallback_holders: Arc::new(StaticHolders::failing("scan")),
        price: Arc::new(FixedPrice(185.0)),
        store: store.clone(),
        publisher: publisher.clone(),
        push: push.clone(),
    };
    let (orchestrator, handle) = match Orchestrator::new(config(), services).await {
        Ok(built) => built,
        Err(e) => panic!("orchestrator failed to start: {}", e),
    };
    let cancel = CancellationToken::new();
    let task = tokio::spawn(orchestrator.run(cancel.clone()));
    Harness {
        ledger,
        store,
        publisher,
        push,
        handle,
        cancel,
        task,
    }
}

async fn start(ledger: Arc<MockLedger>, holder_list: Vec<HolderBalance>) -> Harness {
    start_with(
        ledger,
        Arc::new(MemoryStore::new()),
        StaticHolders::new("das", holder_list),
    )
    .await
}

/// Let the event loop settle after an awaited event.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn graduation_runs_one_full_cycle() {
    let h = start(graduated_ledger(), holders(3)).await;

    let complete = h.wait_for("cycle_complete").await;
    match complete.payload {
        EventPayload::CycleComplete {
            generation,
            retired_asset_id,
            new_asset_id,
            participant_count,
            distributed_amount,
            batches_succeeded,
            batches_failed,
            transaction_ref,
        } => {
            assert_eq!(generation, 2);
            assert_eq!(retired_asset_id.as_str(), "Genesis");
            assert_eq!(new_asset_id.as_str(), "Successor1");
            assert_eq!(participant_count, 3);
            assert_eq!(distributed_amount, 999);
            assert_eq!((batches_succeeded, batches_failed), (1, 0));
            assert_eq!(transaction_ref.as_deref(), Some("bundle-1"));
        }
        other => panic!("Expected CycleComplete, got {:?}", other),
    }
    settle().await;

    let status = h.handle.status();
    assert_eq!(status.active_asset_id.as_str(), "Successor1");
    assert_eq!(status.generation, 2);
    assert_eq!(status.phase, CyclePhase::Casual);
    assert!(!status.cycle_running);

    let persisted = CycleStore::new(h.store.clone()).load().await.unwrap().unwrap();
    assert_eq!(persisted.active_asset_id.as_str(), "Successor1");
    assert_eq!(persisted.generation, 2);

    // Old snapshot purged, marker cleared, one atomic submission.
    assert_eq!(
        h.store.sorted_set_len(&holders_key(&"Genesis".into())).await.unwrap(),
        0
    );
    assert!(h.store.get(PENDING_EXECUTION_KEY).await.unwrap().is_none());
    assert_eq!(h.ledger.submitted().len(), 1);
    assert_eq!(h.publisher.count("threshold_reached"), 1);

    let kinds = h.publisher.kinds();
    let threshold = kinds.iter().position(|k| *k == "threshold_reached").unwrap();
    let done = kinds.iter().position(|k| *k == "cycle_complete").unwrap();
    assert!(threshold < done);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn successor_is_watched_after_the_cycle() {
    let h = start(graduated_ledger(), holders(2)).await;
    h.wait_for("cycle_complete").await;

    let event = h.wait_for_nth("progress_update", 2).await;
    match event.payload {
        EventPayload::ProgressUpdate { asset_id, .. } => assert_eq!(asset_id.as_str(), "Successor1"),
        other => panic!("Expected ProgressUpdate, got {:?}", other),
    }
    // A low successor never triggers a second cycle.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.publisher.count("cycle_complete"), 1);
    assert_eq!(h.handle.status().monitor_phase, MonitorPhase::Casual);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_queued_during_a_cycle_does_not_retire_the_successor() {
    let h = start(graduated_ledger(), holders(3)).await;
    h.wait_for("threshold_reached").await;

    // Both land in the command queue while Genesis is being retired.
    let handle = h.handle.clone();
    let guarded =
        tokio::spawn(async move { handle.trigger(Some((AssetId::new("Genesis"), 1))).await });
    let handle = h.handle.clone();
    let unguarded = tokio::spawn(async move { handle.trigger(None).await });

    h.wait_for("cycle_complete").await;
    match guarded.await.unwrap() {
        Err(TriggerError::Stale {
            active_asset,
            generation,
            ..
        }) => {
            assert_eq!(active_asset, "Successor1");
            assert_eq!(generation, 2);
        }
        other => panic!("Expected a stale trigger, got {:?}", other),
    }
    assert!(matches!(
        unguarded.await.unwrap(),
        Err(TriggerError::NothingToRetry { .. })
    ));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.ledger.submitted().len(), 1);
    assert_eq!(h.publisher.count("cycle_complete"), 1);
    let status = h.handle.status();
    assert_eq!(status.active_asset_id.as_str(), "Successor1");
    assert_eq!(status.generation, 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_on_a_healthy_asset_is_refused() {
    let ledger = Arc::new(MockLedger::with_state(curve_state(31.0, false)));
    let h = start(ledger, holders(3)).await;
    h.wait_for("progress_update").await;

    match h.handle.trigger(None).await {
        Err(TriggerError::NothingToRetry { asset }) => assert_eq!(asset, "Genesis"),
        other => panic!("Expected NothingToRetry, got {:?}", other),
    }
    settle().await;
    assert!(h.ledger.submitted().is_empty());
    assert_eq!(h.publisher.count("threshold_reached"), 0);
    assert_eq!(h.handle.status().generation, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_execution_holds_asset_until_trigger() {
    let ledger = graduated_ledger();
    for _ in 0..2 {
        ledger.queue_outcome(SubmissionOutcome::Rejected {
            error: "blockhash expired".into(),
        });
    }
    let h = start(ledger, holders(3)).await;

    match h.wait_for("error").await.payload {
        EventPayload::Error { needs_operator, message, .. } => {
            assert!(!needs_operator);
            assert!(message.contains("2 attempt"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }
    settle().await;

    let status = h.handle.status();
    assert_eq!(status.active_asset_id.as_str(), "Genesis");
    assert_eq!(status.generation, 1);
    assert_eq!(status.phase, CyclePhase::Casual);
    assert!(status.held);
    assert_eq!(h.ledger.submitted().len(), 2);

    // Still graduated, but no automatic re-attempt.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.ledger.submitted().len(), 2);
    assert_eq!(h.publisher.count("threshold_reached"), 1);

    let ack = h
        .handle
        .trigger(Some((AssetId::new("Genesis"), 1)))
        .await
        .unwrap();
    assert_eq!(ack.asset.as_str(), "Genesis");
    assert_eq!(ack.generation, 1);

    match h.wait_for("cycle_complete").await.payload {
        EventPayload::CycleComplete { new_asset_id, generation, .. } => {
            assert_eq!(new_asset_id.as_str(), "Successor2");
            assert_eq!(generation, 2);
        }
        other => panic!("Expected CycleComplete, got {:?}", other),
    }
    settle().await;
    assert!(!h.handle.status().held);
    assert_eq!(h.ledger.submitted().len(), 3);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn partial_landing_needs_operator_and_keeps_marker() {
    let ledger = graduated_ledger();
    ledger.queue_outcome(SubmissionOutcome::PartialLanding {
        landed: 1,
        reference: Some("sig-claim".into()),
        error: "seed dropped".into(),
    });
    let h = start(ledger, holders(3)).await;

    match h.wait_for("error").await.payload {
        EventPayload::Error { needs_operator, .. } => assert!(needs_operator),
        other => panic!("Expected Error, got {:?}", other),
    }
    settle().await;

    assert_eq!(h.ledger.submitted().len(), 1);
    assert_eq!(h.handle.status().active_asset_id.as_str(), "Genesis");
    assert!(h.handle.status().held);
    assert!(h.store.get(PENDING_EXECUTION_KEY).await.unwrap().is_some());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_failure_leaves_state_untouched() {
    let h = start_with(
        graduated_ledger(),
        Arc::new(MemoryStore::new()),
        StaticHolders::failing("das"),
    )
    .await;

    match h.wait_for("error").await.payload {
        EventPayload::Error { message, .. } => assert!(message.contains("Snapshot failed")),
        other => panic!("Expected Error, got {:?}", other),
    }
    settle().await;

    assert!(h.ledger.submitted().is_empty());
    let status = h.handle.status();
    assert_eq!(status.active_asset_id.as_str(), "Genesis");
    assert_eq!(status.generation, 1);
    assert!(status.held);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_batch_does_not_fail_the_cycle() {
    let ledger = graduated_ledger();
    ledger.set_operator_balance(1_700);
    ledger.failing_transfer_calls.lock().unwrap().insert(1);
    let h = start(ledger, holders(17)).await;

    match h.wait_for("cycle_complete").await.payload {
        EventPayload::CycleComplete {
            batches_succeeded,
            batches_failed,
            distributed_amount,
            ..
        } => {
            assert_eq!((batches_succeeded, batches_failed), (2, 1));
            assert_eq!(distributed_amount, 100 * 9);
        }
        other => panic!("Expected CycleComplete, got {:?}", other),
    }
    let sizes: Vec<usize> = h.ledger.transfers().iter().map(|t| t.len()).collect();
    assert_eq!(sizes, vec![8, 8, 1]);

    match h.wait_for("error").await.payload {
        EventPayload::Error { needs_operator, message, .. } => {
            assert!(needs_operator);
            assert!(message.contains("[1]"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }
    assert_eq!(h.handle.status().generation, 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pushed_trade_triggers_graduation() {
    let ledger = Arc::new(MockLedger::with_state(curve_state(40.0, false)));
    ledger.set_operator_balance(100);
    let h = start(ledger, holders(2)).await;
    h.push.set_connected(true);
    settle().await;
    assert_eq!(h.publisher.count("threshold_reached"), 0);

    h.push.publish_trade(TradeUpdate {
        asset_id: "Genesis".into(),
        quote_reserve: 84_900_000_000.0,
        market_cap_quote: 420.0,
        complete: false,
    });

    match h.wait_for("threshold_reached").await.payload {
        EventPayload::ThresholdReached { asset_id, progress_fraction, .. } => {
            assert_eq!(asset_id.as_str(), "Genesis");
            assert!(progress_fraction >= 0.995);
        }
        other => panic!("Expected ThresholdReached, got {:?}", other),
    }
    h.wait_for("cycle_complete").await;
    assert_eq!(h.publisher.count("threshold_reached"), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_persisted_phase_and_generation() {
    let store = Arc::new(MemoryStore::new());
    CycleStore::new(store.clone())
        .save(&CycleState {
            active_asset_id: "Gen5".into(),
            generation: 5,
            phase: CyclePhase::Intensive,
            last_updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let ledger = Arc::new(MockLedger::with_state(curve_state(40.0, false)));
    let h = start_with(ledger, store, StaticHolders::new("das", holders(2))).await;
    settle().await;

    let status = h.handle.status();
    assert_eq!(status.active_asset_id.as_str(), "Gen5");
    assert_eq!(status.generation, 5);
    assert_eq!(status.phase, CyclePhase::Intensive);
    assert_eq!(status.monitor_phase, MonitorPhase::Intensive);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn interrupted_execution_halts_until_trigger() {
    let store = Arc::new(MemoryStore::new());
    CycleStore::new(store.clone())
        .save(&CycleState {
            active_asset_id: "Genesis".into(),
            generation: 1,
            phase: CyclePhase::Executing,
            last_updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let marker = PendingExecution {
        generation: 1,
        asset: "Genesis".into(),
        successor: "Lost".into(),
        started_at: chrono::Utc::now(),
    };
    store
        .set(PENDING_EXECUTION_KEY, &serde_json::to_string(&marker).unwrap())
        .await
        .unwrap();

    let h = start_with(
        graduated_ledger(),
        store,
        StaticHolders::new("das", holders(2)),
    )
    .await;

    match h.wait_for("error").await.payload {
        EventPayload::Error { needs_operator, message, .. } => {
            assert!(needs_operator);
            assert!(message.contains("interrupted"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.handle.status().halted.is_some());
    assert_eq!(h.publisher.count("progress_update"), 0);
    assert!(h.ledger.submitted().is_empty());

    h.handle.trigger(None).await.unwrap();
    h.wait_for("cycle_complete").await;
    settle().await;

    let status = h.handle.status();
    assert!(status.halted.is_none());
    assert_eq!(status.generation, 2);
    assert!(h.store.get(PENDING_EXECUTION_KEY).await.unwrap().is_none());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_marker_from_an_earlier_generation_is_cleared() {
    let store = Arc::new(MemoryStore::new());
    CycleStore::new(store.clone())
        .save(&CycleState {
            active_asset_id: "Gen3".into(),
            generation: 3,
            phase: CyclePhase::Casual,
            last_updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let marker = PendingExecution {
        generation: 2,
        asset: "Gen2".into(),
        successor: "Gen3".into(),
        started_at: chrono::Utc::now(),
    };
    store
        .set(PENDING_EXECUTION_KEY, &serde_json::to_string(&marker).unwrap())
        .await
        .unwrap();

    let ledger = Arc::new(MockLedger::with_state(curve_state(40.0, false)));
    let h = start_with(ledger, store, StaticHolders::new("das", holders(2))).await;
    settle().await;

    assert!(h.handle.status().halted.is_none());
    assert!(h.store.get(PENDING_EXECUTION_KEY).await.unwrap().is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn corrupt_state_refuses_to_start() {
    let store = Arc::new(MemoryStore::new());
    store.set("active_asset", "Genesis").await.unwrap();
    store.set("generation", "two").await.unwrap();
    store.set("phase", "casual").await.unwrap();

    let ledger = Arc::new(MockLedger::new());
    let services = Services {
        ledger: ledger.clone(),
        transfers: ledger,
        primary_holders: Arc::new(StaticHolders::new("das", vec![])),
        fallback_holders: Arc::new(StaticHolders::failing("scan")),
        price: Arc::new(FixedPrice(185.0)),
        store: store.clone(),
        publisher: Arc::new(RecordingPublisher::new()),
        push: PushHub::new(),
    };
    match Orchestrator::new(config(), services).await {
        Err(CycleError::State(StateError::Corrupt { key, .. })) => assert_eq!(key, "generation"),
        Err(e) => panic!("Expected Corrupt, got {}", e),
        Ok(_) => panic!("Expected Corrupt, got a running orchestrator"),
    }
    // Nothing was reinitialised.
    assert_eq!(store.get("generation").await.unwrap().as_deref(), Some("two"));
}

#[tokio::test(start_paused = true)]
async fn rankings_are_broadcast_for_the_active_asset() {
    let ledger = Arc::new(MockLedger::with_state(curve_state(40.0, false)));
    let h = start(ledger, holders(5)).await;

    match h.wait_for("participant_ranking_update").await.payload {
        EventPayload::ParticipantRankingUpdate { asset_id, participants } => {
            assert_eq!(asset_id.as_str(), "Genesis");
            assert_eq!(participants.len(), 5);
            assert_eq!(participants[0].identity, "w0");
            assert_eq!(participants[0].rank, 1);
        }
        other => panic!("Expected ranking update, got {:?}", other),
    }
    h.wait_for_nth("participant_ranking_update", 2).await;
    h.shutdown().await;
}
