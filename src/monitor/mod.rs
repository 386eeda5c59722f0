//! Phase Monitor.
//!
//! One tokio task per watched asset. The task merges pushed trades, the
//! phase-rate poll and the fallback poll into [`MonitorMachine`] and reports
//! through an mpsc channel to the orchestrator. Stopping cancels the task
//! and waits for it, so nothing about the old asset is sent afterwards.

mod machine;

pub use machine::{MonitorMachine, PollRates, Step, Thresholds};

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EvolverConfig;
use crate::feed::{FallbackGate, FeedSettings, ProgressFeed, PushHub, PushSignal};
use crate::model::{AssetId, MonitorPhase, ProgressReading};

/// A message from a monitor run. `run_id` lets the receiver drop anything
/// queued by a run that has since been stopped.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub run_id: u64,
    pub asset: AssetId,
    pub kind: MonitorEventKind,
}

#[derive(Debug, Clone)]
pub enum MonitorEventKind {
    Progress(ProgressReading),
    PhaseChanged {
        from: MonitorPhase,
        to: MonitorPhase,
    },
    /// Sent once per run.
    ThresholdReached(ProgressReading),
    /// Feed failure. The phase is unchanged.
    Error(String),
}

/// Point-in-time view of the monitor, readable without side effects.
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    pub run_id: u64,
    pub asset: Option<AssetId>,
    pub phase: MonitorPhase,
    pub latched: bool,
    pub last_reading: Option<ProgressReading>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub thresholds: Thresholds,
    pub rates: PollRates,
    pub fallback_interval: Duration,
    pub push_debounce: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &EvolverConfig) -> Self {
        Self {
            thresholds: Thresholds {
                valuation: config.monitoring.valuation_threshold,
                graduation: config.monitoring.graduation_threshold,
            },
            rates: PollRates {
                casual: config.casual_poll_interval(),
                intensive: config.intensive_poll_interval(),
            },
            fallback_interval: config.fallback_poll_interval(),
            push_debounce: config.push_debounce(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PhaseMonitor {
    settings: MonitorSettings,
    feeds: FeedSettings,
    hub: PushHub,
    events: mpsc::Sender<MonitorEvent>,
    status_tx: watch::Sender<MonitorStatus>,
    status_rx: watch::Receiver<MonitorStatus>,
    next_run: u64,
    running: Option<Running>,
}

impl PhaseMonitor {
    pub fn new(
        settings: MonitorSettings,
        feeds: FeedSettings,
        hub: PushHub,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(MonitorStatus::default());
        Self {
            settings,
            feeds,
            hub,
            events,
            status_tx,
            status_rx,
            next_run: 0,
            running: None,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for callers that want status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    pub fn current_run(&self) -> u64 {
        self.status_rx.borrow().run_id
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Start watching `asset`, replacing any current run. `phase` lets a
    /// restart resume at Intensive; non-watching phases start Casual.
    pub async fn start(&mut self, asset: AssetId, phase: MonitorPhase) {
        self.stop().await;

        self.next_run += 1;
        let run_id = self.next_run;
        let mut machine = MonitorMachine::new(self.settings.thresholds, self.settings.rates);
        let period = machine.reset(phase);

        self.status_tx.send_replace(MonitorStatus {
            run_id,
            asset: Some(asset.clone()),
            phase: machine.phase(),
            latched: false,
            last_reading: None,
        });
        info!(asset = %asset.short(), run_id, phase = %machine.phase(), "monitor started");

        let cancel = CancellationToken::new();
        let task = MonitorTask {
            run_id,
            feed: self.feeds.for_asset(asset),
            machine,
            gate: FallbackGate::new(self.hub.is_connected(), self.settings.push_debounce),
            push: self.hub.subscribe(),
            events: self.events.clone(),
            status: self.status_tx.clone(),
            cancel: cancel.clone(),
        };
        let fallback = self.settings.fallback_interval;
        let handle = tokio::spawn(task.run(period, fallback));
        self.running = Some(Running { cancel, handle });
    }

    /// Cancel the current run and wait until its task has exited.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "monitor task ended abnormally");
        }
        self.status_tx.send_modify(|s| s.phase = MonitorPhase::Stopped);
        debug!(run_id = self.current_run(), "monitor stopped");
    }

    /// Watch a new asset from Casual with the latch cleared.
    pub async fn switch_token(&mut self, asset: AssetId) {
        info!(asset = %asset.short(), "monitor switching asset");
        self.start(asset, MonitorPhase::Casual).await;
    }
}

enum Flow {
    Continue,
    Done,
}

struct MonitorTask {
    run_id: u64,
    feed: ProgressFeed,
    machine: MonitorMachine,
    gate: FallbackGate,
    push: broadcast::Receiver<PushSignal>,
    events: mpsc::Sender<MonitorEvent>,
    status: watch::Sender<MonitorStatus>,
    cancel: CancellationToken,
}

fn ticker(period: Duration, immediate: bool) -> Interval {
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl MonitorTask {
    async fn run(mut self, period: Option<Duration>, fallback: Duration) {
        let Some(period) = period else {
            return;
        };
        let mut phase_tick = ticker(period, true);
        let mut fallback_tick = ticker(fallback, false);
        let mut push_open = true;

        loop {
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Flow::Done,
                signal = self.push.recv(), if push_open => match signal {
                    Ok(PushSignal::Trade(update)) => {
                        match self.feed.from_push(&update).await {
                            Some(reading) => {
                                self.gate.record_push(Instant::now());
                                self.handle_reading(reading, &mut phase_tick).await
                            }
                            None => Flow::Continue,
                        }
                    }
                    Ok(PushSignal::Connected) => {
                        self.gate.set_connected(true);
                        Flow::Continue
                    }
                    Ok(PushSignal::Disconnected) => {
                        self.gate.set_connected(false);
                        fallback_tick = ticker(fallback, false);
                        Flow::Continue
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(run_id = self.run_id, skipped, "monitor lagged behind push updates");
                        Flow::Continue
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        push_open = false;
                        self.gate.set_connected(false);
                        Flow::Continue
                    }
                },
                _ = phase_tick.tick() => self.poll(&mut phase_tick).await,
                _ = fallback_tick.tick(), if self.gate.is_active() => {
                    if self.gate.should_poll(Instant::now()) {
                        self.poll(&mut phase_tick).await
                    } else {
                        Flow::Continue
                    }
                }
            };
            if let Flow::Done = flow {
                break;
            }
        }
        debug!(run_id = self.run_id, "monitor task exiting");
    }

    async fn poll(&mut self, phase_tick: &mut Interval) -> Flow {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Flow::Done,
            r = self.feed.poll() => r,
        };
        match result {
            Ok(Some(reading)) => self.handle_reading(reading, phase_tick).await,
            Ok(None) => Flow::Continue,
            Err(e) => self.emit(MonitorEventKind::Error(e.to_string())).await,
        }
    }

    async fn handle_reading(&mut self, reading: ProgressReading, phase_tick: &mut Interval) -> Flow {
        let before = self.machine.phase();
        let step = self.machine.observe(&reading);
        self.status.send_modify(|s| {
            s.last_reading = Some(reading.clone());
            s.phase = self.machine.phase();
            s.latched = self.machine.is_latched();
        });

        if let Flow::Done = self.emit(MonitorEventKind::Progress(reading.clone())).await {
            return Flow::Done;
        }

        let mut from = before;
        for to in &step.entered {
            info!(asset = %self.feed.asset().short(), %from, to = %to, "monitor phase changed");
            let change = MonitorEventKind::PhaseChanged { from, to: *to };
            if let Flow::Done = self.emit(change).await {
                return Flow::Done;
            }
            from = *to;
        }
        if let Some(period) = step.poll_interval {
            *phase_tick = ticker(period, false);
        }

        if step.threshold_reached {
            info!(
                asset = %self.feed.asset().short(),
                progress = reading.progress_fraction,
                complete = reading.complete,
                "graduation threshold reached"
            );
            self.emit(MonitorEventKind::ThresholdReached(reading)).await;
            // Latched: nothing more to watch on this run.
            return Flow::Done;
        }
        Flow::Continue
    }

    /// Send unless cancelled first. A closed receiver also ends the run.
    async fn emit(&self, kind: MonitorEventKind) -> Flow {
        let event = MonitorEvent {
            run_id: self.run_id,
            asset: self.feed.asset().clone(),
            kind,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::Done,
            sent = self.events.send(event) => match sent {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Done,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{CurveParams, TradeUpdate};
    use crate::model::AssetState;
    use crate::price::FixedPrice;
    use crate::testing::{MockLedger, curve_state};
    use std::sync::Arc;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            thresholds: Thresholds {
                valuation: 60_400.0,
                graduation: 0.995,
            },
            rates: PollRates {
                casual: Duration::from_secs(30),
                intensive: Duration::from_millis(200),
            },
            fallback_interval: Duration::from_secs(5),
            push_debounce: Duration::from_secs(10),
        }
    }

    fn feeds(states: Vec<anyhow::Result<Option<AssetState>>>) -> FeedSettings {
        let ledger = MockLedger::new();
        ledger.queued_states.lock().unwrap().extend(states);
        FeedSettings {
            ledger: Arc::new(ledger),
            price: Arc::new(FixedPrice(100.0)),
            curve: CurveParams::default(),
            max_poll_failures: 3,
        }
    }

    fn trade(asset: &str, reserve: f64, market_cap_quote: f64) -> TradeUpdate {
        TradeUpdate {
            asset_id: asset.into(),
            quote_reserve: reserve,
            market_cap_quote,
            complete: false,
        }
    }

    async fn next_threshold(rx: &mut mpsc::Receiver<MonitorEvent>) -> MonitorEvent {
        loop {
            let ev = rx.recv().await.expect("channel open");
            if let MonitorEventKind::ThresholdReached(_) = ev.kind {
                return ev;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_readings_drive_graduation_once() {
        let hub = PushHub::new();
        hub.set_connected(true);
        let (tx, mut rx) = mpsc::channel(64);
        let mut monitor = PhaseMonitor::new(settings(), feeds(vec![]), hub.clone(), tx);
        monitor.start("A".into(), MonitorPhase::Casual).await;
        tokio::task::yield_now().await;

        hub.publish_trade(trade("A", 52.0, 700.0));
        hub.publish_trade(trade("A", 84.9, 800.0));
        hub.publish_trade(trade("A", 85.0, 800.0));

        let ev = next_threshold(&mut rx).await;
        assert_eq!(ev.asset.as_str(), "A");
        // Nothing else fires once latched.
        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev.kind, MonitorEventKind::ThresholdReached(_)));
        }
        assert_eq!(monitor.status().phase, MonitorPhase::Executing);
        assert!(monitor.status().latched);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_surface_without_phase_change() {
        let hub = PushHub::new();
        hub.set_connected(true);
        let (tx, mut rx) = mpsc::channel(64);
        let states = (0..3).map(|_| Err(anyhow::anyhow!("rpc down"))).collect();
        let mut monitor = PhaseMonitor::new(settings(), feeds(states), hub, tx);
        monitor.start("A".into(), MonitorPhase::Casual).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.kind, MonitorEventKind::Error(_)));
        assert_eq!(monitor.status().phase, MonitorPhase::Casual);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn switch_token_resets_and_silences_old_asset() {
        let hub = PushHub::new();
        hub.set_connected(true);
        let (tx, mut rx) = mpsc::channel(64);
        let mut monitor = PhaseMonitor::new(settings(), feeds(vec![]), hub.clone(), tx);
        monitor.start("A".into(), MonitorPhase::Intensive).await;
        tokio::task::yield_now().await;
        let old_run = monitor.current_run();

        monitor.switch_token("B".into()).await;
        let status = monitor.status();
        assert_eq!(status.phase, MonitorPhase::Casual);
        assert!(!status.latched);
        assert_eq!(status.asset.as_ref().map(AssetId::as_str), Some("B"));
        assert_ne!(status.run_id, old_run);
        tokio::task::yield_now().await;

        hub.publish_trade(trade("A", 85.0, 1_000.0));
        hub.publish_trade(trade("B", 85.0, 1_000.0));
        let ev = next_threshold(&mut rx).await;
        assert_eq!(ev.asset.as_str(), "B");
        assert_eq!(ev.run_id, monitor.current_run());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_polls_while_push_is_down() {
        let hub = PushHub::new();
        let (tx, mut rx) = mpsc::channel(64);
        let graduated = curve_state(85.0, true);
        // First (immediate) phase poll finds nothing; the fallback poll five
        // seconds later sees the completed curve, long before the casual tick.
        let states = vec![Ok(None), Ok(Some(graduated))];
        let mut monitor = PhaseMonitor::new(settings(), feeds(states), hub, tx);
        monitor.start("A".into(), MonitorPhase::Casual).await;

        let started = Instant::now();
        next_threshold(&mut rx).await;
        assert!(Instant::now().duration_since(started) < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_synchronous() {
        let hub = PushHub::new();
        hub.set_connected(true);
        let (tx, mut rx) = mpsc::channel(64);
        let mut monitor = PhaseMonitor::new(settings(), feeds(vec![]), hub.clone(), tx);
        monitor.start("A".into(), MonitorPhase::Casual).await;
        tokio::task::yield_now().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
        assert_eq!(monitor.status().phase, MonitorPhase::Stopped);

        hub.publish_trade(trade("A", 85.0, 1_000.0));
        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev.kind, MonitorEventKind::ThresholdReached(_)));
        }
    }
}
