//! Periodic participant-ranking broadcaster.
//!
//! Fetches the current top holders of the active asset on a fixed interval
//! and hands them to the orchestrator, which publishes them. Paused while a
//! cycle runs so no ranking for a retiring asset goes out mid-cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BroadcastConfig;
use crate::model::{AssetId, ParticipantRecord};
use crate::snapshot::SnapshotEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct RankingUpdate {
    pub asset: AssetId,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Control {
    asset: Option<AssetId>,
    paused: bool,
}

pub struct RankingBroadcaster {
    snapshot: Arc<SnapshotEngine>,
    size: usize,
    interval: Duration,
    updates: mpsc::Sender<RankingUpdate>,
    control: watch::Sender<Control>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RankingBroadcaster {
    pub fn new(
        snapshot: Arc<SnapshotEngine>,
        config: &BroadcastConfig,
        updates: mpsc::Sender<RankingUpdate>,
    ) -> Self {
        let (control, _) = watch::channel(Control::default());
        Self {
            snapshot,
            size: config.size,
            interval: Duration::from_millis(config.interval_ms),
            updates,
            control,
            task: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn asset(&self) -> Option<AssetId> {
        self.control.borrow().asset.clone()
    }

    /// Start broadcasting for `asset`; the first ranking goes out at once.
    pub async fn start(&mut self, asset: AssetId) {
        if self.task.is_some() && self.asset().as_ref() == Some(&asset) {
            return;
        }
        self.stop().await;
        info!(asset = %asset.short(), "ranking broadcaster started");
        self.control.send_replace(Control {
            asset: Some(asset),
            paused: false,
        });

        let cancel = CancellationToken::new();
        let worker = Worker {
            snapshot: self.snapshot.clone(),
            size: self.size,
            updates: self.updates.clone(),
            control: self.control.subscribe(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(self.interval));
        self.task = Some((cancel, handle));
    }

    pub fn pause(&self) {
        debug!("ranking broadcaster paused");
        self.control.send_modify(|c| c.paused = true);
    }

    pub fn resume(&self) {
        debug!("ranking broadcaster resumed");
        self.control.send_modify(|c| c.paused = false);
    }

    /// Follow a new asset. Pause state is left as is.
    pub fn switch_asset(&self, asset: AssetId) {
        info!(asset = %asset.short(), "ranking broadcaster switched asset");
        self.control.send_modify(|c| c.asset = Some(asset));
    }

    pub async fn stop(&mut self) {
        if let Some((cancel, handle)) = self.task.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "ranking broadcaster ended abnormally");
            }
        }
    }
}

struct Worker {
    snapshot: Arc<SnapshotEngine>,
    size: usize,
    updates: mpsc::Sender<RankingUpdate>,
    control: watch::Receiver<Control>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.broadcast_once().await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false when the receiving side is gone.
    async fn broadcast_once(&mut self) -> bool {
        let Control { asset, paused } = self.control.borrow_and_update().clone();
        let Some(asset) = asset else {
            return true;
        };
        if paused {
            return true;
        }

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return true,
            r = self.snapshot.preview(&asset, self.size) => r,
        };
        let participants = match fetched {
            Ok(p) => p,
            Err(e) => {
                warn!(asset = %asset.short(), error = %e, "ranking fetch failed");
                return true;
            }
        };

        // Paused or switched while fetching: drop it.
        let now = self.control.borrow().clone();
        if now.paused || now.asset.as_ref() != Some(&asset) {
            return true;
        }
        self.updates
            .send(RankingUpdate {
                asset,
                participants,
            })
            .await
            .is_ok()
    }
}
