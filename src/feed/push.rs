//! In-process fan-out of pushed trade updates.
//!
//! The HTTP ingest routes publish here; every running monitor holds a
//! receiver. Connection state is tracked so a monitor started later knows
//! whether it has to fall back to polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::model::AssetId;

const CHANNEL_CAPACITY: usize = 256;

/// A trade observed by the upstream stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    #[serde(rename = "mint")]
    pub asset_id: AssetId,
    /// Virtual quote reserve, whole or raw units.
    #[serde(rename = "vSolInBondingCurve")]
    pub quote_reserve: f64,
    /// Valuation in quote units.
    #[serde(rename = "marketCapSol", default)]
    pub market_cap_quote: f64,
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    Trade(TradeUpdate),
    Connected,
    Disconnected,
}

#[derive(Clone)]
pub struct PushHub {
    tx: broadcast::Sender<PushSignal>,
    connected: Arc<AtomicBool>,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PushHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushSignal> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn publish_trade(&self, update: TradeUpdate) {
        // No receivers just means no monitor is running.
        let _ = self.tx.send(PushSignal::Trade(update));
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return;
        }
        info!(connected, "push channel state changed");
        let signal = if connected {
            PushSignal::Connected
        } else {
            PushSignal::Disconnected
        };
        let _ = self.tx.send(signal);
    }
}
