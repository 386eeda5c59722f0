//! Progress Feed Adapter.
//!
//! Turns pushed trades and polled curve accounts into [`ProgressReading`]s
//! for one asset. Poll failures are absorbed until `max_poll_failures` in a
//! row, then surfaced as [`FeedError::RetriesExhausted`].

pub mod curve;
mod push;

pub use curve::CurveParams;
pub use push::{PushHub, PushSignal, TradeUpdate};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EvolverConfig;
use crate::errors::FeedError;
use crate::ledger::LedgerProgram;
use crate::model::{AssetId, ProgressReading, ReadingSource};
use crate::price::PriceFeed;

/// Shared collaborators and tuning for building per-asset feeds.
#[derive(Clone)]
pub struct FeedSettings {
    pub ledger: Arc<dyn LedgerProgram>,
    pub price: Arc<dyn PriceFeed>,
    pub curve: CurveParams,
    pub max_poll_failures: u32,
}

impl FeedSettings {
    pub fn new(
        config: &EvolverConfig,
        ledger: Arc<dyn LedgerProgram>,
        price: Arc<dyn PriceFeed>,
    ) -> Self {
        Self {
            ledger,
            price,
            curve: CurveParams {
                initial_reserve: config.feed.initial_reserve,
                target_reserve: config.feed.target_reserve,
            },
            max_poll_failures: config.feed.max_poll_failures,
        }
    }

    pub fn for_asset(&self, asset: AssetId) -> ProgressFeed {
        ProgressFeed {
            asset,
            settings: self.clone(),
            failures: 0,
        }
    }
}

/// Readings for a single asset.
pub struct ProgressFeed {
    asset: AssetId,
    settings: FeedSettings,
    failures: u32,
}

impl ProgressFeed {
    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    /// Read the curve account directly.
    ///
    /// `Ok(None)` means no reading this time. The failure counter resets on
    /// success and after it has been reported.
    pub async fn poll(&mut self) -> Result<Option<ProgressReading>, FeedError> {
        let problem = match self.settings.ledger.fetch_asset_state(&self.asset).await {
            Ok(Some(state)) => {
                self.failures = 0;
                let quote_usd = self.settings.price.quote_usd().await;
                return Ok(Some(ProgressReading {
                    asset_id: self.asset.clone(),
                    progress_fraction: self.settings.curve.progress(state.virtual_quote),
                    valuation_estimate: curve::valuation(&state, quote_usd),
                    complete: state.complete,
                    observed_at: Utc::now(),
                    source: ReadingSource::Poll,
                }));
            }
            Ok(None) => "curve account not found".to_string(),
            Err(e) => format!("{:#}", e),
        };

        self.failures += 1;
        let err = FeedError::Transient {
            asset: self.asset.to_string(),
            message: problem,
        };
        warn!(asset = %self.asset.short(), failures = self.failures, error = %err, "poll failed");

        if self.failures >= self.settings.max_poll_failures {
            let failures = self.failures;
            self.failures = 0;
            return Err(FeedError::RetriesExhausted {
                asset: self.asset.to_string(),
                failures,
            });
        }
        Ok(None)
    }

    /// Reading from a pushed trade; `None` if the trade is for another asset.
    pub async fn from_push(&self, update: &TradeUpdate) -> Option<ProgressReading> {
        if update.asset_id != self.asset {
            return None;
        }
        let quote_usd = self.settings.price.quote_usd().await;
        let reserve = curve::normalize_reserve(update.quote_reserve);
        let valuation = update.market_cap_quote * quote_usd;
        debug!(asset = %self.asset.short(), reserve, valuation, "push reading");
        Some(ProgressReading {
            asset_id: self.asset.clone(),
            progress_fraction: self.settings.curve.progress(reserve),
            valuation_estimate: if valuation.is_finite() { valuation } else { 0.0 },
            complete: update.complete,
            observed_at: Utc::now(),
            source: ReadingSource::Push,
        })
    }
}

/// Decides whether a fallback poll is due.
///
/// Fallback polling runs only while the push channel is down, and is
/// skipped within `debounce` of the last pushed trade.
#[derive(Debug, Clone)]
pub struct FallbackGate {
    push_connected: bool,
    last_push: Option<Instant>,
    debounce: Duration,
}

impl FallbackGate {
    pub fn new(push_connected: bool, debounce: Duration) -> Self {
        Self {
            push_connected,
            last_push: None,
            debounce,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.push_connected = connected;
    }

    pub fn is_active(&self) -> bool {
        !self.push_connected
    }

    pub fn record_push(&mut self, at: Instant) {
        self.last_push = Some(at);
    }

    pub fn should_poll(&self, now: Instant) -> bool {
        if self.push_connected {
            return false;
        }
        match self.last_push {
            Some(last) => now.duration_since(last) >= self.debounce,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssetState;
    use crate::price::FixedPrice;
    use crate::testing::{MockLedger, curve_state};

    fn curve(virtual_quote: f64) -> AssetState {
        curve_state(virtual_quote, false)
    }

    fn settings(states: Vec<anyhow::Result<Option<AssetState>>>, max: u32) -> FeedSettings {
        let ledger = MockLedger::new();
        ledger.queued_states.lock().unwrap().extend(states);
        FeedSettings {
            ledger: Arc::new(ledger),
            price: Arc::new(FixedPrice(100.0)),
            curve: CurveParams::default(),
            max_poll_failures: max,
        }
    }

    #[tokio::test]
    async fn poll_builds_reading_from_state() {
        let mut feed = settings(vec![Ok(Some(curve(57.5)))], 3).for_asset("A".into());
        let reading = feed.poll().await.unwrap().unwrap();
        assert!((reading.progress_fraction - 0.5).abs() < 1e-12);
        // 57.5 / 1e9 * 1e9 * 100
        assert!((reading.valuation_estimate - 5750.0).abs() < 1e-6);
        assert_eq!(reading.source, ReadingSource::Poll);
    }

    #[tokio::test]
    async fn poll_failures_are_absorbed_until_limit() {
        let mut feed = settings(
            vec![
                Err(anyhow::anyhow!("timeout")),
                Ok(None),
                Err(anyhow::anyhow!("timeout")),
            ],
            3,
        )
        .for_asset("A".into());
        assert!(feed.poll().await.unwrap().is_none());
        assert!(feed.poll().await.unwrap().is_none());
        match feed.poll().await {
            Err(FeedError::RetriesExhausted { failures, .. }) => assert_eq!(failures, 3),
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        // Counter restarts after being reported.
        assert!(feed.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let mut feed = settings(
            vec![
                Err(anyhow::anyhow!("timeout")),
                Ok(Some(curve(40.0))),
                Err(anyhow::anyhow!("timeout")),
            ],
            2,
        )
        .for_asset("A".into());
        assert!(feed.poll().await.unwrap().is_none());
        assert!(feed.poll().await.unwrap().is_some());
        assert!(feed.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_reading_scales_raw_reserve_and_ignores_other_assets() {
        let feed = settings(vec![], 3).for_asset("A".into());
        let update = TradeUpdate {
            asset_id: "A".into(),
            quote_reserve: 85_000_000_000.0,
            market_cap_quote: 400.0,
            complete: false,
        };
        let reading = feed.from_push(&update).await.unwrap();
        assert_eq!(reading.progress_fraction, 1.0);
        assert_eq!(reading.valuation_estimate, 40_000.0);
        assert_eq!(reading.source, ReadingSource::Push);

        let other = TradeUpdate {
            asset_id: "B".into(),
            ..update
        };
        assert!(feed.from_push(&other).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_gate_respects_connection_and_debounce() {
        let mut gate = FallbackGate::new(false, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(gate.should_poll(t0));

        gate.record_push(t0);
        assert!(!gate.should_poll(t0 + Duration::from_secs(5)));
        assert!(gate.should_poll(t0 + Duration::from_secs(10)));

        gate.set_connected(true);
        assert!(!gate.should_poll(t0 + Duration::from_secs(60)));
        assert!(!gate.is_active());
    }
}
