//! Quote-currency USD price, cached, with multi-source fallback.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PriceConfig;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD price of one unit of the quote currency. Never fails; falls back
    /// to stale or configured values.
    async fn quote_usd(&self) -> f64;
}

/// A single price endpoint and how to read its response.
#[derive(Debug, Clone)]
pub struct PriceSource {
    pub name: &'static str,
    pub url: String,
    extract: fn(&Value) -> Option<f64>,
}

const QUOTE_MINT: &str = "So11111111111111111111111111111111111111112";

impl PriceSource {
    pub fn jupiter() -> Self {
        Self {
            name: "jupiter",
            url: format!("https://api.jup.ag/price/v3?ids={}", QUOTE_MINT),
            extract: |v| {
                let entry = &v["data"][QUOTE_MINT];
                entry["usdPrice"]
                    .as_f64()
                    .or_else(|| entry["price"].as_str().and_then(|p| p.parse().ok()))
            },
        }
    }

    pub fn binance() -> Self {
        Self {
            name: "binance",
            url: "https://api.binance.com/api/v3/ticker/price?symbol=SOLUSDT".to_string(),
            extract: |v| v["price"].as_str().and_then(|p| p.parse().ok()),
        }
    }

    pub fn kraken() -> Self {
        Self {
            name: "kraken",
            url: "https://api.kraken.com/0/public/Ticker?pair=SOLUSD".to_string(),
            extract: |v| {
                if v["error"].as_array().is_some_and(|e| !e.is_empty()) {
                    return None;
                }
                v["result"]
                    .as_object()?
                    .values()
                    .next()?["c"][0]
                    .as_str()?
                    .parse()
                    .ok()
            },
        }
    }

    pub fn coingecko() -> Self {
        Self {
            name: "coingecko",
            url: "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd"
                .to_string(),
            extract: |v| v["solana"]["usd"].as_f64(),
        }
    }

    fn read(&self, body: &Value) -> Option<f64> {
        (self.extract)(body).filter(|p| p.is_finite() && *p > 0.0)
    }
}

struct Cached {
    price: f64,
    at: Instant,
}

/// Tries each source in order, caching the first good answer.
pub struct HttpPriceFeed {
    http: reqwest::Client,
    sources: Vec<PriceSource>,
    cache_for: Duration,
    fallback: f64,
    cache: Mutex<Option<Cached>>,
}

impl HttpPriceFeed {
    pub fn new(config: &PriceConfig) -> anyhow::Result<Self> {
        Self::with_sources(
            config,
            vec![
                PriceSource::jupiter(),
                PriceSource::binance(),
                PriceSource::kraken(),
                PriceSource::coingecko(),
            ],
        )
    }

    pub fn with_sources(config: &PriceConfig, sources: Vec<PriceSource>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build price HTTP client")?;
        Ok(Self {
            http,
            sources,
            cache_for: Duration::from_millis(config.cache_ms),
            fallback: config.fallback_price_usd,
            cache: Mutex::new(None),
        })
    }

    fn cached(&self, fresh_only: bool) -> Option<f64> {
        let guard = self.cache.lock().ok()?;
        let cached = guard.as_ref()?;
        if fresh_only && cached.at.elapsed() >= self.cache_for {
            return None;
        }
        Some(cached.price)
    }

    async fn fetch(&self, source: &PriceSource) -> anyhow::Result<f64> {
        let body: Value = self
            .http
            .get(&source.url)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        source
            .read(&body)
            .with_context(|| format!("{} response carried no usable price", source.name))
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn quote_usd(&self) -> f64 {
        if let Some(price) = self.cached(true) {
            return price;
        }

        for source in &self.sources {
            match self.fetch(source).await {
                Ok(price) => {
                    debug!(source = source.name, price, "quote price refreshed");
                    if let Ok(mut guard) = self.cache.lock() {
                        *guard = Some(Cached {
                            price,
                            at: Instant::now(),
                        });
                    }
                    return price;
                }
                Err(e) => warn!(source = source.name, error = %e, "price source failed"),
            }
        }

        if let Some(stale) = self.cached(false) {
            warn!(price = stale, "all price sources failed, using stale price");
            return stale;
        }
        warn!(price = self.fallback, "all price sources failed, using fallback price");
        self.fallback
    }
}

/// Constant price, for tests and offline runs.
pub struct FixedPrice(pub f64);

#[async_trait]
impl PriceFeed for FixedPrice {
    async fn quote_usd(&self) -> f64 {
        self.0
    }
}
