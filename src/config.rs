//! Layered configuration for evolver.
//!
//! Values come from `evolver.toml` (every field has a default, so an empty
//! file is valid), then from environment variables, then from CLI flags.
//!
//! ```toml
//! genesis_asset = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr"
//!
//! [ledger]
//! rpc_url = "https://rpc.example.org"
//! relay_url = "http://127.0.0.1:9400"
//!
//! [monitoring]
//! casual_poll_interval_ms = 30000
//! intensive_poll_interval_ms = 200
//! valuation_threshold = 60400.0
//! graduation_threshold = 0.995
//!
//! [execution]
//! claim_enabled = false
//! seed_amount = 500000000
//! tip = 1000000
//! retry_tip = 5000000
//!
//! [distribution]
//! batch_size = 8
//! batch_delay_ms = 500
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ledger endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint used for holder enumeration and account reads
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Program relay that encodes, signs and submits operations
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8899".to_string()
}

fn default_relay_url() -> String {
    "http://127.0.0.1:9400".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            relay_url: default_relay_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Phase monitor thresholds and polling rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_casual_poll_interval_ms")]
    pub casual_poll_interval_ms: u64,
    #[serde(default = "default_intensive_poll_interval_ms")]
    pub intensive_poll_interval_ms: u64,
    /// USD valuation at which polling switches to the intensive rate
    #[serde(default = "default_valuation_threshold")]
    pub valuation_threshold: f64,
    /// Progress fraction that triggers a cycle; kept below 1.0 to fire early
    #[serde(default = "default_graduation_threshold")]
    pub graduation_threshold: f64,
}

fn default_casual_poll_interval_ms() -> u64 {
    30_000
}

fn default_intensive_poll_interval_ms() -> u64 {
    200
}

fn default_valuation_threshold() -> f64 {
    60_400.0
}

fn default_graduation_threshold() -> f64 {
    0.995
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            casual_poll_interval_ms: default_casual_poll_interval_ms(),
            intensive_poll_interval_ms: default_intensive_poll_interval_ms(),
            valuation_threshold: default_valuation_threshold(),
            graduation_threshold: default_graduation_threshold(),
        }
    }
}

/// Progress feed adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Direct polling rate while the push channel is down
    #[serde(default = "default_fallback_poll_interval_ms")]
    pub fallback_poll_interval_ms: u64,
    /// Fallback polls are skipped this long after a push update
    #[serde(default = "default_push_debounce_ms")]
    pub push_debounce_ms: u64,
    /// Consecutive failed polls before a feed error is raised
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    /// Virtual quote reserve at launch, in whole units
    #[serde(default = "default_initial_reserve")]
    pub initial_reserve: f64,
    /// Virtual quote reserve at graduation, in whole units
    #[serde(default = "default_target_reserve")]
    pub target_reserve: f64,
}

fn default_fallback_poll_interval_ms() -> u64 {
    5_000
}

fn default_push_debounce_ms() -> u64 {
    10_000
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_initial_reserve() -> f64 {
    30.0
}

fn default_target_reserve() -> f64 {
    85.0
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            fallback_poll_interval_ms: default_fallback_poll_interval_ms(),
            push_debounce_ms: default_push_debounce_ms(),
            max_poll_failures: default_max_poll_failures(),
            initial_reserve: default_initial_reserve(),
            target_reserve: default_target_reserve(),
        }
    }
}

/// Quote-currency price feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    #[serde(default = "default_price_cache_ms")]
    pub cache_ms: u64,
    #[serde(default = "default_price_timeout_ms")]
    pub timeout_ms: u64,
    /// Last-resort price when every source fails and nothing is cached
    #[serde(default = "default_fallback_price_usd")]
    pub fallback_price_usd: f64,
}

fn default_price_cache_ms() -> u64 {
    10_000
}

fn default_price_timeout_ms() -> u64 {
    5_000
}

fn default_fallback_price_usd() -> f64 {
    185.0
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            cache_ms: default_price_cache_ms(),
            timeout_ms: default_price_timeout_ms(),
            fallback_price_usd: default_fallback_price_usd(),
        }
    }
}

/// Holder snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Participants returned for distribution
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Hard ceiling on pages fetched per source
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_top_k() -> usize {
    100
}

fn default_page_limit() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    200
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            page_limit: default_page_limit(),
            max_pages: default_max_pages(),
        }
    }
}

/// Claim / mint / seed sequence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub claim_enabled: bool,
    /// Seed capital in quote base units
    #[serde(default = "default_seed_amount")]
    pub seed_amount: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Priority tip for the first attempt
    #[serde(default = "default_tip")]
    pub tip: u64,
    /// Escalated tip for the retry
    #[serde(default = "default_retry_tip")]
    pub retry_tip: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_seed_amount() -> u64 {
    500_000_000
}

fn default_slippage_bps() -> u16 {
    500
}

fn default_tip() -> u64 {
    1_000_000
}

fn default_retry_tip() -> u64 {
    5_000_000
}

fn default_max_attempts() -> u32 {
    2
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            claim_enabled: false,
            seed_amount: default_seed_amount(),
            slippage_bps: default_slippage_bps(),
            tip: default_tip(),
            retry_tip: default_retry_tip(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Airdrop batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_batch_size() -> usize {
    8
}

fn default_batch_delay_ms() -> u64 {
    500
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

/// Successor naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_symbol_prefix")]
    pub symbol_prefix: String,
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
}

fn default_name_prefix() -> String {
    "Evolver".to_string()
}

fn default_symbol_prefix() -> String {
    "EVO".to_string()
}

fn default_base_uri() -> String {
    "https://arweave.net/placeholder".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            symbol_prefix: default_symbol_prefix(),
            base_uri: default_base_uri(),
        }
    }
}

/// Periodic participant-ranking broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_broadcast_size")]
    pub size: usize,
}

fn default_broadcast_interval_ms() -> u64 {
    30_000
}

fn default_broadcast_size() -> usize {
    100
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_broadcast_interval_ms(),
            size: default_broadcast_size(),
        }
    }
}

/// Event stream / status server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served dashboard
    #[serde(default)]
    pub dev_mode: bool,
    /// Shared secret for the admin and ingest routes. Unset leaves them
    /// open, which is only safe on a loopback host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            admin_token: None,
        }
    }
}

/// Persistent state location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".evolver/state.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolverConfig {
    /// Asset to seed the cycle state with on first boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_asset: Option<String>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub price: PriceConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl EvolverConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse evolver.toml")
    }

    /// Load the file if it exists, otherwise defaults, then apply the
    /// process environment.
    pub fn load_layered(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize evolver.toml")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment values. `get` is injected so tests need not touch
    /// the real process environment.
    pub fn apply_env<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = get("EVOLVER_RPC_URL") {
            self.ledger.rpc_url = url;
        }
        if let Some(url) = get("EVOLVER_RELAY_URL") {
            self.ledger.relay_url = url;
        }
        if let Some(asset) = get("EVOLVER_GENESIS_ASSET").filter(|a| !a.trim().is_empty()) {
            self.genesis_asset = Some(asset);
        }
        if let Some(path) = get("EVOLVER_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(token) = get("EVOLVER_ADMIN_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.server.admin_token = Some(token);
        }
        if let Some(port) = get("EVOLVER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid EVOLVER_PORT '{}'", port))?;
        }
        Ok(())
    }

    /// Return every problem found; an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let g = self.monitoring.graduation_threshold;
        if !(g > 0.0 && g < 1.0) {
            problems.push(format!(
                "monitoring.graduation_threshold must be in (0, 1), got {}",
                g
            ));
        }
        if self.monitoring.valuation_threshold < 0.0 {
            problems.push("monitoring.valuation_threshold must not be negative".to_string());
        }
        if self.monitoring.casual_poll_interval_ms == 0
            || self.monitoring.intensive_poll_interval_ms == 0
        {
            problems.push("monitoring poll intervals must be non-zero".to_string());
        }
        if self.feed.target_reserve <= self.feed.initial_reserve {
            problems.push(format!(
                "feed.target_reserve ({}) must exceed feed.initial_reserve ({})",
                self.feed.target_reserve, self.feed.initial_reserve
            ));
        }
        if self.feed.fallback_poll_interval_ms == 0 {
            problems.push("feed.fallback_poll_interval_ms must be non-zero".to_string());
        }
        if self.snapshot.top_k == 0 {
            problems.push("snapshot.top_k must be at least 1".to_string());
        }
        if self.snapshot.page_limit == 0 || self.snapshot.max_pages == 0 {
            problems.push("snapshot.page_limit and snapshot.max_pages must be non-zero".to_string());
        }
        if self.execution.max_attempts == 0 {
            problems.push("execution.max_attempts must be at least 1".to_string());
        }
        if self.execution.retry_tip < self.execution.tip {
            problems.push(format!(
                "execution.retry_tip ({}) must not be lower than execution.tip ({})",
                self.execution.retry_tip, self.execution.tip
            ));
        }
        if self.distribution.batch_size == 0 {
            problems.push("distribution.batch_size must be at least 1".to_string());
        }
        if self.broadcast.interval_ms == 0 {
            problems.push("broadcast.interval_ms must be non-zero".to_string());
        }

        problems
    }

    pub fn casual_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.casual_poll_interval_ms)
    }

    pub fn intensive_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.intensive_poll_interval_ms)
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed.fallback_poll_interval_ms)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.feed.push_debounce_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.distribution.batch_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.request_timeout_ms)
    }
}
