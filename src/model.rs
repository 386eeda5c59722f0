//! Core domain types shared by every stage of the evolution lifecycle.

use crate::errors::FeedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base (asset) amounts carry 6 decimals on the ledger.
pub const BASE_UNIT: f64 = 1e6;
/// Quote (collateral) amounts carry 9 decimals on the ledger.
pub const QUOTE_UNIT: f64 = 1e9;

const DISCRIMINATOR_LEN: usize = 8;
const ACCOUNT_LEN: usize = DISCRIMINATOR_LEN + 5 * 8 + 1;

/// Ledger identifier of a tradable asset (a mint address in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reserve levels of an asset's pricing curve, in whole units.
///
/// Produced from raw account bytes; never mutated, only superseded by a
/// newer read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetState {
    pub virtual_base: f64,
    pub virtual_quote: f64,
    pub real_base: f64,
    pub real_quote: f64,
    pub total_supply: f64,
    pub complete: bool,
}

impl AssetState {
    /// Decode a curve account: an 8-byte discriminator, five little-endian
    /// u64 amounts, then a one-byte completion flag. Trailing bytes are
    /// ignored.
    pub fn decode(data: &[u8]) -> Result<Self, FeedError> {
        if data.len() < ACCOUNT_LEN {
            return Err(FeedError::Decode(format!(
                "expected at least {} bytes, got {}",
                ACCOUNT_LEN,
                data.len()
            )));
        }
        let word = |i: usize| -> u64 {
            let start = DISCRIMINATOR_LEN + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[start..start + 8]);
            u64::from_le_bytes(buf)
        };
        Ok(Self {
            virtual_base: word(0) as f64 / BASE_UNIT,
            virtual_quote: word(1) as f64 / QUOTE_UNIT,
            real_base: word(2) as f64 / BASE_UNIT,
            real_quote: word(3) as f64 / QUOTE_UNIT,
            total_supply: word(4) as f64 / BASE_UNIT,
            complete: data[DISCRIMINATOR_LEN + 40] != 0,
        })
    }
}

/// Where a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingSource {
    Push,
    Poll,
}

/// A normalized progress observation, consumed once by the phase monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReading {
    pub asset_id: AssetId,
    /// Clamped to `[0, 1]`.
    pub progress_fraction: f64,
    /// Estimated valuation in USD.
    pub valuation_estimate: f64,
    pub complete: bool,
    pub observed_at: DateTime<Utc>,
    pub source: ReadingSource,
}

/// Persisted lifecycle phase of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    #[default]
    Idle,
    Casual,
    Intensive,
    Executing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "idle"),
            CyclePhase::Casual => write!(f, "casual"),
            CyclePhase::Intensive => write!(f, "intensive"),
            CyclePhase::Executing => write!(f, "executing"),
        }
    }
}

impl std::str::FromStr for CyclePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CyclePhase::Idle),
            "casual" => Ok(CyclePhase::Casual),
            "intensive" => Ok(CyclePhase::Intensive),
            "executing" => Ok(CyclePhase::Executing),
            other => Err(format!(
                "unknown phase '{}' (expected idle, casual, intensive or executing)",
                other
            )),
        }
    }
}

/// State of the per-asset phase monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorPhase {
    Casual,
    Intensive,
    Executing,
    #[default]
    Stopped,
}

impl MonitorPhase {
    /// The cycle phase a running monitor phase is persisted as.
    pub fn as_cycle_phase(self) -> CyclePhase {
        match self {
            MonitorPhase::Casual => CyclePhase::Casual,
            MonitorPhase::Intensive => CyclePhase::Intensive,
            MonitorPhase::Executing => CyclePhase::Executing,
            MonitorPhase::Stopped => CyclePhase::Idle,
        }
    }

    pub fn is_watching(self) -> bool {
        matches!(self, MonitorPhase::Casual | MonitorPhase::Intensive)
    }
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorPhase::Casual => write!(f, "casual"),
            MonitorPhase::Intensive => write!(f, "intensive"),
            MonitorPhase::Executing => write!(f, "executing"),
            MonitorPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// The single persisted record describing where the deployment is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub active_asset_id: AssetId,
    /// Starts at 1 and only ever increases.
    pub generation: u64,
    pub phase: CyclePhase,
    pub last_updated_at: DateTime<Utc>,
}

/// A ranked holder of an asset at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub identity: String,
    pub weight: f64,
    /// 1-based, derived from weight order on every read.
    pub rank: u32,
}

/// Outcome of one execution sequence run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Generation of the cycle that ran the sequence.
    pub cycle_id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_asset_id: Option<AssetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission attempts made, including the escalated retry.
    pub attempts: u32,
}

/// Outcome of one airdrop batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionBatchResult {
    pub batch_index: usize,
    pub recipient_count: usize,
    pub recipients: Vec<String>,
    /// Amount sent to each recipient, in base units.
    pub amount_each: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_id_short_truncates_to_eight_chars() {
        let id = AssetId::new("7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr");
        assert_eq!(id.short(), "7GCihgDB");
        assert_eq!(AssetId::new("abc").short(), "abc");
    }

    #[test]
    fn asset_id_serializes_transparently() {
        let json = serde_json::to_string(&AssetId::new("MintA")).unwrap();
        assert_eq!(json, "\"MintA\"");
    }

    fn encode_account(words: [u64; 5], complete: bool) -> Vec<u8> {
        let mut data = vec![0xAA; 8];
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.push(complete as u8);
        data
    }

    #[test]
    fn decode_scales_amounts_by_decimals() {
        let data = encode_account(
            [
                1_073_000_000_000_000,
                30_000_000_000,
                793_100_000_000_000,
                0,
                1_000_000_000_000_000,
            ],
            false,
        );
        let state = AssetState::decode(&data).unwrap();
        assert_eq!(state.virtual_base, 1_073_000_000.0);
        assert_eq!(state.virtual_quote, 30.0);
        assert_eq!(state.total_supply, 1_000_000_000.0);
        assert!(!state.complete);
    }

    #[test]
    fn decode_reads_complete_flag() {
        let data = encode_account([1, 1, 1, 1, 1], true);
        assert!(AssetState::decode(&data).unwrap().complete);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        match AssetState::decode(&[0u8; 20]) {
            Err(FeedError::Decode(msg)) => assert!(msg.contains("20")),
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn cycle_phase_round_trips_through_str() {
        for phase in [
            CyclePhase::Idle,
            CyclePhase::Casual,
            CyclePhase::Intensive,
            CyclePhase::Executing,
        ] {
            let parsed: CyclePhase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert!("graduated".parse::<CyclePhase>().is_err());
    }

    #[test]
    fn monitor_phase_maps_to_cycle_phase() {
        assert_eq!(MonitorPhase::Casual.as_cycle_phase(), CyclePhase::Casual);
        assert_eq!(MonitorPhase::Stopped.as_cycle_phase(), CyclePhase::Idle);
        assert!(MonitorPhase::Intensive.is_watching());
        assert!(!MonitorPhase::Executing.is_watching());
    }

    #[test]
    fn execution_result_omits_empty_optionals() {
        let result = ExecutionResult {
            cycle_id: 3,
            success: false,
            new_asset_id: None,
            transaction_ref: None,
            error: Some("dropped".into()),
            attempts: 2,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("new_asset_id").is_none());
        assert_eq!(json["error"], "dropped");
    }
}
