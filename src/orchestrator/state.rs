//! Persisted `CycleState` plus the orchestrator's bookkeeping keys.
//!
//! Only the orchestrator writes through this type. Reads are strict: a
//! partially written or unparsable state is reported as corrupt instead
//! of being reinitialised.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::errors::StateError;
use crate::executor::{PENDING_EXECUTION_KEY, PendingExecution};
use crate::model::{AssetId, CyclePhase, CycleState};
use crate::store::KeyValueStore;

pub const ACTIVE_ASSET_KEY: &str = "active_asset";
pub const GENERATION_KEY: &str = "generation";
pub const PHASE_KEY: &str = "phase";
pub const LAST_UPDATE_KEY: &str = "last_update";
/// Asset whose last cycle failed; threshold signals for it are ignored
/// until a manual trigger.
pub const HOLD_KEY: &str = "cycle_hold";

#[derive(Clone)]
pub struct CycleStore {
    store: Arc<dyn KeyValueStore>,
}

fn corrupt(key: &str, value: &str, reason: impl Into<String>) -> StateError {
    StateError::Corrupt {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

impl CycleStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read the persisted state. `None` only when nothing was ever written.
    pub async fn load(&self) -> Result<Option<CycleState>, StateError> {
        let active = self.store.get(ACTIVE_ASSET_KEY).await?;
        let generation = self.store.get(GENERATION_KEY).await?;
        let phase = self.store.get(PHASE_KEY).await?;
        let last_update = self.store.get(LAST_UPDATE_KEY).await?;

        let Some(active) = active else {
            if let Some(value) = generation.as_ref().or(phase.as_ref()) {
                return Err(corrupt(
                    ACTIVE_ASSET_KEY,
                    "",
                    format!("missing while other cycle keys are set ({})", value),
                ));
            }
            return Ok(None);
        };
        if active.trim().is_empty() {
            return Err(corrupt(ACTIVE_ASSET_KEY, &active, "empty asset id"));
        }

        let generation = match generation {
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => return Err(corrupt(GENERATION_KEY, &raw, "generation starts at 1")),
                Ok(g) => g,
                Err(e) => return Err(corrupt(GENERATION_KEY, &raw, e.to_string())),
            },
            None => return Err(corrupt(GENERATION_KEY, "", "missing")),
        };

        let phase = match phase {
            Some(raw) => raw
                .parse::<CyclePhase>()
                .map_err(|e| corrupt(PHASE_KEY, &raw, e))?,
            None => return Err(corrupt(PHASE_KEY, "", "missing")),
        };

        let last_updated_at = match last_update {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(LAST_UPDATE_KEY, &raw, e.to_string()))?,
            None => {
                warn!("cycle state has no last_update, using now");
                Utc::now()
            }
        };

        Ok(Some(CycleState {
            active_asset_id: AssetId::new(active),
            generation,
            phase,
            last_updated_at,
        }))
    }

    /// Load the persisted state, or seed generation 1 with `genesis` on the
    /// very first boot.
    pub async fn load_or_init(&self, genesis: Option<&AssetId>) -> Result<CycleState, StateError> {
        if let Some(state) = self.load().await? {
            if genesis.is_some_and(|g| *g != state.active_asset_id) {
                info!(
                    configured = ?genesis,
                    active = %state.active_asset_id.short(),
                    "ignoring genesis asset, cycle state already exists"
                );
            }
            return Ok(state);
        }
        let genesis = genesis.ok_or(StateError::MissingGenesis)?;
        let state = CycleState {
            active_asset_id: genesis.clone(),
            generation: 1,
            phase: CyclePhase::Idle,
            last_updated_at: Utc::now(),
        };
        info!(asset = %genesis.short(), "initialising cycle state from genesis asset");
        self.save(&state).await?;
        Ok(state)
    }

    /// Write every field in one transaction.
    pub async fn save(&self, state: &CycleState) -> Result<(), StateError> {
        self.store
            .set_many(vec![
                (ACTIVE_ASSET_KEY.into(), state.active_asset_id.to_string()),
                (GENERATION_KEY.into(), state.generation.to_string()),
                (PHASE_KEY.into(), state.phase.to_string()),
                (LAST_UPDATE_KEY.into(), state.last_updated_at.to_rfc3339()),
            ])
            .await?;
        Ok(())
    }

    pub async fn set_phase(&self, state: &mut CycleState, phase: CyclePhase) -> Result<(), StateError> {
        let now = Utc::now();
        self.store
            .set_many(vec![
                (PHASE_KEY.into(), phase.to_string()),
                (LAST_UPDATE_KEY.into(), now.to_rfc3339()),
            ])
            .await?;
        state.phase = phase;
        state.last_updated_at = now;
        Ok(())
    }

    /// Point the deployment at `successor`: next generation, phase Casual.
    /// The in-memory state only changes once the write succeeded.
    pub async fn advance(&self, state: &mut CycleState, successor: AssetId) -> Result<(), StateError> {
        let next = CycleState {
            active_asset_id: successor,
            generation: state.generation + 1,
            phase: CyclePhase::Casual,
            last_updated_at: Utc::now(),
        };
        self.save(&next).await?;
        *state = next;
        Ok(())
    }

    pub async fn pending_execution(&self) -> Result<Option<PendingExecution>, StateError> {
        match self.store.get(PENDING_EXECUTION_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| corrupt(PENDING_EXECUTION_KEY, &raw, e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn clear_pending_execution(&self) -> Result<(), StateError> {
        self.store.del(PENDING_EXECUTION_KEY).await?;
        Ok(())
    }

    pub async fn hold(&self) -> Result<Option<AssetId>, StateError> {
        Ok(self.store.get(HOLD_KEY).await?.map(AssetId::new))
    }

    pub async fn set_hold(&self, asset: &AssetId) -> Result<(), StateError> {
        self.store.set(HOLD_KEY, asset.as_str()).await?;
        Ok(())
    }

    pub async fn clear_hold(&self) -> Result<(), StateError> {
        self.store.del(HOLD_KEY).await?;
        Ok(())
    }
}
