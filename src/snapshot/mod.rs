//! Participant Snapshot Engine.
//!
//! Enumerates every holder of an asset (primary source, then the fallback
//! scan), persists the full ranked set under `holders:{asset}` and hands
//! back the top K.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SnapshotConfig;
use crate::errors::{EnumerationError, StoreError};
use crate::ledger::{HolderBalance, HolderSource};
use crate::model::{AssetId, ParticipantRecord};
use crate::store::KeyValueStore;

pub fn holders_key(asset: &AssetId) -> String {
    format!("holders:{}", asset)
}

/// Sum balances per identity and drop empty ones. Identities keep the
/// position of their first account.
pub fn aggregate(holders: Vec<HolderBalance>) -> Vec<(String, f64)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<(String, f64)> = Vec::new();
    for h in holders {
        if h.owner.is_empty() || !h.amount.is_finite() {
            continue;
        }
        match index.get(&h.owner) {
            Some(&i) => out[i].1 += h.amount,
            None => {
                index.insert(h.owner.clone(), out.len());
                out.push((h.owner, h.amount));
            }
        }
    }
    out.retain(|(_, weight)| *weight > 0.0);
    out
}

/// Order by weight descending, ties by input order, and number from 1.
pub fn rank_participants(entries: Vec<(String, f64)>) -> Vec<ParticipantRecord> {
    let mut entries = entries;
    entries.sort_by(|a, b| b.1.total_cmp(&a.1));
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (identity, weight))| ParticipantRecord {
            identity,
            weight,
            rank: i as u32 + 1,
        })
        .collect()
}

pub struct SnapshotEngine {
    primary: Arc<dyn HolderSource>,
    fallback: Arc<dyn HolderSource>,
    store: Arc<dyn KeyValueStore>,
    config: SnapshotConfig,
}

impl SnapshotEngine {
    pub fn new(
        primary: Arc<dyn HolderSource>,
        fallback: Arc<dyn HolderSource>,
        store: Arc<dyn KeyValueStore>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            store,
            config,
        }
    }

    /// Capture, persist and return the top-K participants of `asset`.
    pub async fn capture_snapshot(
        &self,
        asset: &AssetId,
    ) -> Result<Vec<ParticipantRecord>, EnumerationError> {
        let started = std::time::Instant::now();
        let holders = self.enumerate_with_fallback(asset).await?;

        let key = holders_key(asset);
        self.store.del(&key).await?;
        self.store.sorted_set_add(&key, holders.clone()).await?;

        let top = self.top_participants(asset, self.config.top_k).await?;
        info!(
            asset = %asset.short(),
            holders = holders.len(),
            top = top.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot captured"
        );
        Ok(top)
    }

    /// Re-read a persisted snapshot, ranked.
    pub async fn top_participants(
        &self,
        asset: &AssetId,
        n: usize,
    ) -> Result<Vec<ParticipantRecord>, StoreError> {
        let entries = self.store.sorted_set_top_n(&holders_key(asset), n).await?;
        Ok(rank_participants(entries))
    }

    pub async fn holder_count(&self, asset: &AssetId) -> Result<usize, StoreError> {
        self.store.sorted_set_len(&holders_key(asset)).await
    }

    /// Drop the persisted set. Only once distribution for `asset` is done.
    pub async fn clear_snapshot(&self, asset: &AssetId) -> Result<(), StoreError> {
        info!(asset = %asset.short(), "clearing snapshot");
        self.store.del(&holders_key(asset)).await
    }

    /// Ranked first page of the primary source, not persisted. Used for the
    /// periodic ranking broadcast.
    pub async fn preview(
        &self,
        asset: &AssetId,
        size: usize,
    ) -> anyhow::Result<Vec<ParticipantRecord>> {
        let page = self
            .primary
            .fetch_page(asset, 1, self.config.page_limit)
            .await?;
        let mut ranked = rank_participants(aggregate(page.holders));
        ranked.truncate(size);
        Ok(ranked)
    }

    async fn enumerate_with_fallback(
        &self,
        asset: &AssetId,
    ) -> Result<Vec<(String, f64)>, EnumerationError> {
        let primary_problem = match self.enumerate(self.primary.as_ref(), asset).await {
            Ok(holders) if !holders.is_empty() => return Ok(holders),
            Ok(_) => "no holders".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(
            asset = %asset.short(),
            source = self.primary.name(),
            problem = %primary_problem,
            fallback = self.fallback.name(),
            "primary holder source unusable, trying fallback"
        );

        match self.enumerate(self.fallback.as_ref(), asset).await {
            Ok(holders) if !holders.is_empty() => Ok(holders),
            Ok(_) => Err(EnumerationError::NoParticipants {
                asset: asset.to_string(),
            }),
            Err(e) => Err(EnumerationError::AllSourcesFailed {
                asset: asset.to_string(),
                primary: primary_problem,
                fallback: e.to_string(),
            }),
        }
    }

    async fn enumerate(
        &self,
        source: &dyn HolderSource,
        asset: &AssetId,
    ) -> Result<Vec<(String, f64)>, EnumerationError> {
        let mut all = Vec::new();
        for page in 1..=self.config.max_pages {
            let result = source
                .fetch_page(asset, page, self.config.page_limit)
                .await
                .map_err(|e| EnumerationError::Source {
                    source_name: source.name().to_string(),
                    message: format!("page {}: {:#}", page, e),
                })?;
            all.extend(result.holders);
            if !result.has_more {
                return Ok(aggregate(all));
            }
        }
        warn!(
            asset = %asset.short(),
            source = source.name(),
            max_pages = self.config.max_pages,
            "page ceiling reached, snapshot truncated"
        );
        Ok(aggregate(all))
    }
}
