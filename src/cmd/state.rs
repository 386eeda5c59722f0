//! `evolver status` and `evolver recover`, read straight from the store.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use evolver::config::EvolverConfig;
use evolver::orchestrator::{self, CycleStore};
use evolver::store::{KeyValueStore, SqliteStore};

fn open_store(config_path: &Path) -> Result<Arc<dyn KeyValueStore>> {
    let config = EvolverConfig::load_layered(config_path)?;
    if !config.store.path.exists() {
        anyhow::bail!(
            "No state store at {}. Has `evolver run` been started?",
            config.store.path.display()
        );
    }
    let store = SqliteStore::open(&config.store.path).context("Failed to open the state store")?;
    Ok(Arc::new(store))
}

pub async fn cmd_status(config_path: &Path, json: bool) -> Result<()> {
    let cycles = CycleStore::new(open_store(config_path)?);
    let state = cycles.load().await?;
    let pending = cycles.pending_execution().await?;
    let hold = cycles.hold().await?;

    if json {
        let value = serde_json::json!({
            "state": state,
            "pending_execution": pending,
            "hold": hold,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let Some(state) = state else {
        println!("No cycle state yet. Set genesis_asset and run `evolver run`.");
        return Ok(());
    };
    println!();
    println!("Evolver Status");
    println!("==============");
    println!("  active asset: {}", state.active_asset_id);
    println!("  generation:   {}", state.generation);
    println!("  phase:        {}", state.phase);
    println!("  updated:      {}", state.last_updated_at.to_rfc3339());
    if let Some(asset) = hold {
        println!("  held:         {} (last cycle failed, waiting for a trigger)", asset);
    }
    if let Some(p) = pending {
        println!();
        println!(
            "Pending execution for generation {} ({} -> {}), started {}",
            p.generation,
            p.asset,
            p.successor,
            p.started_at.to_rfc3339()
        );
        println!("Check the ledger, then run `evolver recover` if the sequence did not land.");
    }
    println!();
    Ok(())
}

pub async fn cmd_recover(config_path: &Path, json: bool) -> Result<()> {
    let report = orchestrator::recover(open_store(config_path)?)
        .await
        .context("Recovery refused")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match &report.cleared_marker {
        Some(p) => println!(
            "Cleared pending execution for generation {} ({} -> {}).",
            p.generation, p.asset, p.successor
        ),
        None => println!("No pending execution marker was present."),
    }
    println!(
        "Phase reset to {} for {} (generation {}).",
        report.state.phase, report.state.active_asset_id, report.state.generation
    );
    Ok(())
}
