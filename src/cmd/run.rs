//! `evolver run`: wire the real collaborators and drive the lifecycle.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evolver::config::EvolverConfig;
use evolver::feed::PushHub;
use evolver::ledger::{DasHolderSource, RelayLedger, RpcClient, ScanHolderSource};
use evolver::orchestrator::{Orchestrator, Services};
use evolver::price::HttpPriceFeed;
use evolver::store::SqliteStore;
use evolver::stream::{self, AppState, StreamPublisher};

const EVENT_CAPACITY: usize = 256;

pub async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = EvolverConfig::load_layered(config_path)?;
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
    }

    let store = Arc::new(
        SqliteStore::open(&config.store.path).context("Failed to open the state store")?,
    );
    let rpc = RpcClient::new(&config.ledger.rpc_url, config.request_timeout())?;
    let relay = Arc::new(RelayLedger::new(
        &config.ledger.relay_url,
        rpc.clone(),
        config.request_timeout(),
    )?);
    let price = Arc::new(HttpPriceFeed::new(&config.price)?);
    let publisher = StreamPublisher::new(EVENT_CAPACITY);
    let push = PushHub::new();

    let services = Services {
        ledger: relay.clone(),
        transfers: relay,
        primary_holders: Arc::new(DasHolderSource::new(rpc.clone())),
        fallback_holders: Arc::new(ScanHolderSource::new(rpc)),
        price,
        store,
        publisher: Arc::new(publisher.clone()),
        push: push.clone(),
    };
    let (orchestrator, handle) = Orchestrator::new(config.clone(), services)
        .await
        .context("Failed to load cycle state")?;

    let status = handle.status();
    info!(
        asset = %status.active_asset_id,
        generation = status.generation,
        phase = %status.phase,
        "evolver starting"
    );

    if config.server.admin_token.is_none() && !config.server.is_loopback() {
        warn!(
            host = %config.server.host,
            "admin and ingest routes are unauthenticated on a non-loopback host; set server.admin_token"
        );
    }

    let cancel = CancellationToken::new();
    let app_state = Arc::new(AppState {
        events: publisher.sender(),
        orchestrator: handle,
        push,
        admin_token: config.server.admin_token.clone(),
    });
    let server = tokio::spawn({
        let cancel = cancel.clone();
        let server_config = config.server.clone();
        async move { stream::serve(&server_config, app_state, cancel).await }
    });
    let mut lifecycle = tokio::spawn(orchestrator.run(cancel.clone()));

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("shutting down");
            None
        }
        joined = &mut lifecycle => Some(joined),
    };
    cancel.cancel();

    let joined = match finished {
        Some(joined) => joined,
        None => lifecycle.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "lifecycle stopped with an error"),
        Err(e) => error!(error = %e, "lifecycle task panicked"),
    }
    match server.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "server task panicked"),
    }
    Ok(())
}
