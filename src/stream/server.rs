//! HTTP surface: the event stream, status, manual trigger and push ingest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::{EventPayload, LifecycleEvent};
use crate::config::ServerConfig;
use crate::errors::TriggerError;
use crate::feed::{PushHub, TradeUpdate};
use crate::model::AssetId;
use crate::orchestrator::{OrchestratorHandle, StatusReport};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared-secret header required on the admin and ingest routes when
/// `server.admin_token` is set.
pub const ADMIN_TOKEN_HEADER: &str = "x-evolver-token";

pub struct AppState {
    pub events: broadcast::Sender<String>,
    pub orchestrator: OrchestratorHandle,
    pub push: PushHub,
    pub admin_token: Option<String>,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                format!("missing or invalid {} header", ADMIN_TOKEN_HEADER),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Unavailable(_) => ApiError::Unavailable(err.to_string()),
            TriggerError::Stale { .. } | TriggerError::NothingToRetry { .. } => {
                ApiError::Conflict(err.to_string())
            }
        }
    }
}

/// Optional guard for `/admin/trigger`: the asset and generation the
/// operator is re-attempting.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    pub asset: Option<String>,
    pub generation: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionReport {
    pub connected: bool,
}

pub fn build_router(state: SharedState) -> Router {
    let guarded = Router::new()
        .route("/admin/trigger", post(trigger))
        .route("/ingest/trade", post(ingest_trade))
        .route("/ingest/connection", post(ingest_connection))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .merge(guarded)
        .with_state(state)
}

async fn require_token(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.admin_token.as_deref() {
        let provided = request
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            warn!(path = %request.uri().path(), "rejected request without a valid admin token");
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Bind and serve until `cancel` fires.
pub async fn serve(config: &ServerConfig, state: SharedState, cancel: CancellationToken) -> Result<()> {
    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "stream server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Server error")?;
    info!("stream server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> Json<StatusReport> {
    Json(state.orchestrator.status())
}

async fn trigger(
    State(state): State<SharedState>,
    Query(params): Query<TriggerParams>,
) -> Result<Response, ApiError> {
    let expected = match (params.asset, params.generation) {
        (Some(asset), Some(generation)) => Some((AssetId::new(asset), generation)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "asset and generation must be given together".to_string(),
            ));
        }
    };
    let ack = state.orchestrator.trigger(expected).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

async fn ingest_trade(
    State(state): State<SharedState>,
    Json(update): Json<TradeUpdate>,
) -> StatusCode {
    debug!(asset = %update.asset_id.short(), reserve = update.quote_reserve, "trade ingested");
    state.push.publish_trade(update);
    StatusCode::ACCEPTED
}

async fn ingest_connection(
    State(state): State<SharedState>,
    Json(report): Json<ConnectionReport>,
) -> StatusCode {
    state.push.set_connected(report.connected);
    StatusCode::NO_CONTENT
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    // Subscribe before reading the status so nothing falls in between.
    let rx = state.events.subscribe();
    let (mut sender, receiver) = socket.split();

    if let Some(json) = initial_state_message(&state.orchestrator.status()) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }
    debug!("stream subscriber connected");
    run_socket_loop(sender, receiver, rx).await;
    debug!("stream subscriber disconnected");
}

pub fn initial_state_message(status: &StatusReport) -> Option<String> {
    let event = LifecycleEvent::now(EventPayload::InitialState {
        active_asset_id: status.active_asset_id.clone(),
        generation: status.generation,
        phase: status.phase,
        last_reading: status.last_reading.clone(),
    });
    match serde_json::to_string(&event) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "failed to serialize initial state");
            None
        }
    }
}

/// Forward events, answer the keepalive and stop on close or a missed pong.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("stream subscriber missed pong");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stream subscriber lagging");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
