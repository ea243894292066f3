use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::errors::{OracleError, OracleResult};
use crate::ingest::TelemetryReport;
use crate::node::{NodeRegistration, OracleHandle, ReadyCall};
use crate::pipeline::PipelineRegistration;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
struct AppState {
    oracle: OracleHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    success: bool,
    #[serde(rename = "shouldReset")]
    should_reset: bool,
}

#[derive(Deserialize)]
struct TopologyQuery {
    model: String,
}

#[derive(Deserialize)]
struct PipelineWsQuery {
    model: Option<String>,
}

pub async fn serve(oracle: OracleHandle, addr: SocketAddr) -> OracleResult<()> {
    let state = AppState { oracle };
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/metrics", post(submit_metrics))
        .route("/api/v1/metrics/report", post(submit_metrics))
        .route("/api/v1/metrics/:address", get(metrics_for))
        .route("/api/nodes/register", post(register_node))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:address", get(node_by_address))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:address", get(agent_by_address))
        .route("/api/epochs", get(list_epochs))
        .route("/api/epochs/:number", get(epoch_by_number))
        .route("/api/challenges", get(list_challenges))
        .route("/api/rewards/:address", get(rewards_for))
        .route("/api/formula", get(formula))
        .route("/api/stats", get(stats))
        .route("/api/v1/leaderboard", get(leaderboard))
        .route("/api/v1/proofs/:address", get(proofs_for))
        .route("/api/v1/proofs/:address/stats", get(proof_stats_for))
        .route("/api/v1/pipeline/register", post(register_pipeline))
        .route("/api/v1/pipeline/ready", post(pipeline_ready))
        .route("/api/v1/pipeline/topology", get(topology))
        .route("/pipeline", get(pipeline_ws))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "oracle API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| OracleError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "oracle": state.oracle.signer_address(),
        "epoch": state.oracle.current_epoch(),
    }))
}

async fn submit_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<TelemetryReport>,
) -> Result<Json<MetricsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key_ok = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|key| state.oracle.api_key_matches(Some(key)))
        .unwrap_or(false);
    let outcome = state
        .oracle
        .submit_metrics(&report, key_ok)
        .await
        .map_err(to_http_error)?;
    Ok(Json(MetricsResponse {
        success: true,
        should_reset: outcome.should_reset,
    }))
}

async fn register_node(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let node = state
        .oracle
        .register_node(&registration)
        .map_err(to_http_error)?;
    Ok(Json(json!({ "success": true, "node": node })))
}

async fn register_pipeline(
    State(state): State<AppState>,
    Json(registration): Json<PipelineRegistration>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    state
        .oracle
        .register_pipeline(&registration)
        .map_err(to_http_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn pipeline_ready(
    State(state): State<AppState>,
    Json(call): Json<ReadyCall>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    state.oracle.pipeline_ready(&call).map_err(to_http_error)?;
    Ok(Json(json!({ "success": true })))
}

async fn topology(
    State(state): State<AppState>,
    Query(query): Query<TopologyQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let assignments = state.oracle.topology(&query.model).map_err(to_http_error)?;
    Ok(Json(json!({
        "model": query.model,
        "assignments": assignments,
    })))
}

async fn list_nodes(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let nodes = state.oracle.nodes().map_err(to_http_error)?;
    Ok(Json(json!({ "nodes": nodes })))
}

async fn node_by_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.oracle.node(&address).map_err(to_http_error)? {
        Some(node) => Ok(Json(json!({ "node": node }))),
        None => Err(not_found("node")),
    }
}

async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let agents = state.oracle.agents().map_err(to_http_error)?;
    Ok(Json(json!({ "agents": agents })))
}

async fn agent_by_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.oracle.agent(&address).map_err(to_http_error)? {
        Some(agent) => Ok(Json(json!({ "agent": agent }))),
        None => Err(not_found("agent")),
    }
}

async fn list_epochs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let epochs = state.oracle.epochs().map_err(to_http_error)?;
    Ok(Json(json!({ "epochs": epochs })))
}

async fn epoch_by_number(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.oracle.epoch(number).map_err(to_http_error)? {
        Some(epoch) => Ok(Json(json!({ "epoch": epoch }))),
        None => Err(not_found("epoch")),
    }
}

async fn list_challenges(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let challenges = state.oracle.challenges().map_err(to_http_error)?;
    Ok(Json(json!({ "challenges": challenges })))
}

async fn rewards_for(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let pending = state
        .oracle
        .pending_reward(&address)
        .await
        .map_err(to_http_error)?;
    let contributions = state
        .oracle
        .contributions(&address)
        .map_err(to_http_error)?;
    Ok(Json(json!({
        "address": address,
        "pendingReward": pending.to_string(),
        "contributions": contributions,
    })))
}

async fn formula(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "formula": state.oracle.formula() }))
}

async fn stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let stats = state.oracle.stats().map_err(to_http_error)?;
    Ok(Json(json!({ "stats": stats })))
}

async fn leaderboard(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let scores = state.oracle.leaderboard().map_err(to_http_error)?;
    Ok(Json(json!({
        "epoch": state.oracle.current_epoch(),
        "leaderboard": scores,
    })))
}

async fn metrics_for(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let metrics = state.oracle.metrics(&address).map_err(to_http_error)?;
    Ok(Json(json!({
        "epoch": state.oracle.current_epoch(),
        "metrics": metrics,
    })))
}

async fn proofs_for(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let proofs = state.oracle.proofs(&address).map_err(to_http_error)?;
    Ok(Json(json!({ "proofs": proofs })))
}

async fn proof_stats_for(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    let stats = state.oracle.proof_stats(&address).map_err(to_http_error)?;
    Ok(Json(json!({ "stats": stats })))
}

/// Topology event stream for the request router. An optional `model` query
/// narrows the feed to one model.
async fn pipeline_ws(
    State(state): State<AppState>,
    Query(query): Query<PipelineWsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| pipeline_ws_loop(socket, state.oracle, query.model))
}

async fn pipeline_ws_loop(mut socket: WebSocket, oracle: OracleHandle, model: Option<String>) {
    let mut events = oracle.subscribe_topology();
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    // A lagged subscriber just misses intermediate states;
                    // the next event carries the current topology.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "pipeline websocket lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Some(model) = &model {
                    if event.model() != model {
                        continue;
                    }
                }
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

fn not_found(what: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found"),
        }),
    )
}

fn to_http_error(err: OracleError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        OracleError::Rejected(reason) if reason.is_auth() => StatusCode::UNAUTHORIZED,
        OracleError::Rejected(_) => StatusCode::BAD_REQUEST,
        OracleError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
