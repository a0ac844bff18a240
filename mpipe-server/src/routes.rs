//! Route handlers and router assembly

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mpipe_broker::{
    Broker, ClusterReport, DeadLetterRecord, HeartbeatRequest, HeartbeatResponse, Message,
    RegisterRequest, RegisterResponse, RpcStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, ApiResult};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            started_at: Instant::now(),
        }
    }
}

/// Build the router; `max_concurrency` bounds in-flight requests
pub fn router(state: AppState, max_concurrency: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/pipes/{name}", get(pipe_status))
        .route("/pipes/{name}/messages", post(produce))
        .route(
            "/pipes/{name}/dead-letters",
            get(list_dead_letters).delete(clear_dead_letters),
        )
        .route("/metrics/report", get(metrics_report))
        .layer(ConcurrencyLimitLayer::new(max_concurrency.max(1)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pipes: usize,
    pub clients: usize,
    pub store: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_up = !state.broker.store().is_shutdown();
    Json(HealthResponse {
        status: if store_up { "healthy" } else { "degraded" }.to_string(),
        service: "mpipe-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        pipes: state.broker.manager().len(),
        clients: state.broker.registry().len(),
        store: if store_up { "up" } else { "down" }.to_string(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterResponse>) {
    let response = state
        .broker
        .register(&request.address, request.port, &request.pipe_names)
        .await;
    if let Some(client_id) = &response.client_id {
        info!(client = %client_id, pipe_names = %request.pipe_names, "Consumer registered");
    }
    (rpc_status_code(response.status), Json(response))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> (StatusCode, Json<HeartbeatResponse>) {
    let response = state
        .broker
        .heartbeat(&request.address, request.port)
        .await;
    (rpc_status_code(response.status), Json(response))
}

fn rpc_status_code(status: RpcStatus) -> StatusCode {
    match status {
        RpcStatus::Ok => StatusCode::OK,
        RpcStatus::Rejected => StatusCode::BAD_REQUEST,
    }
}

/// One message as sent by a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedMessage {
    #[serde(default)]
    pub id: Option<String>,
    /// UTF-8 payload
    pub payload: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl From<ProducedMessage> for Message {
    fn from(produced: ProducedMessage) -> Self {
        let mut message = match produced.id {
            Some(id) => Message::with_id(id, produced.payload),
            None => Message::new(produced.payload),
        };
        message.headers = produced.headers;
        message
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub messages: Vec<ProducedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub pipe: String,
    pub accepted: usize,
    pub rejected: usize,
}

async fn produce(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ProduceRequest>,
) -> ApiResult<Response> {
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest("no messages given".to_string()));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for produced in request.messages {
        if state.broker.put(&name, produced.into()).await? {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }

    let status = if rejected == 0 {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ProduceResponse {
        pipe: name,
        accepted,
        rejected,
    };
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeStatus {
    pub name: String,
    pub size: usize,
    pub dead_letters: usize,
}

async fn pipe_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipeStatus>> {
    let size = state
        .broker
        .pipe_size(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("pipe '{}' is excluded", name)))?;
    let dead_letters = state.broker.dead_letter_count(&name).await?;
    Ok(Json(PipeStatus {
        name,
        size,
        dead_letters,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetterRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    Ok(Json(state.broker.dead_letters_of(&name, limit).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub pipe: String,
    pub cleared: bool,
}

async fn clear_dead_letters(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ClearResponse>> {
    let cleared = state.broker.clear_dead_letters(&name).await?;
    Ok(Json(ClearResponse {
        pipe: name,
        cleared,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub format: Option<String>,
}

async fn metrics_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let report: ClusterReport = state.broker.report().await;
    match query.format.as_deref() {
        Some("text") => report.to_string().into_response(),
        _ => Json(report).into_response(),
    }
}
