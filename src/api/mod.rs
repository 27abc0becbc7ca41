//! Axum HTTP surface for the sync engine.
//!
//! Provides:
//!   GET  /health                    → liveness
//!   POST /api/contracts/sync        → re-read one instance now
//!   POST /api/contracts             → register an instance with its deployment config
//!   GET  /api/contracts?user=0x…    → instances a user takes part in
//!   GET  /api/contracts/:address    → instance + participants
//!   GET  /api/templates             → template registry
//!   GET  /api/templates/:id         → one template
//!   GET  /api/metrics               → sync counters + listener state
//!   POST /api/reconcile             → run a full sweep now

use crate::onchain::{ChainError, DeploymentEvent, DeploymentExtra, ListenerState};
use crate::store::{ContractInstance, DeploymentConfig, Participant, StoreError};
use crate::sync::{ReconcileTrigger, SyncContext, SyncError};
use crate::templates::TemplateId;

use alloy::primitives::{Address, B256};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<SyncContext>,
    pub reconcile: ReconcileTrigger,
    pub listener: Option<watch::Receiver<ListenerState>>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("blockchain error: {0}")]
    Chain(ChainError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Chain(e) => ApiError::Chain(e),
            SyncError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(address) => {
                ApiError::NotFound(format!("contract {address} not found"))
            }
            StoreError::TemplateConflict { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Chain(_) => (StatusCode::BAD_GATEWAY, "blockchain_error"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": kind, "message": self.to_string() }))).into_response()
    }
}

/// Build the Axum router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/contracts", get(list_contracts).post(register_contract))
        .route("/api/contracts/sync", post(sync_contract))
        .route("/api/contracts/:address", get(get_contract))
        .route("/api/templates", get(list_templates))
        .route("/api/templates/:id", get(get_template))
        .route("/api/metrics", get(metrics))
        .route("/api/reconcile", post(reconcile))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` is cancelled.
pub async fn serve(state: ApiState, bind_addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn parse_address(raw: Option<&str>, field: &str) -> Result<Address, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("{field} is required")))?;
    Address::from_str(raw).map_err(|_| ApiError::Validation(format!("{field} is not a valid address")))
}

// --- Contracts ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    contract_address: Option<String>,
}

#[derive(Debug, Serialize)]
struct ContractResponse {
    contract: ContractInstance,
}

async fn sync_contract(
    State(state): State<ApiState>,
    Json(body): Json<SyncRequest>,
) -> Result<Json<ContractResponse>, ApiError> {
    let address = parse_address(body.contract_address.as_deref(), "contractAddress")?;
    let contract = state.ctx.sync_instance(address).await?;
    info!(address = %address, "manual sync complete");
    Ok(Json(ContractResponse { contract }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    #[serde(default)]
    contract_address: Option<String>,
    #[serde(default)]
    template_id: Option<String>,
    #[serde(default)]
    creator_address: Option<String>,
    #[serde(default)]
    deployment_block: u64,
    #[serde(default)]
    transaction_hash: B256,
    #[serde(default)]
    config: DeploymentConfig,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    contract: ContractInstance,
    participants: Vec<Participant>,
    synced: bool,
}

async fn register_contract(
    State(state): State<ApiState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let address = parse_address(body.contract_address.as_deref(), "contractAddress")?;
    let creator = parse_address(body.creator_address.as_deref(), "creatorAddress")?;
    let template = body
        .template_id
        .as_deref()
        .ok_or_else(|| ApiError::Validation("templateId is required".into()))?
        .parse::<TemplateId>()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let mut config = body.config;
    config.creator.get_or_insert(creator);
    if !config.share_bps.is_empty() && config.share_total() != 10_000 {
        warn!(address = %address, total = config.share_total(), "shareBps do not sum to 10000");
    }

    let event = DeploymentEvent {
        template,
        creator,
        instance: address,
        block_number: body.deployment_block,
        transaction_hash: body.transaction_hash,
        log_index: 0,
        extra: DeploymentExtra::None,
    };
    let registered = state.ctx.register(&event, &config).await?;

    let (contract, synced) = match state.ctx.sync_instance(address).await {
        Ok(instance) => (instance, true),
        Err(e) => {
            warn!(address = %address, error = %e, "eager sync after registration failed");
            (registered, false)
        }
    };
    let participants = state.ctx.store().participants(address).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            contract,
            participants,
            synced,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct ContractDetail {
    contract: ContractInstance,
    lifecycle: &'static str,
    participants: Vec<Participant>,
}

async fn get_contract(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Json<ContractDetail>, ApiError> {
    let address = parse_address(Some(&raw), "address")?;
    let store = state.ctx.store();
    let contract = store
        .get_instance(address)
        .await?
        .ok_or(StoreError::NotFound(address))?;
    let participants = store.participants(address).await?;
    Ok(Json(ContractDetail {
        lifecycle: contract.lifecycle_label(),
        contract,
        participants,
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user: Option<String>,
}

async fn list_contracts(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContractInstance>>, ApiError> {
    let user = parse_address(query.user.as_deref(), "user")?;
    Ok(Json(state.ctx.store().instances_for_user(user).await?))
}

// --- Registry & operations ---

async fn list_templates() -> impl IntoResponse {
    Json(TemplateId::all().collect::<Vec<_>>())
}

async fn get_template(Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let template = id
        .parse::<TemplateId>()
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(template.descriptor()))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let listener = state.listener.as_ref().map(|rx| *rx.borrow());
    Json(json!({
        "counters": state.ctx.metrics().snapshot(),
        "listener": listener,
        "reconcileRunning": state.reconcile.is_running(),
    }))
}

async fn reconcile(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    match state.reconcile.run_now().await {
        None => Err(ApiError::Conflict("a reconciliation sweep is already running".into())),
        Some(report) => Ok(Json(report?)),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
