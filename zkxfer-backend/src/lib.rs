//! zkxfer-backend library
//!
//! Axum host for the zkxfer protocol engine.
//!
//! The engine is single-writer. Every mutating route takes the engine's write
//! lock on a blocking thread, so oracle calls (including the blocking HTTP
//! proof oracle) never run on an async worker and never interleave with
//! another mutation or a query. Queries share the read lock.
//!
//! Callers identify themselves with a `caller` field; authenticating that
//! identity is the deployment's concern.

pub mod config;
pub mod oracle;

use std::sync::{Arc, RwLock, RwLockReadGuard};

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ethers_core::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use zkxfer_common::{hex_bytes, StageTag, FRIENDS_MERKLE_DEPTH, MAX_FRIENDS, MERKLE_DEPTH};
use zkxfer_core::{
    Blake3Compression, InMemoryLedger, LoggedNotification, ProofOracle, ProtocolEngine,
    ProtocolError, SkipProofOracle,
};

use crate::{
    config::{ProofMode, ServiceConfig},
    oracle::HttpProofOracle,
};

pub const SERVICE_NAME: &str = "zkxfer-backend";

const CODE_INVALID_INVITATIONS: &str = "INVALID_INVITATIONS";
const CODE_INTERNAL: &str = "INTERNAL_ERROR";

pub type Engine = ProtocolEngine<Arc<dyn ProofOracle>, Arc<InMemoryLedger>, Blake3Compression>;

/// Application state
#[derive(Clone)]
pub struct AppState {
    engine: Arc<RwLock<Engine>>,
    ledger: Arc<InMemoryLedger>,
    skip_proofs: bool,
}

impl AppState {
    pub fn new(proof_oracle: Arc<dyn ProofOracle>, skip_proofs: bool) -> anyhow::Result<Self> {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = ProtocolEngine::new(proof_oracle, Arc::clone(&ledger), Blake3Compression)?;
        Ok(Self {
            engine: Arc::new(RwLock::new(engine)),
            ledger,
            skip_proofs,
        })
    }

    /// Build state with the proof oracle the configuration selects.
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        match &config.proof_mode {
            ProofMode::Skip => Self::new(Arc::new(SkipProofOracle::enabled()), true),
            ProofMode::Remote { url, timeout } => {
                tracing::info!(%url, ?timeout, "using remote proof oracle");
                Self::new(Arc::new(HttpProofOracle::new(url.clone(), *timeout)?), false)
            }
        }
    }

    pub fn ledger(&self) -> &Arc<InMemoryLedger> {
        &self.ledger
    }

    fn read(&self) -> RwLockReadGuard<'_, Engine> {
        self.engine.read().expect("engine lock poisoned")
    }

    /// Run a mutation under the write lock on a blocking thread.
    async fn mutate<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Engine) -> Result<T, ProtocolError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut engine = engine.write().expect("engine lock poisoned");
            op(&mut engine)
        })
        .await
        .map_err(|err| ApiError::internal(format!("engine task failed: {err}")))?;
        outcome.map_err(ApiError::from)
    }
}

/// Build the router.
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/commit", post(commit))
        .route("/invalidate", post(invalidate))
        .route("/pre-transfer", post(pre_transfer))
        .route("/verification", post(verification))
        .route("/preparation", post(preparation))
        .route("/transfer", post(transfer))
        .route("/dummy", post(dummy))
        .route("/commits/:index", get(get_commit))
        .route("/pre-transfers/:index", get(get_pre_transfer))
        .route("/verifications/:index", get(get_verification))
        .route("/verifications/:index/proof", get(get_inclusion_proof))
        .route("/roots", get(roots))
        .route("/notifications", get(notifications))
        .route("/ledger/deposit", post(deposit))
        .route("/ledger/:identity", get(balance))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Service endpoints
// ============================================================================

/// Health check endpoint.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME
    }))
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.read();
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "max_friends": MAX_FRIENDS,
        "merkle_depth": MERKLE_DEPTH,
        "friends_merkle_depth": FRIENDS_MERKLE_DEPTH,
        "stage_tags": StageTag::ALL
            .iter()
            .map(|tag| serde_json::json!({ "name": tag.to_string(), "value": tag.as_u64() }))
            .collect::<Vec<_>>(),
        "skip_proofs": state.skip_proofs,
        "commit_count": engine.commit_count(),
        "pre_transfer_count": engine.pre_transfer_count(),
        "verification_count": engine.verification_count(),
        "current_root": engine.current_root(),
        "sequence": engine.sequence(),
    }))
}

// ============================================================================
// Protocol operations
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub commitment_root: H256,
    pub limit: U256,
    pub nonce: H256,
    pub owner: Address,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub commit_index: u64,
}

async fn commit(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<CommitResponse>, ApiError> {
    let commit_index = state
        .mutate(move |engine| {
            Ok(engine.commit(req.commitment_root, req.limit, req.nonce, req.owner, req.notes))
        })
        .await?;
    Ok(Json(CommitResponse { commit_index }))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub commit_index: u64,
    pub caller: Address,
}

async fn invalidate(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let commit_index = req.commit_index;
    state
        .mutate(move |engine| engine.invalidate(req.commit_index, req.caller))
        .await?;
    Ok(Json(serde_json::json!({
        "commit_index": commit_index,
        "invalidated": true
    })))
}

#[derive(Debug, Deserialize)]
pub struct PreTransferRequest {
    pub commit_index: u64,
    pub commitment_root_t: H256,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
    /// Exactly `MAX_FRIENDS` payloads; empty ones are allowed.
    #[serde(with = "hex_bytes::vec")]
    pub invitations: Vec<Vec<u8>>,
    pub caller: Address,
}

#[derive(Debug, Serialize)]
pub struct PreTransferResponse {
    pub pre_transfer_index: u64,
}

async fn pre_transfer(
    State(state): State<AppState>,
    Json(req): Json<PreTransferRequest>,
) -> Result<Json<PreTransferResponse>, ApiError> {
    let count = req.invitations.len();
    let invitations: [Vec<u8>; MAX_FRIENDS] = req.invitations.try_into().map_err(|_| {
        ApiError::bad_request(
            CODE_INVALID_INVITATIONS,
            format!("expected {MAX_FRIENDS} invitations, got {count}"),
        )
    })?;

    let pre_transfer_index = state
        .mutate(move |engine| {
            engine.pre_transfer(
                req.commit_index,
                req.commitment_root_t,
                &req.proof,
                invitations,
                req.caller,
            )
        })
        .await?;
    Ok(Json(PreTransferResponse { pre_transfer_index }))
}

#[derive(Debug, Deserialize)]
pub struct VerificationRequest {
    pub verification_digest: H256,
    pub pre_transfer_commitment: H256,
    pub nonce: H256,
    #[serde(default, with = "hex_bytes")]
    pub receipt: Vec<u8>,
    pub caller: Address,
}

#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    pub verification_index: u64,
    pub root: H256,
}

async fn verification(
    State(state): State<AppState>,
    Json(req): Json<VerificationRequest>,
) -> Result<Json<VerificationResponse>, ApiError> {
    let (verification_index, root) = state
        .mutate(move |engine| {
            let index = engine.verification(
                req.verification_digest,
                req.pre_transfer_commitment,
                req.nonce,
                req.receipt,
                req.caller,
            )?;
            Ok((index, engine.current_root()))
        })
        .await?;
    Ok(Json(VerificationResponse {
        verification_index,
        root,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PreparationRequest {
    pub pre_transfer_index: u64,
    pub friend_index: u64,
    pub verification_root: H256,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
    pub caller: Address,
}

#[derive(Debug, Serialize)]
pub struct PreparationResponse {
    pub pre_transfer_index: u64,
    pub verified_friends: Vec<usize>,
}

async fn preparation(
    State(state): State<AppState>,
    Json(req): Json<PreparationRequest>,
) -> Result<Json<PreparationResponse>, ApiError> {
    let pre_transfer_index = req.pre_transfer_index;
    let verified_friends = state
        .mutate(move |engine| {
            engine.preparation(
                req.pre_transfer_index,
                req.friend_index,
                req.verification_root,
                &req.proof,
                req.caller,
            )?;
            engine.verified_friends(req.pre_transfer_index)
        })
        .await?;
    Ok(Json(PreparationResponse {
        pre_transfer_index,
        verified_friends,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub pre_transfer_index: u64,
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
    pub caller: Address,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub amount: U256,
}

async fn transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, ApiError> {
    let amount = state
        .mutate(move |engine| engine.transfer(req.pre_transfer_index, &req.proof, req.caller))
        .await?;
    Ok(Json(TransferResponse { amount }))
}

async fn dummy(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sequence = state.mutate(|engine| Ok(engine.dummy())).await?;
    Ok(Json(serde_json::json!({ "sequence": sequence })))
}

// ============================================================================
// Queries
// ============================================================================

async fn get_commit(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.read();
    let record = engine.commit_record(index)?;
    Ok(Json(serde_json::json!({
        "index": index,
        "record": record,
        "used": engine.commit_is_used(index),
    })))
}

async fn get_pre_transfer(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.read();
    let record = engine.pre_transfer_record(index)?;
    Ok(Json(serde_json::json!({
        "index": index,
        "record": record,
        "verified_friends": record.verified.indices(),
    })))
}

async fn get_verification(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.read();
    let record = engine.verification_record(index)?;
    Ok(Json(serde_json::json!({
        "index": index,
        "record": record,
    })))
}

async fn get_inclusion_proof(
    State(state): State<AppState>,
    Path(index): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let proof = state.read().inclusion_proof(index)?;
    Ok(Json(proof))
}

async fn roots(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.read();
    Json(serde_json::json!({
        "current_root": engine.current_root(),
        "history": engine.root_history(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Debug, Serialize)]
pub struct NotificationsResponse {
    pub next_cursor: u64,
    pub notifications: Vec<LoggedNotification>,
}

async fn notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
) -> Json<NotificationsResponse> {
    let engine = state.read();
    let notifications = engine.notifications_since(query.since).to_vec();
    let next_cursor = notifications
        .last()
        .map(|n| n.cursor + 1)
        .unwrap_or(query.since);
    Json(NotificationsResponse {
        next_cursor,
        notifications,
    })
}

// ============================================================================
// Escrow ledger
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub identity: Address,
    pub amount: U256,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub identity: Address,
    pub balance: U256,
}

async fn deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state
        .ledger
        .deposit(req.identity, req.amount)
        .map_err(|err| ApiError::bad_request("DEPOSIT_REJECTED", err.to_string()))?;
    tracing::info!(identity = ?req.identity, amount = %req.amount, %balance, "escrow deposit");
    Ok(Json(BalanceResponse {
        identity: req.identity,
        balance,
    }))
}

async fn balance(
    State(state): State<AppState>,
    Path(identity): Path<Address>,
) -> Json<BalanceResponse> {
    Json(BalanceResponse {
        identity,
        balance: state.ledger.balance_of(&identity),
    })
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    error_code: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL, message)
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        let status = StatusCode::from_u16(err.suggested_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        warn!(code = err.error_code(), %status, "{err}");
        Self::new(status, err.error_code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            error_code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
