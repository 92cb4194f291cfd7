//! JSON RPC surface exposed by the node: chain queries, transaction
//! submission, consensus introspection, activation management and reward
//! claims, all served over a single axum router.
//!
//! Every handler returns `Result<Json<T>, ApiError>`; `ApiError` maps a
//! [`QNetError`] onto the `{error, message}` body shape and an HTTP status
//! derived from its `kind()`, so API clients can branch on the same seven
//! error kinds the node's internal components use.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use qnet_activation::{ActivationRegistry, BurnOracle};
use qnet_config::NodeConfig;
use qnet_consensus::RoundEngine;
use qnet_core::{address_from_string, Address, CryptoProvider, NodeId, QNetError, Transaction, TxHash};
use qnet_mempool::{MempoolLimits, ShardedMempool, TransactionRouter};
use qnet_reputation::ReputationLedger;
use qnet_rewards::LazyRewardLedger;
use qnet_storage::SledStore;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handles every handler reads from; cheap to clone (everything
/// inside is an `Arc`).
#[derive(Clone)]
pub struct RpcState {
    pub storage: Arc<SledStore>,
    pub round: Arc<RoundEngine>,
    pub reputation: Arc<ReputationLedger>,
    pub mempool: Arc<ShardedMempool>,
    pub router: Arc<TransactionRouter>,
    /// Shards this node serves; a light node's is empty, so it admits no
    /// submissions into its own mempool.
    pub shards: Vec<u32>,
    pub mempool_limits: MempoolLimits,
    pub activation: Arc<ActivationRegistry>,
    pub rewards: Arc<LazyRewardLedger>,
    pub config: Arc<NodeConfig>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub burn_oracle: Arc<dyn BurnOracle>,
    /// Leader elected per finalised height, recorded by the orchestrator
    /// after each `RoundEngine::finalise` call; the round engine itself
    /// only keeps the currently-open height's commits/reveals.
    pub leaders: Arc<RwLock<HashMap<u64, NodeId>>>,
}

impl RpcState {
    pub fn record_leader(&self, height: u64, leader: NodeId) {
        self.leaders.write().insert(height, leader);
    }
}

pub struct ApiError(QNetError);

impl From<QNetError> for ApiError {
    fn from(e: QNetError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QNetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            QNetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            QNetError::Conflict(_) => StatusCode::CONFLICT,
            QNetError::NotFound(_) => StatusCode::NOT_FOUND,
            QNetError::Stale(_) => StatusCode::GONE,
            QNetError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            QNetError::Partition(_) => StatusCode::SERVICE_UNAVAILABLE,
            QNetError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.message(),
        }));
        (status, body).into_response()
    }
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        // chain
        .route("/chain/status", get(get_status))
        .route("/chain/blocks", get(get_chain))
        .route("/chain/blocks/:height", get(get_block))
        .route("/chain/tx/:hash", get(get_tx))
        .route("/chain/address/:address/tx", get(get_address_tx))
        // submission
        .route("/tx", post(submit_transaction))
        // consensus
        .route("/consensus/commit", post(broadcast_commit))
        .route("/consensus/reveal", post(broadcast_reveal))
        .route("/consensus/stats", get(consensus_stats))
        .route("/consensus/reputation/:node", get(reputation))
        .route("/consensus/leader/:height", get(leader))
        // activation
        .route("/activation/request-token", post(request_activation_token))
        .route("/activation/submit", post(submit_activation))
        .route("/activation/transfer/initiate", post(initiate_transfer))
        .route("/activation/transfer/cancel", post(cancel_transfer))
        .route("/activation/health", get(health))
        .route("/activation/config", get(activation_config))
        // rewards
        .route("/rewards/proof/:node", get(get_proof))
        .route("/rewards/claim", post(claim))
        .route("/rewards/periods/:node", get(list_periods))
        .route("/rewards/status/:node", get(reward_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: RpcState) -> anyhow::Result<()> {
    let app = router(state);
    info!("RPC listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---- chain -----------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    height: u64,
    network_id: String,
    node_type: String,
}

async fn get_status(State(state): State<RpcState>) -> Result<Json<StatusResponse>, ApiError> {
    let height = state.storage.chain_tip_height()?;
    Ok(Json(StatusResponse {
        height,
        network_id: state.config.network.network_id.clone(),
        node_type: format!("{:?}", state.config.node.node_type).to_lowercase(),
    }))
}

#[derive(Deserialize)]
struct ChainQuery {
    start: Option<u64>,
    limit: Option<usize>,
}

async fn get_chain(
    State(state): State<RpcState>,
    Query(q): Query<ChainQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocks = state
        .storage
        .get_chain(q.start.unwrap_or(0), q.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::json!({ "blocks": blocks })))
}

async fn get_block(
    State(state): State<RpcState>,
    Path(height): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let block = state
        .storage
        .get_block_by_height(height)?
        .ok_or_else(|| QNetError::NotFound(format!("no block at height {height}")))?;
    Ok(Json(serde_json::json!({ "block": block })))
}

async fn get_tx(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hash = decode_hash(&hash)?;
    let tx = state
        .storage
        .get_transaction(&hash)?
        .ok_or_else(|| QNetError::NotFound("transaction not found".into()))?;
    Ok(Json(serde_json::json!({ "transaction": tx })))
}

#[derive(Deserialize)]
struct AddressTxQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn get_address_tx(
    State(state): State<RpcState>,
    Path(address): Path<String>,
    Query(q): Query<AddressTxQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let addr = decode_address(&address)?;
    let txs = state
        .storage
        .get_address_transactions(&addr, q.limit.unwrap_or(50).min(500), q.offset.unwrap_or(0))?;
    Ok(Json(serde_json::json!({ "transactions": txs })))
}

// ---- submission --------------------------------------------------------

#[derive(Deserialize)]
struct SubmitTxRequest {
    transaction: Transaction,
}

#[derive(Serialize)]
struct SubmitTxResponse {
    hash: String,
    routed_to: usize,
}

/// Structural validation, then shard/duplicate/cap admission into this
/// node's mempool; balance/nonce checks happen when the transaction is
/// actually included in a block by the orchestrator, which holds the
/// authoritative `ChainState`.
async fn submit_transaction(
    State(state): State<RpcState>,
    Json(req): Json<SubmitTxRequest>,
) -> Result<Json<SubmitTxResponse>, ApiError> {
    let tx = req.transaction;
    tx.validate_format(state.config.node.max_block_size_kb * 1024)?;
    let hash = state
        .mempool
        .admit(tx, &state.shards, &state.mempool_limits)?;
    let routed_to = state.router.route(&hash).len();
    Ok(Json(SubmitTxResponse {
        hash: hex::encode(hash),
        routed_to,
    }))
}

// ---- consensus --------------------------------------------------------

#[derive(Deserialize)]
struct CommitRequest {
    height: u64,
    node: NodeId,
    commit_hash: String,
    signature: String,
}

async fn broadcast_commit(
    State(state): State<RpcState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let commit_hash = decode_hash(&req.commit_hash)?;
    let signature = hex::decode(&req.signature)
        .map_err(|e| QNetError::InvalidInput(format!("bad signature hex: {e}")))?;
    state.round.add_commit(req.height, req.node, commit_hash, signature);
    Ok(Json(serde_json::json!({ "accepted": true })))
}

#[derive(Deserialize)]
struct RevealRequest {
    height: u64,
    node: NodeId,
    value: String,
}

async fn broadcast_reveal(
    State(state): State<RpcState>,
    Json(req): Json<RevealRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = hex::decode(&req.value).map_err(|e| QNetError::InvalidInput(format!("bad value hex: {e}")))?;
    let accepted = state.round.add_reveal(req.height, req.node, value, &state.reputation);
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

#[derive(Serialize)]
struct ConsensusStatsResponse {
    timer_multiplier: f64,
    mempool_size: usize,
    known_nodes: usize,
}

async fn consensus_stats(State(state): State<RpcState>) -> Json<ConsensusStatsResponse> {
    Json(ConsensusStatsResponse {
        timer_multiplier: state.round.timer_multiplier(),
        mempool_size: state.mempool.len(),
        known_nodes: state.reputation.all_reputations().len(),
    })
}

#[derive(Serialize)]
struct ReputationResponse {
    node: NodeId,
    reputation: f64,
}

async fn reputation(State(state): State<RpcState>, Path(node): Path<NodeId>) -> Json<ReputationResponse> {
    let score = state.reputation.reputation(&node);
    Json(ReputationResponse { node, reputation: score })
}

async fn leader(
    State(state): State<RpcState>,
    Path(height): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let leader = state
        .leaders
        .read()
        .get(&height)
        .cloned()
        .ok_or_else(|| QNetError::NotFound(format!("no finalised leader recorded for height {height}")))?;
    Ok(Json(serde_json::json!({ "height": height, "leader": leader })))
}

// ---- activation ---------------------------------------------------------

#[derive(Deserialize)]
struct ActivationTokenRequest {
    wallet: String,
    node_pubkey: String,
    node_type: String,
}

#[derive(Serialize)]
struct ActivationTokenResponse {
    message_to_sign: String,
    required_burn: u64,
}

/// Returns the canonical bytes the node must sign with its own key to prove
/// possession before `activate` is called elsewhere with the resulting
/// signature; this endpoint performs no state change.
async fn request_activation_token(
    State(_state): State<RpcState>,
    Json(req): Json<ActivationTokenRequest>,
) -> Result<Json<ActivationTokenResponse>, ApiError> {
    let wallet = decode_address(&req.wallet)?;
    let node_pubkey =
        hex::decode(&req.node_pubkey).map_err(|e| QNetError::InvalidInput(format!("bad node_pubkey hex: {e}")))?;
    let node_type = qnet_activation::NodeType::from_str(&req.node_type)
        .ok_or_else(|| QNetError::InvalidInput(format!("unknown node_type {}", req.node_type)))?;
    let message = qnet_activation::ActivationRecord::signing_message(&wallet, &node_pubkey, node_type);
    Ok(Json(ActivationTokenResponse {
        message_to_sign: hex::encode(message),
        required_burn: node_type.burn_amount(),
    }))
}

#[derive(Deserialize)]
struct SubmitActivationRequest {
    burn_tx_hash: String,
    wallet: String,
    node_pubkey: String,
    node_type: String,
    signature: String,
}

#[derive(Serialize)]
struct SubmitActivationResponse {
    hash: String,
}

/// Confirms the burn with the configured oracle, verifies the node's
/// possession signature, and queues the resulting `NODE_ACTIVATION`
/// transaction for inclusion in the next block the node builds.
async fn submit_activation(
    State(state): State<RpcState>,
    Json(req): Json<SubmitActivationRequest>,
) -> Result<Json<SubmitActivationResponse>, ApiError> {
    let wallet = decode_address(&req.wallet)?;
    let node_pubkey = hex::decode(&req.node_pubkey)
        .map_err(|e| QNetError::InvalidInput(format!("bad node_pubkey hex: {e}")))?;
    let node_type = qnet_activation::NodeType::from_str(&req.node_type)
        .ok_or_else(|| QNetError::InvalidInput(format!("unknown node_type {}", req.node_type)))?;
    let signature = hex::decode(&req.signature)
        .map_err(|e| QNetError::InvalidInput(format!("bad signature hex: {e}")))?;
    let height = state.storage.chain_tip_height()?;
    let tx = state
        .activation
        .activate(
            state.burn_oracle.as_ref(),
            state.crypto.as_ref(),
            req.burn_tx_hash,
            wallet,
            node_pubkey,
            node_type,
            &signature,
            height,
        )
        .await?;
    let hash = tx.hash();
    state.mempool.add_transaction(tx);
    Ok(Json(SubmitActivationResponse { hash: hex::encode(hash) }))
}

#[derive(Deserialize)]
struct InitiateTransferRequest {
    wallet: String,
}

async fn initiate_transfer(
    State(state): State<RpcState>,
    Json(req): Json<InitiateTransferRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let wallet = decode_address(&req.wallet)?;
    let code = state.activation.initiate_transfer(wallet)?;
    Ok(Json(serde_json::json!({ "transfer_code": code })))
}

#[derive(Deserialize)]
struct CancelTransferRequest {
    transfer_code: String,
}

async fn cancel_transfer(
    State(state): State<RpcState>,
    Json(req): Json<CancelTransferRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.activation.cancel_transfer(&req.transfer_code)?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_nodes: HashMap<&'static str, u64>,
}

async fn health(State(state): State<RpcState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_nodes: state.activation.active_counts(),
    })
}

#[derive(Serialize)]
struct ActivationConfigResponse {
    required_burn_light: u64,
    required_burn_full: u64,
    required_burn_super: u64,
    token_mint: String,
    burn_address: String,
}

async fn activation_config(State(state): State<RpcState>) -> Json<ActivationConfigResponse> {
    let a = &state.config.activation;
    Json(ActivationConfigResponse {
        required_burn_light: a.required_burn_light,
        required_burn_full: a.required_burn_full,
        required_burn_super: a.required_burn_super,
        token_mint: a.token_mint.clone(),
        burn_address: a.burn_address.clone(),
    })
}

// ---- rewards -------------------------------------------------------------

#[derive(Serialize)]
struct ProofResponse {
    node: NodeId,
    unclaimed: u64,
    total_earned: u64,
}

async fn get_proof(State(state): State<RpcState>, Path(node): Path<NodeId>) -> Json<ProofResponse> {
    Json(ProofResponse {
        unclaimed: state.rewards.unclaimed(&node),
        total_earned: state.rewards.total_earned(&node),
        node,
    })
}

#[derive(Deserialize)]
struct ClaimRequest {
    node: NodeId,
    wallet: String,
    nonce: u64,
}

async fn claim(
    State(state): State<RpcState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let wallet = decode_address(&req.wallet)?;
    let tx = state
        .rewards
        .claim_rewards(&req.node, wallet, req.nonce)
        .ok_or_else(|| QNetError::InvalidInput("no claimable balance".into()))?;
    let hash = tx.hash();
    state.mempool.add_transaction(tx);
    Ok(Json(serde_json::json!({ "hash": hex::encode(hash) })))
}

async fn list_periods(State(state): State<RpcState>, Path(node): Path<NodeId>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "periods": state.rewards.claim_history(&node) }))
}

#[derive(Serialize)]
struct RewardStatusResponse {
    node: NodeId,
    can_claim: bool,
    unclaimed: u64,
}

async fn reward_status(State(state): State<RpcState>, Path(node): Path<NodeId>) -> Json<RewardStatusResponse> {
    Json(RewardStatusResponse {
        can_claim: state.rewards.can_claim(&node),
        unclaimed: state.rewards.unclaimed(&node),
        node,
    })
}

// ---- shared decoding helpers --------------------------------------------

fn decode_address(s: &str) -> Result<Address, QNetError> {
    address_from_string(s).map_err(|e| QNetError::InvalidInput(format!("bad address: {e}")))
}

fn decode_hash(s: &str) -> Result<TxHash, QNetError> {
    let bytes = hex::decode(s).map_err(|e| QNetError::InvalidInput(format!("bad hash hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(QNetError::InvalidInput("hash must be 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use qnet_activation::NodeType;
    use qnet_config::NodeConfig;
    use tower::ServiceExt;

    struct NoopCrypto;

    #[async_trait::async_trait]
    impl CryptoProvider for NoopCrypto {
        fn address_from_public_key(&self, pk: &[u8]) -> anyhow::Result<Address> {
            Ok(blake3::hash(pk).into())
        }
        fn verify_signature(&self, _pk: &[u8], _msg: &[u8], sig: &[u8]) -> anyhow::Result<bool> {
            Ok(sig == b"valid")
        }
        fn sign_message(&self, _sk: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(msg.to_vec())
        }
    }

    struct AlwaysConfirms;

    #[async_trait::async_trait]
    impl BurnOracle for AlwaysConfirms {
        async fn verify_burn(
            &self,
            _burn_tx_hash: &str,
            _expected_wallet: Address,
            _expected_amount: u64,
            _node_type: NodeType,
        ) -> qnet_core::QNetResult<bool> {
            Ok(true)
        }
    }

    fn test_state() -> RpcState {
        RpcState {
            storage: Arc::new(SledStore::temporary().unwrap()),
            round: Arc::new(RoundEngine::new()),
            reputation: Arc::new(ReputationLedger::new("self".to_string())),
            mempool: Arc::new(ShardedMempool::new()),
            router: Arc::new(TransactionRouter::new()),
            shards: vec![0, 1, 2, 3],
            mempool_limits: MempoolLimits::default(),
            activation: Arc::new(ActivationRegistry::new()),
            rewards: Arc::new(LazyRewardLedger::new()),
            config: Arc::new(NodeConfig::example()),
            crypto: Arc::new(NoopCrypto),
            burn_oracle: Arc::new(AlwaysConfirms),
            leaders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn status_reports_genesis_height_when_empty() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/chain/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_block_returns_not_found() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/chain/blocks/9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submit_activation_queues_a_node_activation_transaction() {
        let state = test_state();
        let wallet = qnet_core::address_to_string(&[3u8; 32]);
        let body = serde_json::json!({
            "burn_tx_hash": "burn-1",
            "wallet": wallet,
            "node_pubkey": hex::encode([9u8; 4]),
            "node_type": "full",
            "signature": hex::encode(b"valid"),
        });
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activation/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn leader_lookup_uses_recorded_cache() {
        let state = test_state();
        state.record_leader(5, "node-a".to_string());
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/consensus/leader/5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
