//! REST API endpoints.
//!
//! Endpoints:
//! - GET /v1/status - Node status
//! - GET /v1/config - Current anchoring configuration
//! - GET /v1/address/actual - Current anchoring address
//! - GET /v1/chain/latest - Latest finalized anchor
//! - GET /v1/chain/nearest/{height} - First anchor covering a height
//! - GET /v1/funding - Unspent funding outputs
//! - GET /v1/proposal - In-flight proposal and signature progress

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use keel_anchor::{AnchorPoint, CycleState, Epoch, EpochId, FundingUtxo, ProposalStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::server::ApiState;

/// REST API error response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request or configuration.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Server-side failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The node has no anchoring configuration yet.
    #[error("service unavailable")]
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Status API
// ============================================================================

/// Node status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Server version.
    pub version: String,
    /// Server start time.
    pub started_at: DateTime<Utc>,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Anchoring cycle state.
    pub state: CycleState,
    /// Current epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<EpochId>,
    /// Last host block seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_block: Option<u64>,
    /// Chain tip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_anchor: Option<AnchorInfo>,
    /// Number of finalized anchors.
    pub anchors: usize,
    /// Spendable funding, in satoshis.
    pub available_funds: u64,
    /// Why the last build attempt stalled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stall: Option<String>,
    /// Why anchoring is halted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
}

/// Status API handlers.
pub struct StatusApi;

impl StatusApi {
    /// Create router for the status endpoint.
    pub fn router() -> Router<Arc<ApiState>> {
        Router::new().route("/v1/status", get(Self::get_status))
    }

    /// GET /v1/status - Node status.
    async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
        let status = state.with_node(|node| node.status());
        Json(StatusResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: state.started_at(),
            uptime_seconds: state.uptime().as_secs(),
            state: status.state,
            epoch: status.epoch,
            last_block: status.last_block,
            latest_anchor: status.latest_anchor.as_ref().map(AnchorInfo::from),
            anchors: status.anchors,
            available_funds: status.available_funds,
            last_stall: status.last_stall,
            halted: status.halted,
        })
    }
}

// ============================================================================
// Config API
// ============================================================================

/// One validator's public keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Ed25519 service key, hex.
    pub service_key: String,
    /// Compressed secp256k1 key, hex.
    pub bitcoin_key: String,
}

/// Anchoring configuration of an epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigInfo {
    /// Epoch id.
    pub epoch: EpochId,
    /// Host height the epoch took effect.
    pub activation_height: u64,
    /// Bitcoin network name.
    pub network: String,
    /// Bitcoin network magic.
    pub magic: u32,
    /// Host blocks between anchors.
    pub anchoring_interval: u64,
    /// Fee rate in sat/vB.
    pub transaction_fee: u64,
    /// Signatures needed per input.
    pub quorum: usize,
    /// Validator keys, in redeem-script order.
    pub keys: Vec<KeyInfo>,
    /// Anchoring address.
    pub address: String,
}

impl From<&Epoch> for ConfigInfo {
    fn from(epoch: &Epoch) -> Self {
        Self {
            epoch: epoch.id,
            activation_height: epoch.activation_height,
            network: epoch.config.network.to_network().to_string(),
            magic: epoch.config.network.magic(),
            anchoring_interval: epoch.config.anchoring_interval,
            transaction_fee: epoch.config.transaction_fee,
            quorum: epoch.key_set.quorum(),
            keys: epoch
                .config
                .anchoring_keys
                .iter()
                .map(|k| KeyInfo {
                    service_key: k.service_key.to_hex(),
                    bitcoin_key: k.bitcoin_key.to_string(),
                })
                .collect(),
            address: epoch.address.to_string(),
        }
    }
}

/// The address funds must be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Epoch owning the address.
    pub epoch: EpochId,
    /// P2WSH address.
    pub address: String,
    /// Output script, hex.
    pub script_pubkey: String,
    /// Witness script, hex.
    pub redeem_script: String,
}

impl From<&Epoch> for AddressInfo {
    fn from(epoch: &Epoch) -> Self {
        let redeem = epoch.key_set.redeem_script();
        Self {
            epoch: epoch.id,
            address: epoch.address.to_string(),
            script_pubkey: hex::encode(redeem.script_pubkey().as_bytes()),
            redeem_script: hex::encode(redeem.script().as_bytes()),
        }
    }
}

/// Config API handlers.
pub struct ConfigApi;

impl ConfigApi {
    /// Create router for configuration endpoints.
    pub fn router() -> Router<Arc<ApiState>> {
        Router::new()
            .route("/v1/config", get(Self::get_config))
            .route("/v1/address/actual", get(Self::get_actual_address))
    }

    /// GET /v1/config - Current anchoring configuration.
    async fn get_config(State(state): State<Arc<ApiState>>) -> Result<Json<ConfigInfo>, ApiError> {
        state
            .with_node(|node| node.configs().current_epoch().map(ConfigInfo::from))
            .map(Json)
            .ok_or(ApiError::Unavailable)
    }

    /// GET /v1/address/actual - Current anchoring address.
    async fn get_actual_address(
        State(state): State<Arc<ApiState>>,
    ) -> Result<Json<AddressInfo>, ApiError> {
        state
            .with_node(|node| node.configs().current_epoch().map(AddressInfo::from))
            .map(Json)
            .ok_or(ApiError::Unavailable)
    }
}

// ============================================================================
// Chain API
// ============================================================================

/// A finalized anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorInfo {
    /// Anchoring transaction id.
    pub txid: String,
    /// Index of the change output carrying the chain.
    pub output_index: u32,
    /// Anchored host height.
    pub height: u64,
    /// Anchored host block hash, hex.
    pub block_hash: String,
    /// Value of the change output, in satoshis.
    pub value: u64,
    /// Epoch whose address holds the change output.
    pub epoch: EpochId,
}

impl From<&AnchorPoint> for AnchorInfo {
    fn from(point: &AnchorPoint) -> Self {
        Self {
            txid: point.txid.to_string(),
            output_index: point.output_index,
            height: point.height,
            block_hash: point.block_hash.to_hex(),
            value: point.value,
            epoch: point.epoch,
        }
    }
}

/// Chain API handlers.
pub struct ChainApi;

impl ChainApi {
    /// Create router for anchor chain endpoints.
    pub fn router() -> Router<Arc<ApiState>> {
        Router::new()
            .route("/v1/chain/latest", get(Self::get_latest))
            .route("/v1/chain/nearest/{height}", get(Self::get_nearest))
    }

    /// GET /v1/chain/latest - Latest finalized anchor.
    async fn get_latest(State(state): State<Arc<ApiState>>) -> Result<Json<AnchorInfo>, ApiError> {
        state
            .with_node(|node| node.ledger().chain().latest().map(AnchorInfo::from))
            .map(Json)
            .ok_or_else(|| ApiError::NotFound("no anchors yet".to_string()))
    }

    /// GET /v1/chain/nearest/{height} - First anchor at or above `height`.
    async fn get_nearest(
        State(state): State<Arc<ApiState>>,
        Path(height): Path<u64>,
    ) -> Result<Json<AnchorInfo>, ApiError> {
        debug!(height, "Looking up nearest anchor");
        state
            .with_node(|node| node.ledger().chain().nearest(height).map(AnchorInfo::from))
            .map(Json)
            .ok_or_else(|| ApiError::NotFound(format!("no anchor covers height {}", height)))
    }
}

// ============================================================================
// Funding API
// ============================================================================

/// An unspent funding output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInfo {
    /// Funding transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Epoch whose address it pays.
    pub epoch: EpochId,
}

impl From<&FundingUtxo> for UtxoInfo {
    fn from(utxo: &FundingUtxo) -> Self {
        Self {
            txid: utxo.outpoint.txid.to_string(),
            vout: utxo.outpoint.vout,
            value: utxo.value,
            epoch: utxo.epoch,
        }
    }
}

/// Spendable funding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInfo {
    /// Sum of all outputs, in satoshis.
    pub total: u64,
    /// Outputs, largest first.
    pub outputs: Vec<UtxoInfo>,
}

/// Funding and proposal API handlers.
pub struct FundingApi;

impl FundingApi {
    /// Create router for funding and proposal endpoints.
    pub fn router() -> Router<Arc<ApiState>> {
        Router::new()
            .route("/v1/funding", get(Self::get_funding))
            .route("/v1/proposal", get(Self::get_proposal))
    }

    /// GET /v1/funding - Unspent funding outputs.
    async fn get_funding(State(state): State<Arc<ApiState>>) -> Json<FundingInfo> {
        Json(state.with_node(|node| {
            let pool = node.ledger().pool();
            FundingInfo {
                total: pool.total_value(),
                outputs: pool.candidates().iter().map(UtxoInfo::from).collect(),
            }
        }))
    }

    /// GET /v1/proposal - In-flight proposal.
    async fn get_proposal(
        State(state): State<Arc<ApiState>>,
    ) -> Result<Json<ProposalStatus>, ApiError> {
        state
            .with_node(|node| node.status().proposal)
            .map(Json)
            .ok_or_else(|| ApiError::NotFound("no proposal in flight".to_string()))
    }
}

/// Create the combined API router.
pub fn create_router() -> Router<Arc<ApiState>> {
    Router::new()
        .merge(StatusApi::router())
        .merge(ConfigApi::router())
        .merge(ChainApi::router())
        .merge(FundingApi::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ApiConfig, ApiServer};
    use axum::body::Body;
    use axum::http::Request;
    use keel_anchor::testing::{config_for, funding_tx, validator_keys};
    use keel_anchor::{AddFunds, AnchoringNode, NodeSettings};
    use parking_lot::Mutex;
    use tower::ServiceExt;

    fn funded_node(validators: usize) -> AnchoringNode {
        let keys = validator_keys(validators);
        let mut node = AnchoringNode::with_genesis(
            NodeSettings::default(),
            Some(keys[0].signer()),
            config_for(&keys, 10),
        )
        .unwrap();
        let address = node.configs().current_epoch().unwrap().address.clone();
        node.on_add_funds(&AddFunds::new(funding_tx(&address, 80_000, 1)), 6)
            .unwrap();
        node.on_add_funds(&AddFunds::new(funding_tx(&address, 20_000, 2)), 6)
            .unwrap();
        node
    }

    fn router(node: AnchoringNode) -> Router {
        ApiServer::new(ApiConfig::default(), Arc::new(Mutex::new(node)))
            .unwrap()
            .router()
            .unwrap()
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (
            status,
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
        )
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Unavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_status() {
        let (status, body) = get_json(router(funded_node(1)), "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["epoch"], 0);
        assert_eq!(body["anchors"], 0);
        assert_eq!(body["available_funds"], 100_000);
        assert!(body.get("halted").is_none());
    }

    #[tokio::test]
    async fn test_config_and_address() {
        let node = funded_node(3);
        let expected = node.configs().current_epoch().unwrap().address.to_string();
        let app = router(node);

        let (status, body) = get_json(app.clone(), "/v1/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["network"], "regtest");
        assert_eq!(body["magic"], 0xDAB5_BFFAu32);
        assert_eq!(body["quorum"], 2);
        assert_eq!(body["keys"].as_array().unwrap().len(), 3);
        assert_eq!(body["address"], expected);

        let (status, body) = get_json(app, "/v1/address/actual").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], expected);
        assert!(body["script_pubkey"].as_str().unwrap().starts_with("0020"));
    }

    #[tokio::test]
    async fn test_actual_address_switches_on_config_change() {
        let mut node = funded_node(2);
        let before = node.configs().current_epoch().unwrap().address.to_string();
        let rotated = config_for(&validator_keys(3), 10);
        let expected = rotated.address().unwrap().to_string();
        node.on_config_change(rotated, 4).unwrap();
        let app = router(node);

        let (status, body) = get_json(app.clone(), "/v1/address/actual").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], expected);
        assert_ne!(body["address"], before);

        // a committed config is active at once; nothing is ever pending
        let (status, _) = get_json(app, "/v1/address/following").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unconfigured_node_unavailable() {
        let observer = AnchoringNode::new(NodeSettings::default(), None).unwrap();
        let (status, body) = get_json(router(observer), "/v1/config").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 503);
    }

    #[tokio::test]
    async fn test_chain_after_anchor() {
        let mut node = funded_node(1);
        let (_, empty) = get_json(router(funded_node(1)), "/v1/chain/latest").await;
        assert_eq!(empty["code"], 404);

        let effects = node.on_block(10, keel_core::hash(b"block 10")).unwrap();
        let txid = effects.finalized[0].txid;
        let app = router(node);

        let (status, body) = get_json(app.clone(), "/v1/chain/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["txid"], txid.to_string());
        assert_eq!(body["height"], 10);
        assert_eq!(body["output_index"], 0);
        assert_eq!(body["block_hash"], keel_core::hash(b"block 10").to_hex());

        let (status, body) = get_json(app.clone(), "/v1/chain/nearest/4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["height"], 10);

        let (status, _) = get_json(app.clone(), "/v1/chain/nearest/11").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app, "/v1/chain/nearest/tip").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_funding_largest_first() {
        let (status, body) = get_json(router(funded_node(1)), "/v1/funding").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 100_000);
        let outputs = body["outputs"].as_array().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0]["value"], 80_000);
        assert_eq!(outputs[1]["value"], 20_000);
    }

    #[tokio::test]
    async fn test_proposal_progress() {
        let mut node = funded_node(3);
        let (status, _) = get_json(router(funded_node(3)), "/v1/proposal").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        node.on_block(10, keel_core::hash(b"block 10")).unwrap();
        let txid = node.active().unwrap().proposal.txid();

        let (status, body) = get_json(router(node), "/v1/proposal").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["txid"], txid.to_string());
        assert_eq!(body["height"], 10);
        assert_eq!(body["inputs"][0]["have"], 1);
        assert_eq!(body["inputs"][0]["need"], 2);
    }
}
