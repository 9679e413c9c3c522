//! HTTP API for the dispenser

use crate::credential::{Action, Credential, CredentialVerifier};
use crate::database::DistributionRecord;
use crate::dispenser::{Dispensed, Dispenser, FaucetStatus};
use crate::error::{FaucetError, FaucetResult};
use crate::identity::CallContext;
use crate::metrics::FaucetMetrics;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use drip_common::types::{amount_string, Address, Amount, Timestamp};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

type RateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-client-IP request quota, one limiter per address kept in a bounded cache.
pub struct ClientThrottle {
    quota: Quota,
    clock: DefaultClock,
    limiters: moka::future::Cache<IpAddr, Arc<RateLimiterImpl>>,
}

impl ClientThrottle {
    /// Allows `max_requests` per `window`, refilling one slot every `window / max_requests`.
    pub fn new(max_requests: u32, window: Duration) -> FaucetResult<Self> {
        let burst = NonZeroU32::new(max_requests)
            .ok_or_else(|| FaucetError::ConfigError("max_requests_per_window must be non-zero".to_string()))?;
        let quota = Quota::with_period(window / max_requests)
            .ok_or_else(|| FaucetError::ConfigError("rate limit window too short".to_string()))?
            .allow_burst(burst);

        Ok(Self {
            quota,
            clock: DefaultClock::default(),
            limiters: moka::future::Cache::new(10_000), // Cache 10k IPs
        })
    }

    pub async fn check(&self, ip: IpAddr) -> FaucetResult<()> {
        let quota = self.quota;
        let limiter = self
            .limiters
            .get_with(ip, async move { Arc::new(RateLimiter::direct(quota)) })
            .await;

        limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            warn!("IP rate limit exceeded: {}", ip);
            FaucetError::RateLimitExceeded(wait.as_secs().max(1))
        })
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispenser: Arc<Dispenser>,
    pub verifier: Arc<CredentialVerifier>,
    pub throttle: Arc<ClientThrottle>,
    pub metrics: Option<Arc<FaucetMetrics>>,
}

impl AppState {
    fn authenticate(&self, credential: &Credential, action: Action, payload: &str) -> FaucetResult<CallContext> {
        self.verifier
            .verify(credential, action, payload, self.dispenser.now())
    }
}

/// Body of every mutating request without parameters
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedRequest {
    pub credential: Credential,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub credential: Credential,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OwnershipRequest {
    pub new_owner: Address,
    pub credential: Credential,
}

/// Success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub data: T,
    pub timestamp: String,
}

impl<T> SuccessResponse<T> {
    fn new(data: T) -> Json<Self> {
        Json(Self {
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RequestHistory {
    pub address: Address,
    pub last_request_at: Timestamp,
    pub next_eligible_at: Option<Timestamp>,
    pub distributions: Vec<DistributionRecord>,
}

#[derive(Debug, Serialize)]
pub struct AdminAck {
    pub action: Action,
    pub caller: Address,
}

fn log_failure<T>(operation: &str, result: FaucetResult<T>) -> FaucetResult<T> {
    if let Err(e) = &result {
        if e.status_code().is_server_error() {
            error!("{} failed: {}", operation, e);
        } else {
            info!("{} refused: {}", operation, e);
        }
    }
    result
}

/// Token request handler
pub async fn get_tokens_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<SignedRequest>,
) -> FaucetResult<Json<SuccessResponse<Dispensed>>> {
    let result = async {
        state.throttle.check(addr.ip()).await?;
        let ctx = state.authenticate(&request.credential, Action::GetTokens, "")?;
        info!("Token request from {}: caller={}", addr, ctx.caller);
        state.dispenser.get_tokens(&ctx).await
    }
    .await;

    log_failure("get_tokens", result).map(SuccessResponse::new)
}

pub async fn pause_handler(
    State(state): State<AppState>,
    Json(request): Json<SignedRequest>,
) -> FaucetResult<Json<SuccessResponse<AdminAck>>> {
    let result = async {
        let ctx = state.authenticate(&request.credential, Action::Pause, "")?;
        state.dispenser.pause(&ctx).await?;
        Ok::<_, FaucetError>(AdminAck {
            action: Action::Pause,
            caller: ctx.caller,
        })
    }
    .await;

    log_failure("pause", result).map(SuccessResponse::new)
}

pub async fn unpause_handler(
    State(state): State<AppState>,
    Json(request): Json<SignedRequest>,
) -> FaucetResult<Json<SuccessResponse<AdminAck>>> {
    let result = async {
        let ctx = state.authenticate(&request.credential, Action::Unpause, "")?;
        state.dispenser.unpause(&ctx).await?;
        Ok::<_, FaucetError>(AdminAck {
            action: Action::Unpause,
            caller: ctx.caller,
        })
    }
    .await;

    log_failure("unpause", result).map(SuccessResponse::new)
}

/// Deposit handler; the signed payload is the decimal amount.
pub async fn deposit_handler(
    State(state): State<AppState>,
    Json(request): Json<DepositRequest>,
) -> FaucetResult<Json<SuccessResponse<AdminAck>>> {
    let result = async {
        let payload = request.amount.to_string();
        let ctx = state.authenticate(&request.credential, Action::Deposit, &payload)?;
        state.dispenser.deposit(&ctx, request.amount).await?;
        Ok::<_, FaucetError>(AdminAck {
            action: Action::Deposit,
            caller: ctx.caller,
        })
    }
    .await;

    log_failure("deposit", result).map(SuccessResponse::new)
}

/// Ownership transfer handler; the signed payload is the new owner's hex address.
pub async fn transfer_ownership_handler(
    State(state): State<AppState>,
    Json(request): Json<OwnershipRequest>,
) -> FaucetResult<Json<SuccessResponse<AdminAck>>> {
    let result = async {
        let payload = request.new_owner.to_hex();
        let ctx = state.authenticate(&request.credential, Action::TransferOwnership, &payload)?;
        state.dispenser.transfer_ownership(&ctx, request.new_owner).await?;
        Ok::<_, FaucetError>(AdminAck {
            action: Action::TransferOwnership,
            caller: ctx.caller,
        })
    }
    .await;

    log_failure("transfer_ownership", result).map(SuccessResponse::new)
}

pub async fn renounce_ownership_handler(
    State(state): State<AppState>,
    Json(request): Json<SignedRequest>,
) -> FaucetResult<Json<SuccessResponse<AdminAck>>> {
    let result = async {
        let ctx = state.authenticate(&request.credential, Action::RenounceOwnership, "")?;
        state.dispenser.renounce_ownership(&ctx).await?;
        Ok::<_, FaucetError>(AdminAck {
            action: Action::RenounceOwnership,
            caller: ctx.caller,
        })
    }
    .await;

    log_failure("renounce_ownership", result).map(SuccessResponse::new)
}

/// Status handler
pub async fn status_handler(
    State(state): State<AppState>,
) -> FaucetResult<Json<SuccessResponse<FaucetStatus>>> {
    let status = log_failure("status", state.dispenser.status().await)?;
    Ok(SuccessResponse::new(status))
}

/// Request history for one address
pub async fn requests_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> FaucetResult<Json<SuccessResponse<RequestHistory>>> {
    let address: Address = address
        .parse()
        .map_err(|e| FaucetError::InvalidAddress(format!("{}: {}", address, e)))?;

    let history = RequestHistory {
        address,
        last_request_at: state.dispenser.last_request_at(&address).await?,
        next_eligible_at: state.dispenser.next_eligible_at(&address).await?,
        distributions: state.dispenser.distributions_for(&address).await?,
    };
    Ok(SuccessResponse::new(history))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled".to_string()).into_response();
    };
    match metrics.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            FaucetError::InternalError(e.to_string()).into_response()
        }
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Root handler with info
pub async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Drip Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Rate-limited, pausable token dispenser",
        "faucet": state.dispenser.address(),
        "asset": state.dispenser.faucet_token(),
        "max_tokens": state.dispenser.max_tokens().to_string(),
        "interval": state.dispenser.interval(),
        "endpoints": {
            "POST /api/tokens": "Request tokens",
            "GET /api/status": "Get faucet status",
            "GET /api/requests/:address": "Request history for an address",
            "POST /api/admin/pause": "Pause dispensing (owner)",
            "POST /api/admin/unpause": "Resume dispensing (owner)",
            "POST /api/admin/deposit": "Add inventory (owner)",
            "POST /api/admin/ownership": "Transfer ownership (owner)",
            "POST /api/admin/ownership/renounce": "Renounce ownership (owner)",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/requests/:address", get(requests_handler))
        .route("/api/tokens", post(get_tokens_handler))
        .route("/api/admin/pause", post(pause_handler))
        .route("/api/admin/unpause", post(unpause_handler))
        .route("/api/admin/deposit", post(deposit_handler))
        .route("/api/admin/ownership", post(transfer_ownership_handler))
        .route("/api/admin/ownership/renounce", post(renounce_ownership_handler))
        .with_state(state)
}
