//! HTTP surface: the read-only views plus the owner's admin controls.
//!
//! All mutation of game state happens through the engine's Rust API; this
//! router only exposes derived views and the guarded administrative
//! remediations (pause, retry, sweep, fee withdrawal).

use crate::config::ApiConfig;
use crate::engine::{EngineStats, GameEngine};
use crate::errors::{EngineError, EngineResult};
use crate::referral::{ReferralLedger, RewardAccount};
use crate::PlayerId;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const MAX_PAGE_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub engine: Arc<GameEngine>,
    pub ledger: Arc<ReferralLedger>,
    pub config: ApiConfig,
}

/// JSON error envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status,
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
    }

    fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let (status, code) = match &e {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            EngineError::Authorization(_) => (StatusCode::FORBIDDEN, "authorization"),
            EngineError::Consistency(_) => (StatusCode::CONFLICT, "consistency"),
            EngineError::External(_) => (StatusCode::BAD_GATEWAY, "transfer"),
            EngineError::Randomness(_) => (StatusCode::BAD_GATEWAY, "randomness"),
            EngineError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
        };
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(ctx: ApiContext) -> Router {
    let enable_cors = ctx.config.enable_cors;
    let mut router = Router::new()
        .route("/round/current", get(get_current_round))
        .route("/round/:id", get(get_round))
        .route("/round/:id/verify", get(verify_round))
        .route("/rounds", get(list_rounds))
        .route("/rounds/recent", get(recent_rounds))
        .route("/stats", get(get_stats))
        .route("/referral/:player", get(get_referral_account))
        .route("/admin/pause", post(admin_pause))
        .route("/admin/unpause", post(admin_unpause))
        .route("/admin/retry/:id", post(admin_retry))
        .route("/admin/sweep", post(admin_sweep))
        .route("/admin/withdraw-fees", post(admin_withdraw_fees))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http());
    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until the process exits.
pub async fn serve(ctx: ApiContext) -> EngineResult<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "api listening");
    axum::serve(listener, router(ctx))
        .await
        .map_err(|e| EngineError::Config(format!("api server failed: {e}")))
}

// ── read-only handlers ───────────────────────────────────────────────

async fn get_current_round(State(ctx): State<ApiContext>) -> ApiResult<serde_json::Value> {
    match ctx.engine.current_round() {
        Some(snapshot) => Ok(Json(serde_json::json!(snapshot))),
        None => Err(ApiError::not_found("current round")),
    }
}

async fn get_round(
    State(ctx): State<ApiContext>,
    Path(id): Path<u64>,
) -> ApiResult<serde_json::Value> {
    match ctx.engine.round(id) {
        Some(snapshot) => Ok(Json(serde_json::json!(snapshot))),
        None => Err(ApiError::not_found("round")),
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

fn default_page_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct HistoryPage {
    total: usize,
    offset: usize,
    rounds: Vec<crate::engine::RoundSnapshot>,
}

async fn list_rounds(
    State(ctx): State<ApiContext>,
    Query(page): Query<PageQuery>,
) -> ApiResult<HistoryPage> {
    let limit = page.limit.min(MAX_PAGE_LIMIT);
    let (total, rounds) = ctx.engine.history(page.offset, limit);
    Ok(Json(HistoryPage {
        total,
        offset: page.offset,
        rounds,
    }))
}

async fn recent_rounds(
    State(ctx): State<ApiContext>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<crate::engine::FinishedRoundSummary>> {
    Ok(Json(ctx.engine.recent_finished(page.limit.min(MAX_PAGE_LIMIT))))
}

async fn verify_round(
    State(ctx): State<ApiContext>,
    Path(id): Path<u64>,
) -> ApiResult<crate::engine::RoundVerification> {
    Ok(Json(ctx.engine.verify_round(id)?))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    variant: String,
    capacity: usize,
    entry_fee: u64,
    #[serde(flatten)]
    engine: EngineStats,
    platform_fee_balance: u64,
}

async fn get_stats(State(ctx): State<ApiContext>) -> ApiResult<StatsResponse> {
    Ok(Json(StatsResponse {
        variant: ctx.engine.config().variant.to_string(),
        capacity: ctx.engine.capacity(),
        entry_fee: ctx.engine.entry_fee(),
        engine: ctx.engine.stats(),
        platform_fee_balance: ctx.ledger.platform_balance(),
    }))
}

#[derive(Debug, Serialize)]
struct ReferralView {
    player: PlayerId,
    inviter: Option<PlayerId>,
    account: RewardAccount,
}

async fn get_referral_account(
    State(ctx): State<ApiContext>,
    Path(player): Path<PlayerId>,
) -> ApiResult<ReferralView> {
    Ok(Json(ReferralView {
        inviter: ctx.ledger.get_inviter(&player),
        account: ctx.ledger.reward_account(&player),
        player,
    }))
}

// ── admin handlers ───────────────────────────────────────────────────

fn require_admin(ctx: &ApiContext, headers: &HeaderMap) -> Result<PlayerId, ApiError> {
    let Some(expected) = ctx.config.admin_token.as_deref() else {
        return Err(ApiError::forbidden("admin surface is disabled"));
    };
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return Err(ApiError::forbidden("bad admin token"));
    }
    Ok(ctx.engine.config().owner.clone())
}

#[derive(Debug, Serialize)]
struct AdminAck {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

impl AdminAck {
    fn ok() -> Self {
        Self {
            ok: true,
            amount: None,
            token: None,
        }
    }
}

async fn admin_pause(State(ctx): State<ApiContext>, headers: HeaderMap) -> ApiResult<AdminAck> {
    let owner = require_admin(&ctx, &headers)?;
    ctx.engine.pause(&owner)?;
    Ok(Json(AdminAck::ok()))
}

async fn admin_unpause(State(ctx): State<ApiContext>, headers: HeaderMap) -> ApiResult<AdminAck> {
    let owner = require_admin(&ctx, &headers)?;
    ctx.engine.unpause(&owner)?;
    Ok(Json(AdminAck::ok()))
}

async fn admin_retry(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<AdminAck> {
    let owner = require_admin(&ctx, &headers)?;
    let token = ctx.engine.retry_randomness_request(&owner, id)?;
    Ok(Json(AdminAck {
        token: Some(token.to_string()),
        ..AdminAck::ok()
    }))
}

async fn admin_sweep(State(ctx): State<ApiContext>, headers: HeaderMap) -> ApiResult<AdminAck> {
    let owner = require_admin(&ctx, &headers)?;
    let amount = ctx.engine.emergency_sweep(&owner)?;
    Ok(Json(AdminAck {
        amount: Some(amount),
        ..AdminAck::ok()
    }))
}

async fn admin_withdraw_fees(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<AdminAck> {
    let owner = require_admin(&ctx, &headers)?;
    let amount = ctx.ledger.withdraw_platform_fees(&owner)?;
    Ok(Json(AdminAck {
        amount: Some(amount),
        ..AdminAck::ok()
    }))
}
