//! TKS HTTP 处理器

use crate::{
    engine::{TokenEngine, VerifyOutcome},
    error::TksError,
    types::{GrantResponse, IssueParams, IssueResponse, VerifyParams, VerifyResponse},
};
use axum::{
    Router,
    extract::{ConnectInfo, FromRequestParts, Json, Query, State},
    http::{HeaderMap, request::Parts},
    routing::{get, post},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

lazy_static! {
    /// TKS 服务指标
    static ref TKS_TOKENS_ISSUED: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_tokens_issued_total", "Total number of tokens issued")
            .namespace("keygate"),
        &["result"]
    ).unwrap();

    static ref TKS_TOKENS_VERIFIED: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_tokens_verified_total", "Total number of token verifications")
            .namespace("keygate"),
        &["result"]
    ).unwrap();

    static ref TKS_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("keygate_request_duration_seconds", "HTTP request duration in seconds")
            .namespace("keygate")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["service", "method", "path", "status"]
    ).unwrap();
}

/// 注册 TKS metrics 到全局 registry
pub fn register_tks_metrics(registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(TKS_TOKENS_ISSUED.clone()))?;
    registry.register(Box::new(TKS_TOKENS_VERIFIED.clone()))?;
    registry.register(Box::new(TKS_REQUEST_DURATION.clone()))?;
    Ok(())
}

fn observe(method: &str, path: &str, status: u16, start: Instant) {
    TKS_REQUEST_DURATION
        .with_label_values(&["tks", method, path, &status.to_string()])
        .observe(start.elapsed().as_secs_f64());
}

/// TKS 服务状态
#[derive(Clone)]
pub struct TksState {
    pub engine: TokenEngine,
}

impl TksState {
    pub fn new(engine: TokenEngine) -> Self {
        Self { engine }
    }
}

/// 请求方身份（客户端 IP）
///
/// 配置 trust_forwarded_for 时优先取 X-Forwarded-For 的第一项，
/// 否则使用 TCP 对端地址。两者都不可用时退化为 "unknown"。
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<TksState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &TksState,
    ) -> Result<Self, Self::Rejection> {
        if state.engine.trust_forwarded_for() {
            if let Some(forwarded) = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return Ok(ClientIp(forwarded.to_string()));
            }
        }

        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(ip))
    }
}

/// 创建 TKS 服务的路由
///
/// /grant 仅在启用许可门禁时挂载。
pub fn create_router(state: TksState) -> Router {
    let mut router = Router::new()
        .route("/genkey", get(issue_token_handler))
        .route("/verify", get(verify_token_handler))
        .route("/health", get(health_check_handler));

    if state.engine.grant_gate_enabled() {
        router = router.route("/grant", post(mint_grant_handler));
    }

    router.with_state(state)
}

async fn issue_token_handler(
    State(state): State<TksState>,
    ClientIp(identity): ClientIp,
    Query(params): Query<IssueParams>,
) -> Result<Json<IssueResponse>, TksError> {
    let start = Instant::now();
    let now = Utc::now().timestamp();
    debug!("Received token issue request from {}", identity);

    state.engine.maybe_cleanup(now);

    let result = state.engine.issue(&identity, params.grant.as_deref(), now).await;

    match result {
        Ok(token) => {
            TKS_TOKENS_ISSUED.with_label_values(&["success"]).inc();
            observe("GET", "/genkey", 200, start);
            Ok(Json(IssueResponse {
                key: token.key,
                expires: token.expires_at,
                valid: true,
            }))
        }
        Err(e) => {
            let label = match &e {
                TksError::QuotaExceeded { .. } => "quota_exceeded",
                TksError::GrantRequired | TksError::GrantInvalid => "grant_rejected",
                _ => "error",
            };
            TKS_TOKENS_ISSUED.with_label_values(&[label]).inc();
            observe("GET", "/genkey", e.status().as_u16(), start);
            warn!("Token issue rejected for {}: {}", identity, e);
            Err(e)
        }
    }
}

async fn verify_token_handler(
    State(state): State<TksState>,
    Query(params): Query<VerifyParams>,
) -> Result<Json<VerifyResponse>, TksError> {
    let start = Instant::now();
    let now = Utc::now().timestamp();

    state.engine.maybe_cleanup(now);

    let result = match params.input() {
        Some(input) => state.engine.verify(input, now).await,
        None => Err(TksError::NoInput),
    };

    match result {
        Ok(outcome) => {
            let label = match outcome {
                VerifyOutcome::Consumed => "consumed",
                VerifyOutcome::AdminBypass => "admin_bypass",
            };
            TKS_TOKENS_VERIFIED.with_label_values(&[label]).inc();
            observe("GET", "/verify", 200, start);
            Ok(Json(VerifyResponse {
                valid: true,
                reason: "Token verified successfully".to_string(),
            }))
        }
        Err(e) => {
            TKS_TOKENS_VERIFIED.with_label_values(&["rejected"]).inc();
            observe("GET", "/verify", e.status().as_u16(), start);
            debug!("Token verification rejected: {}", e);
            Err(e)
        }
    }
}

async fn mint_grant_handler(
    State(state): State<TksState>,
    headers: HeaderMap,
) -> Result<Json<GrantResponse>, TksError> {
    let start = Instant::now();
    let now = Utc::now().timestamp();

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| state.engine.is_admin_key(token.trim()));

    if !authorized {
        observe("POST", "/grant", 401, start);
        warn!("Grant request rejected: missing or invalid admin credentials");
        return Err(TksError::Unauthorized);
    }

    let record = state.engine.mint_grant(now).await?;
    observe("POST", "/grant", 200, start);
    info!("Grant minted by admin");

    Ok(Json(GrantResponse {
        grant: record.id,
        expires: record.expires_at,
    }))
}

async fn health_check_handler(
    State(state): State<TksState>,
) -> Result<Json<serde_json::Value>, TksError> {
    debug!("Health check requested");

    let token_count = state.engine.store().token_count().await?;

    let response = serde_json::json!({
        "status": "healthy",
        "service": "tks",
        "backend": state.engine.store().backend_name(),
        "token_count": token_count,
        "timestamp": Utc::now().timestamp()
    });

    Ok(Json(response))
}
