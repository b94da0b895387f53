//! HTTP server for bridge, admin, health, and metrics endpoints
//!
//! Public routes (rate-limited):
//! - POST /bridge/lock - move internal balance into custody, mint externally
//! - POST /bridge/unlock - release internal balance against a verified burn
//! - GET  /bridge/chains - supported chains with minimum and fee
//! - GET  /bridge/history/{user_id} - a user's bridge transactions
//!
//! Admin routes:
//! - GET    /admin/security/stats - rolling security statistics
//! - GET    /admin/security/events - recent security events
//! - POST   /admin/security/events/{id}/resolve
//! - GET    /admin/blacklist - all entries, active and removed
//! - POST   /admin/blacklist - add (idempotent)
//! - DELETE /admin/blacklist/{id} - soft removal
//! - POST   /admin/breaker/open - halt new bridge operations
//! - POST   /admin/breaker/close - resume (requires explicit confirmation)
//!
//! Ops routes: GET /health, /healthz, /readyz, /metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;

use crate::blacklist::BlacklistEnforcer;
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::config::ApiConfig;
use crate::db::{self, BlacklistEntry, BridgeTransaction};
use crate::error::BridgeError;
use crate::metrics;
use crate::monitor::{EventDetails, SecurityMonitor, SecurityStats};
use crate::orchestrator::{BridgeOrchestrator, LockRequest, UnlockRequest};
use crate::registry::{ChainRegistry, SupportedChain};
use crate::types::{EntryType, TxStatus};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub orchestrator: Arc<BridgeOrchestrator>,
    pub registry: Arc<ChainRegistry>,
    pub blacklist: Arc<BlacklistEnforcer>,
    pub breaker: Arc<CircuitBreaker>,
    pub monitor: Arc<SecurityMonitor>,
    pub started_at: Instant,
}

fn parse_amount(raw: &str) -> Result<BigDecimal, BridgeError> {
    BigDecimal::from_str(raw.trim())
        .map_err(|_| BridgeError::InvalidRequest(format!("invalid decimal amount: {raw}")))
}

// ============ Public bridge routes ============

#[derive(Deserialize)]
struct LockBody {
    user_id: String,
    chain_code: String,
    /// Decimal string; JSON numbers would lose precision
    amount: String,
    external_address: String,
}

async fn lock(
    State(state): State<AppState>,
    Json(body): Json<LockBody>,
) -> Result<Json<BridgeTransaction>, BridgeError> {
    let amount = parse_amount(&body.amount)?;
    let tx = state
        .orchestrator
        .lock(LockRequest {
            user_id: body.user_id,
            chain_code: body.chain_code,
            amount,
            external_address: body.external_address,
        })
        .await?;
    Ok(Json(tx))
}

#[derive(Deserialize)]
struct UnlockBody {
    user_id: String,
    chain_code: String,
    amount: String,
    external_tx_hash: String,
}

async fn unlock(
    State(state): State<AppState>,
    Json(body): Json<UnlockBody>,
) -> Result<Json<BridgeTransaction>, BridgeError> {
    let amount = parse_amount(&body.amount)?;
    let tx = state
        .orchestrator
        .unlock(UnlockRequest {
            user_id: body.user_id,
            chain_code: body.chain_code,
            amount,
            external_tx_hash: body.external_tx_hash,
        })
        .await?;
    Ok(Json(tx))
}

async fn chains(State(state): State<AppState>) -> Json<Vec<SupportedChain>> {
    Json(state.registry.all().into_iter().cloned().collect())
}

async fn history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<BridgeTransaction>>, BridgeError> {
    Ok(Json(state.orchestrator.history(&user_id).await?))
}

// ============ Admin: security ============

async fn security_stats(
    State(state): State<AppState>,
) -> Result<Json<SecurityStats>, BridgeError> {
    Ok(Json(state.monitor.stats().await?))
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Event row with the JSONB payload decoded for the client
#[derive(Serialize)]
struct SecurityEventView {
    id: i64,
    event_type: String,
    severity: crate::types::Severity,
    details: serde_json::Value,
    resolved: bool,
    created_at: DateTime<Utc>,
}

async fn security_events(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<SecurityEventView>>, BridgeError> {
    let limit = page.limit.clamp(1, 500);
    let offset = page.offset.max(0);
    let rows = state.monitor.events(limit, offset).await?;
    let views = rows
        .into_iter()
        .map(|row| SecurityEventView {
            id: row.id,
            event_type: row.event_type,
            severity: row.severity,
            details: serde_json::from_str(&row.details)
                .unwrap_or(serde_json::Value::String(row.details)),
            resolved: row.resolved,
            created_at: row.created_at,
        })
        .collect();
    Ok(Json(views))
}

async fn resolve_event(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, BridgeError> {
    if state.monitor.resolve(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

// ============ Admin: blacklist ============

async fn blacklist_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<BlacklistEntry>>, BridgeError> {
    Ok(Json(state.blacklist.entries().await?))
}

#[derive(Deserialize)]
struct BlacklistAddBody {
    entry_type: EntryType,
    value: String,
    reason: String,
}

async fn blacklist_add(
    State(state): State<AppState>,
    Json(body): Json<BlacklistAddBody>,
) -> Result<Json<BlacklistEntry>, BridgeError> {
    if body.value.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("value is required".into()));
    }
    if body.reason.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("reason is required".into()));
    }
    let entry = state
        .blacklist
        .add(body.entry_type, body.value.trim(), body.reason.trim())
        .await?;
    Ok(Json(entry))
}

async fn blacklist_remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, BridgeError> {
    if state.blacklist.remove(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

// ============ Admin: circuit breaker ============

#[derive(Deserialize)]
struct BreakerOpenBody {
    reason: String,
}

async fn breaker_open(
    State(state): State<AppState>,
    Json(body): Json<BreakerOpenBody>,
) -> Result<Json<BreakerStatus>, BridgeError> {
    if body.reason.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("reason is required".into()));
    }
    if state.breaker.open(body.reason.trim()) {
        metrics::record_breaker_trip("manual");
        if let Err(e) = state
            .monitor
            .record(EventDetails::BreakerOpened {
                reason: body.reason.trim().to_string(),
                automatic: false,
            })
            .await
        {
            tracing::error!(error = %e, "failed to record breaker-opened event");
        }
    }
    Ok(Json(state.breaker.status()))
}

#[derive(Deserialize)]
struct BreakerCloseBody {
    /// The human confirms the incident is resolved; closing never happens
    /// automatically
    confirm: bool,
    #[serde(default)]
    note: Option<String>,
}

async fn breaker_close(
    State(state): State<AppState>,
    Json(body): Json<BreakerCloseBody>,
) -> Result<Json<BreakerStatus>, BridgeError> {
    if !body.confirm {
        return Err(BridgeError::InvalidRequest(
            "closing the breaker requires confirm=true".into(),
        ));
    }
    if state.breaker.close() {
        metrics::set_breaker_open(false);
        if let Err(e) = state
            .monitor
            .record(EventDetails::BreakerClosed { note: body.note })
            .await
        {
            tracing::error!(error = %e, "failed to record breaker-closed event");
        }
    }
    Ok(Json(state.breaker.status()))
}

// ============ Ops routes ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    breaker_open: bool,
    queues: QueueStatus,
}

#[derive(Serialize)]
struct QueueStatus {
    pending: i64,
    locked: i64,
    verified: i64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queues = QueueStatus {
        pending: db::count_by_status(&state.db, TxStatus::Pending)
            .await
            .unwrap_or(0),
        locked: db::count_by_status(&state.db, TxStatus::Locked)
            .await
            .unwrap_or(0),
        verified: db::count_by_status(&state.db, TxStatus::Verified)
            .await
            .unwrap_or(0),
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        breaker_open: state.breaker.is_open(),
        queues,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe (checks storage reachability)
async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY"),
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// Build the full router. Public bridge routes sit behind the rate limiter;
/// admin and ops routes do not (operators must reach them during incidents).
pub fn build_router(state: AppState, api_config: &ApiConfig) -> Router {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(api_config.rate_per_second)
            .burst_size(api_config.rate_burst)
            .finish()
            .expect("governor config is valid"),
    );

    let public = Router::new()
        .route("/bridge/lock", post(lock))
        .route("/bridge/unlock", post(unlock))
        .route("/bridge/chains", get(chains))
        .route("/bridge/history/{user_id}", get(history))
        .layer(GovernorLayer::new(governor_conf));

    let admin = Router::new()
        .route("/admin/security/stats", get(security_stats))
        .route("/admin/security/events", get(security_events))
        .route("/admin/security/events/{id}/resolve", post(resolve_event))
        .route("/admin/blacklist", get(blacklist_list).post(blacklist_add))
        .route("/admin/blacklist/{id}", delete(blacklist_remove))
        .route("/admin/breaker/open", post(breaker_open))
        .route("/admin/breaker/close", post(breaker_close));

    let ops = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics));

    public.merge(admin).merge(ops).with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: AppState, api_config: &ApiConfig) -> eyre::Result<()> {
    let app = build_router(state, api_config);

    let addr: SocketAddr = format!("{}:{}", api_config.bind_address, api_config.port)
        .parse()
        .map_err(|e| {
            eyre!(
                "Invalid bind address {}:{}: {}",
                api_config.bind_address,
                api_config.port,
                e
            )
        })?;
    info!("API server listening on {}", addr);
    info!("  /bridge/*  - public bridge operations");
    info!("  /admin/*   - security and policy administration");
    info!("  /metrics   - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
