//! HTTP endpoint server using Axum

use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use crate::error::{CoreError, CredentialError, StoreError};
use crate::jobs::store::JobStore;
use crate::metrics::Metrics;
use crate::models::credential::ApiCredential;
use crate::models::job::{
    Backtest, BacktestRequest, BacktestResult, JobFilter, JobRecord, JobRef, JobStatus, LiveBot,
    LiveBotRequest,
};
use crate::models::strategy::{NewStrategy, Strategy, StrategyUpdate};
use crate::models::trade_log::TradeLog;
use crate::models::user::{Role, User};
use crate::services::credentials::CredentialVault;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Clone)]
pub struct AppState {
    pub health: Arc<RwLock<HealthStatus>>,
    pub metrics: Arc<Metrics>,
    pub start_time: Arc<Instant>,
    pub jobs: Arc<JobStore>,
    pub credentials: Arc<CredentialVault>,
}

impl AppState {
    pub fn new(
        metrics: Arc<Metrics>,
        jobs: Arc<JobStore>,
        credentials: Arc<CredentialVault>,
    ) -> Self {
        Self {
            health: Arc::new(RwLock::new(HealthStatus::default())),
            metrics,
            start_time: Arc::new(Instant::now()),
            jobs,
            credentials,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub status: String,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Error body returned by every API route
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CoreError::QuotaExceeded { .. } | CoreError::PlanViolation { .. } | CoreError::Forbidden => {
                StatusCode::FORBIDDEN
            }
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::CredentialInvalid(_)
            | CoreError::InvalidStrategy(_)
            | CoreError::IndicatorUnavailable { .. } => StatusCode::BAD_REQUEST,
            CoreError::InvalidTransition { .. } | CoreError::ResourceInUse { .. } => {
                StatusCode::CONFLICT
            }
            CoreError::DispatchFailure { .. }
            | CoreError::Store(StoreError::Unavailable(_))
            | CoreError::MarketData(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ExecutionFailure(_) | CoreError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            CoreError::QuotaExceeded { .. } => "quota_exceeded",
            CoreError::PlanViolation { .. } => "plan_violation",
            CoreError::CredentialInvalid(_) => "credential_invalid",
            CoreError::ResourceInUse { .. } => "resource_in_use",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::IndicatorUnavailable { .. } => "indicator_unavailable",
            CoreError::DispatchFailure { .. } => "dispatch_failure",
            CoreError::ExecutionFailure(_) => "execution_failure",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Forbidden => "forbidden",
            CoreError::InvalidStrategy(_) => "invalid_strategy",
            CoreError::Store(_) => "store_error",
            CoreError::MarketData(_) => "market_data_unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let mut body = json!({ "error": self.code(), "message": self.0.to_string() });
        match &self.0 {
            CoreError::PlanViolation { timeframe, node_id } => {
                body["timeframe"] = json!(timeframe);
                body["node_id"] = json!(node_id);
            }
            CoreError::DispatchFailure { job, .. } => {
                body["job"] = json!(job);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity from the gateway's `x-user-id` / `x-user-role` headers
pub struct CurrentUser(pub User);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized = || {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized", "message": "missing or invalid x-user-id" })),
            )
        };
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(unauthorized)?;
        let role = match parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        };
        Ok(CurrentUser(User { id, role }))
    }
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let health = state.health.read().await;
    let uptime_seconds = state.start_time.elapsed().as_secs();
    Ok(Json(json!({
        "status": health.status,
        "uptime_seconds": uptime_seconds,
        "service": "cortex-api"
    })))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .export()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Middleware to track HTTP request metrics
async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    state.metrics.http_requests_in_flight.inc();
    let response = next.run(request).await;
    let status = response.status();
    let duration = start.elapsed();
    state.metrics.http_requests_in_flight.dec();

    state.metrics.http_requests_total.inc();
    state
        .metrics
        .http_request_duration_seconds
        .observe(duration.as_secs_f64());

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status,
            duration_ms = duration.as_millis(),
            "HTTP request error"
        );
    }

    response
}

async fn list_strategies(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Strategy>>> {
    Ok(Json(state.jobs.list_strategies(&user).await?))
}

async fn create_strategy(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<NewStrategy>,
) -> ApiResult<(StatusCode, Json<Strategy>)> {
    let strategy = state.jobs.create_strategy(&user, request).await?;
    Ok((StatusCode::CREATED, Json(strategy)))
}

async fn get_strategy(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(state.jobs.get_strategy(&user, id).await?))
}

async fn update_strategy(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(request): Json<StrategyUpdate>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(state.jobs.update_strategy(&user, id, request).await?))
}

async fn delete_strategy(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.jobs.delete_strategy(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_backtests(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(filter): Query<JobFilter>,
) -> ApiResult<Json<Vec<Backtest>>> {
    Ok(Json(state.jobs.list_backtests(&user, &filter).await?))
}

async fn create_backtest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<BacktestRequest>,
) -> ApiResult<(StatusCode, Json<Backtest>)> {
    let backtest = state.jobs.create_backtest_job(&user, request).await?;
    Ok((StatusCode::CREATED, Json(backtest)))
}

async fn get_backtest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Backtest>> {
    Ok(Json(state.jobs.get_backtest(id, &user).await?))
}

async fn cancel_backtest(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.jobs.cancel(JobRef::backtest(id), &user).await?))
}

async fn backtest_trades(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<TradeLog>>> {
    Ok(Json(state.jobs.trade_logs(JobRef::backtest(id), &user).await?))
}

async fn backtest_result(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<BacktestResult>> {
    Ok(Json(state.jobs.backtest_result(id, &user).await?))
}

async fn list_live_bots(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(filter): Query<JobFilter>,
) -> ApiResult<Json<Vec<LiveBot>>> {
    Ok(Json(state.jobs.list_live_bots(&user, &filter).await?))
}

async fn create_live_bot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<LiveBotRequest>,
) -> ApiResult<(StatusCode, Json<LiveBot>)> {
    let bot = state.jobs.create_live_bot_job(&user, request).await?;
    Ok((StatusCode::CREATED, Json(bot)))
}

async fn get_live_bot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<LiveBot>> {
    Ok(Json(state.jobs.get_live_bot(id, &user).await?))
}

#[derive(Debug, Deserialize)]
struct LiveBotStatusRequest {
    status: JobStatus,
}

async fn update_live_bot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(request): Json<LiveBotStatusRequest>,
) -> ApiResult<Json<LiveBot>> {
    Ok(Json(
        state
            .jobs
            .update_live_bot_status(id, &user, request.status)
            .await?,
    ))
}

async fn delete_live_bot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.jobs.delete_live_bot(id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn live_bot_trades(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<TradeLog>>> {
    Ok(Json(state.jobs.trade_logs(JobRef::live_bot(id), &user).await?))
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateCredentialRequest {
    exchange: String,
    api_key: String,
    secret: String,
}

async fn create_credential(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateCredentialRequest>,
) -> Result<(StatusCode, Json<ApiCredential>), (StatusCode, Json<Value>)> {
    let credential = state
        .credentials
        .register(user.id, &request.exchange, &request.api_key, &request.secret)
        .await
        .map_err(|e| {
            let status = match e {
                CredentialError::MissingKey => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(user_id = user.id, error = %e, "failed to store credential");
            (
                status,
                Json(json!({ "error": "credential_error", "message": e.to_string() })),
            )
        })?;
    Ok((StatusCode::CREATED, Json(credential)))
}

async fn delete_credential(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.jobs.delete_credential(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/strategies", get(list_strategies).post(create_strategy))
        .route(
            "/api/strategies/{id}",
            get(get_strategy).put(update_strategy).delete(delete_strategy),
        )
        .route("/api/backtests", get(list_backtests).post(create_backtest))
        .route("/api/backtests/{id}", get(get_backtest))
        .route("/api/backtests/{id}/cancel", post(cancel_backtest))
        .route("/api/backtests/{id}/trades", get(backtest_trades))
        .route("/api/backtests/{id}/result", get(backtest_result))
        .route("/api/live-bots", get(list_live_bots).post(create_live_bot))
        .route(
            "/api/live-bots/{id}",
            get(get_live_bot).put(update_live_bot).delete(delete_live_bot),
        )
        .route("/api/live-bots/{id}/trades", get(live_bot_trades))
        .route("/api/credentials", post(create_credential))
        .route("/api/credentials/{id}", axum::routing::delete(delete_credential))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub async fn start_server(port: u16, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!(port = port, "HTTP server listening on port {}", port);
    info!(
        "Metrics endpoint available at http://0.0.0.0:{}/metrics",
        port
    );
    axum::serve(listener, app).await?;

    Ok(())
}
