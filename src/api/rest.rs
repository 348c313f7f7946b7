// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The thin transport over the trading core: backtests, historical data,
// strategies, orders, positions, and engine control. Authentication and
// session issuance live in the outer gateway; the caller's identity arrives
// as the `x-user-id` header and defaults to "local" for single-operator
// deployments.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::backtest::{BacktestEngine, ParamGrid, WalkForwardOptimizer};
use crate::error::CoreError;
use crate::orders::{NewOrderRequest, OrderFilters};
use crate::positions::PnlPeriod;
use crate::store::{BacktestRecord, BacktestRecordFilter, JobStatus};
use crate::strategy::{build_strategy, param_schema, StrategyKind};
use crate::types::{Pair, Timeframe, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Engine ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        // ── Backtests ───────────────────────────────────────────────
        .route("/api/v1/backtest/run", post(backtest_run))
        .route("/api/v1/backtest/optimize", post(backtest_optimize))
        .route("/api/v1/backtest", get(backtest_list))
        .route("/api/v1/backtest/:id", get(backtest_get))
        // ── Historical data ─────────────────────────────────────────
        .route("/api/v1/data/ingest", post(data_ingest))
        .route("/api/v1/data/status", get(data_status))
        .route("/api/v1/data/gaps", get(data_gaps))
        .route("/api/v1/data/repair", post(data_repair))
        .route("/api/v1/data/read", get(data_read))
        // ── Strategies ──────────────────────────────────────────────
        .route("/api/v1/strategies", get(strategy_list).post(strategy_create))
        .route("/api/v1/strategies/schema/:kind", get(strategy_schema))
        .route("/api/v1/strategies/:id/activate", post(strategy_activate))
        .route("/api/v1/strategies/:id/pause", post(strategy_pause))
        .route("/api/v1/strategies/:id/deactivate", post(strategy_deactivate))
        // ── Orders ──────────────────────────────────────────────────
        .route("/api/v1/orders", get(order_list).post(order_create))
        .route("/api/v1/orders/stats", get(order_stats))
        .route("/api/v1/orders/:id/cancel", post(order_cancel))
        // ── Positions ───────────────────────────────────────────────
        .route("/api/v1/positions", get(position_list))
        .route("/api/v1/positions/pnl", get(position_pnl))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(CoreError::Json(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::RiskDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn user_of(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
        .to_string()
}

fn ok(data: Value) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

// =============================================================================
// Engine
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn full_state(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let snapshot = state.build_snapshot(&user_of(&headers)).await;
    ok(serde_json::to_value(&snapshot)?)
}

async fn control_pause(State(state): State<Arc<AppState>>) -> ApiResult {
    state.set_trading_mode(TradingMode::Paused);
    info!("trading paused via API");
    ok(json!({ "trading_mode": "Paused" }))
}

async fn control_resume(State(state): State<Arc<AppState>>) -> ApiResult {
    state.set_trading_mode(TradingMode::Live);
    info!("trading resumed via API");
    ok(json!({ "trading_mode": "Live" }))
}

// =============================================================================
// Backtests
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BacktestRunBody {
    pair: String,
    timeframe: String,
    strategy_type: String,
    #[serde(default)]
    strategy_params: Value,
    /// Milliseconds since epoch.
    from: i64,
    to: i64,
    #[serde(default)]
    exchange: Option<String>,
}

async fn backtest_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BacktestRunBody>,
) -> ApiResult {
    let user_id = user_of(&headers);
    let pair = Pair::parse(&body.pair)?;
    let timeframe = Timeframe::parse(&body.timeframe)?;
    let kind = StrategyKind::parse(&body.strategy_type)?;
    let params = if body.strategy_params.is_null() {
        json!({})
    } else {
        body.strategy_params.clone()
    };

    let candles = state.candles.read_range(&pair, timeframe, body.from, body.to)?;
    if candles.is_empty() {
        return Err(CoreError::not_found("candles", format!("{pair} {timeframe}")).into());
    }

    let config = state.config.read().backtest.clone();
    let engine = BacktestEngine::new(config.clone());
    let mut strategy = build_strategy(kind, &params)?;
    let report = engine.run(strategy.as_mut(), &pair, &candles)?;

    let record = BacktestRecord {
        id: Uuid::new_v4().to_string(),
        user_id,
        kind: "RUN".into(),
        exchange: body.exchange.unwrap_or_else(|| "aggregate".into()),
        pair: pair.to_string(),
        timeframe: timeframe.to_string(),
        strategy_type: kind.to_string(),
        strategy_params: params,
        backtest_config: serde_json::to_value(&config)?,
        result: serde_json::to_value(&report.summary)?,
        created_at: Utc::now().to_rfc3339(),
    };
    state.meta.insert_backtest(&record)?;

    ok(json!({ "id": record.id, "report": report }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeBody {
    pair: String,
    timeframe: String,
    strategy_type: String,
    param_grid: ParamGrid,
    from: i64,
    to: i64,
}

async fn backtest_optimize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OptimizeBody>,
) -> ApiResult {
    let user_id = user_of(&headers);
    let pair = Pair::parse(&body.pair)?;
    let timeframe = Timeframe::parse(&body.timeframe)?;
    let kind = StrategyKind::parse(&body.strategy_type)?;

    let candles = state.candles.read_range(&pair, timeframe, body.from, body.to)?;
    let (optimizer_config, backtest_config) = {
        let config = state.config.read();
        (config.optimizer.clone(), config.backtest.clone())
    };
    let optimizer = WalkForwardOptimizer::new(optimizer_config.clone(), backtest_config.clone());
    let report = optimizer.optimize(kind, &pair, &candles, &body.param_grid)?;

    let record = BacktestRecord {
        id: Uuid::new_v4().to_string(),
        user_id,
        kind: "OPTIMIZE".into(),
        exchange: "aggregate".into(),
        pair: pair.to_string(),
        timeframe: timeframe.to_string(),
        strategy_type: kind.to_string(),
        strategy_params: serde_json::to_value(&body.param_grid)?,
        backtest_config: serde_json::to_value(&backtest_config)?,
        result: serde_json::to_value(&report.aggregate)?,
        created_at: Utc::now().to_rfc3339(),
    };
    state.meta.insert_backtest(&record)?;

    ok(json!({ "id": record.id, "report": report }))
}

async fn backtest_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<BacktestRecordFilter>,
) -> ApiResult {
    let records = state.meta.list_backtests(&user_of(&headers), &filter)?;
    ok(serde_json::to_value(&records)?)
}

async fn backtest_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let record = state.meta.get_backtest(&id, &user_of(&headers))?;
    ok(serde_json::to_value(&record)?)
}

// =============================================================================
// Historical data
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestBody {
    pairs: Vec<String>,
    timeframes: Vec<String>,
    start_date: i64,
    end_date: i64,
    /// Fire-and-forget: schedule the jobs and return immediately.
    #[serde(default)]
    r#async: bool,
}

async fn data_ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> ApiResult {
    let mut series = Vec::new();
    for pair_text in &body.pairs {
        for tf_text in &body.timeframes {
            series.push((Pair::parse(pair_text)?, Timeframe::parse(tf_text)?));
        }
    }

    if body.r#async {
        for (pair, timeframe) in series.iter().cloned() {
            let ingestor = state.ingestor.clone();
            let (from, to) = (body.start_date, body.end_date);
            tokio::spawn(async move {
                if let Err(e) = ingestor.ingest(&pair, timeframe, from, to, 1).await {
                    tracing::warn!(pair = %pair, error = %e, "background ingestion failed");
                }
            });
        }
        return ok(json!({ "scheduled": series.len() }));
    }

    let mut jobs = Vec::new();
    for (pair, timeframe) in &series {
        let job = state
            .ingestor
            .ingest(pair, *timeframe, body.start_date, body.end_date, 1)
            .await?;
        jobs.push(job);
    }
    ok(serde_json::to_value(&jobs)?)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn data_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    let status = match &query.status {
        Some(s) => Some(JobStatus::parse(s)?),
        None => None,
    };
    let jobs = state.meta.list_jobs(status)?;
    ok(serde_json::to_value(&jobs)?)
}

#[derive(Debug, Deserialize)]
struct SeriesQuery {
    pair: String,
    timeframe: String,
}

async fn data_gaps(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult {
    let pair = Pair::parse(&query.pair)?;
    let timeframe = Timeframe::parse(&query.timeframe)?;
    let gaps = state.ingestor.detect_gaps(&pair, timeframe)?;
    ok(serde_json::to_value(&gaps)?)
}

async fn data_repair(
    State(state): State<Arc<AppState>>,
    Json(query): Json<SeriesQuery>,
) -> ApiResult {
    let pair = Pair::parse(&query.pair)?;
    let timeframe = Timeframe::parse(&query.timeframe)?;
    let repaired = state.ingestor.repair_gaps(&pair, timeframe).await?;
    ok(json!({ "repaired": repaired }))
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    pair: String,
    timeframe: String,
    from: i64,
    to: i64,
    limit: Option<usize>,
}

async fn data_read(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReadQuery>,
) -> ApiResult {
    let pair = Pair::parse(&query.pair)?;
    let timeframe = Timeframe::parse(&query.timeframe)?;
    let mut candles = state
        .candles
        .read_range(&pair, timeframe, query.from, query.to)?;
    candles.truncate(query.limit.unwrap_or(5_000));
    ok(serde_json::to_value(&candles)?)
}

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrategyCreateBody {
    kind: String,
    pair: String,
    exchange: String,
    #[serde(default)]
    params: Value,
}

async fn strategy_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StrategyCreateBody>,
) -> ApiResult {
    let kind = StrategyKind::parse(&body.kind)?;
    let pair = Pair::parse(&body.pair)?;
    let params = if body.params.is_null() {
        json!({})
    } else {
        body.params
    };
    let record = state
        .scheduler
        .create(&user_of(&headers), kind, pair, &body.exchange, params)?;
    state.increment_version();
    ok(serde_json::to_value(&record)?)
}

async fn strategy_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let records = state.scheduler.list(Some(&user_of(&headers))).await;
    ok(serde_json::to_value(&records)?)
}

async fn strategy_schema(Path(kind): Path<String>) -> ApiResult {
    let kind = StrategyKind::parse(&kind)?;
    ok(param_schema(kind))
}

async fn strategy_activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let record = state.scheduler.activate(&id).await?;
    state.increment_version();
    ok(serde_json::to_value(&record)?)
}

async fn strategy_pause(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let record = state.scheduler.pause(&id).await?;
    state.increment_version();
    ok(serde_json::to_value(&record)?)
}

async fn strategy_deactivate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let record = state.scheduler.deactivate(&id).await?;
    state.increment_version();
    ok(serde_json::to_value(&record)?)
}

// =============================================================================
// Orders
// =============================================================================

async fn order_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut request): Json<NewOrderRequest>,
) -> ApiResult {
    request.user_id = user_of(&headers);
    let ack = state.orders.create_order(&request).await?;
    state.increment_version();
    ok(json!({ "order": ack.order, "warnings": ack.warnings }))
}

async fn order_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filters): Query<OrderFilters>,
) -> ApiResult {
    let orders = state.orders.user_orders(&user_of(&headers), &filters);
    ok(serde_json::to_value(&orders)?)
}

async fn order_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let stats = state.orders.order_stats(&user_of(&headers));
    ok(serde_json::to_value(&stats)?)
}

async fn order_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let order = state.orders.cancel_order(&id, &user_of(&headers)).await?;
    state.increment_version();
    ok(serde_json::to_value(&order)?)
}

// =============================================================================
// Positions
// =============================================================================

async fn position_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let positions = state.positions.user_positions(&user_of(&headers));
    ok(serde_json::to_value(&positions)?)
}

#[derive(Debug, Deserialize)]
struct PnlQuery {
    period: Option<String>,
}

async fn position_pnl(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PnlQuery>,
) -> ApiResult {
    let period = PnlPeriod::parse(query.period.as_deref().unwrap_or("all"))?;
    let report = state.positions.pnl_report(&user_of(&headers), period);
    ok(serde_json::to_value(&report)?)
}
