// =============================================================================
// Control Plane — JSON operational endpoints (Axum 0.7)
// =============================================================================
//
// Read endpoints (/health, /status, /universe) are open; every mutating
// endpoint requires the ops token, with two-man approval and idempotency
// layered on per the table below:
//
//   POST /risk/mode             token
//   POST /kill                  token + two-man + idempotent
//   POST /allocator/weights     token + idempotent
//   POST /strategies/{name}     token + idempotent
//   POST /metrics               token
//   POST /metrics/push          token
//   POST /universe/weights      token
//   POST /universe/features     token
//   POST /trades                token
//   POST /orders/market         token + idempotent
//
// Idempotent endpoints consume raw bytes so the stored response can be
// replayed byte-equal; a reused key with a different body is a 409.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::guard::{body_digest, Approver, IdemCheck, IdemKey, OpsToken};
use crate::engine_state::{EngineState, TradeRecord};
use crate::guards::chain::{CooldownGate, GateContext};
use crate::policy;
use crate::types::{
    epoch_now, AccountState, MarketSnapshot, Mode, OrderIntent, Side, StrategyContext,
    StrategyKind, Timeframe,
};
use crate::universe::{self, SymbolFeatures, UniverseWeights};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Read ────────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/universe", get(universe_buckets))
        // ── Control ─────────────────────────────────────────────────
        .route("/risk/mode", post(set_mode))
        .route("/kill", post(kill))
        .route("/allocator/weights", post(allocator_weights))
        .route("/strategies/:strategy", post(update_strategy))
        .route("/metrics", post(update_metrics))
        .route("/metrics/push", post(metrics_push))
        .route("/universe/weights", post(set_universe_weights))
        .route("/universe/features", post(push_universe_features))
        .route("/trades", post(ingest_trade))
        .route("/orders/market", post(orders_market))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Shared response helpers
// =============================================================================

fn err(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "code": code, "message": message })),
    )
        .into_response()
}

fn bad_body(e: impl std::fmt::Display) -> Response {
    err(
        StatusCode::BAD_REQUEST,
        "request.invalid",
        &format!("invalid request body: {e}"),
    )
}

/// Canonical JSON response from pre-rendered bytes (idempotent replay path).
fn canonical(status: u16, body: String) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Idempotency preamble: replay or conflict short-circuits; `Ok` carries the
/// key and digest for the eventual `record`.
fn idem_begin(
    state: &EngineState,
    key: Option<String>,
    raw: &[u8],
) -> Result<(String, String), Response> {
    let Some(key) = key else {
        return Err(crate::api::guard::GuardRejection::MISSING_IDEMPOTENCY_KEY.into_response());
    };
    let digest = body_digest(raw);
    match state.idempotency.check(&key, &digest) {
        IdemCheck::Replay { status, body } => Err(canonical(status, body)),
        IdemCheck::Conflict => Err(err(
            StatusCode::CONFLICT,
            "idempotency.conflict",
            "Idempotency-Key reused with a different body",
        )),
        IdemCheck::Fresh => Ok((key, digest)),
    }
}

// =============================================================================
// Read endpoints
// =============================================================================

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn status(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn universe_buckets(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    let ranked = state.control.universe.read().clone();
    Json(universe::bucketize(ranked))
}

// =============================================================================
// Mode
// =============================================================================

#[derive(Deserialize)]
struct ModeIn {
    mode: String,
}

async fn set_mode(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<ModeIn>,
) -> Response {
    let mode: Mode = match req.mode.parse() {
        Ok(mode) => mode,
        Err(_) => {
            return err(
                StatusCode::BAD_REQUEST,
                "mode.invalid",
                &format!("invalid mode '{}': use red, yellow or green", req.mode),
            )
        }
    };
    *state.control.mode.write() = mode;
    state.increment_version();
    info!(%mode, "risk mode set via API");
    Json(serde_json::json!({ "ok": true, "mode": mode })).into_response()
}

// =============================================================================
// Kill switch (two-man + idempotent)
// =============================================================================

#[derive(Deserialize)]
struct ToggleIn {
    enabled: bool,
}

async fn kill(
    _auth: OpsToken,
    approver: Approver,
    key: IdemKey,
    State(state): State<Arc<EngineState>>,
    raw: Bytes,
) -> Response {
    let (key, digest) = match idem_begin(&state, key.0, &raw) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let req: ToggleIn = match serde_json::from_slice(&raw) {
        Ok(req) => req,
        Err(e) => return bad_body(e),
    };

    state.kill.store(req.enabled, Ordering::Relaxed);
    state.increment_version();
    warn!(
        enabled = req.enabled,
        approver = approver.0.is_some(),
        "kill switch toggled via API"
    );

    let body = serde_json::json!({ "ok": true, "enabled": req.enabled }).to_string();
    state.idempotency.record(&key, &digest, 200, &body);
    canonical(200, body)
}

// =============================================================================
// Allocator / strategies (idempotent)
// =============================================================================

#[derive(Deserialize)]
struct RiskShareIn {
    strategy: String,
    risk_share: f64,
}

async fn allocator_weights(
    _auth: OpsToken,
    key: IdemKey,
    State(state): State<Arc<EngineState>>,
    raw: Bytes,
) -> Response {
    let (key, digest) = match idem_begin(&state, key.0, &raw) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let req: RiskShareIn = match serde_json::from_slice(&raw) {
        Ok(req) => req,
        Err(e) => return bad_body(e),
    };
    if !(0.0..=1.0).contains(&req.risk_share) {
        return err(
            StatusCode::BAD_REQUEST,
            "weights.out_of_range",
            "risk_share must be within [0, 1]",
        );
    }

    let body = {
        let mut strategies = state.control.strategies.write();
        let Some(entry) = strategies.get_mut(&req.strategy) else {
            return err(
                StatusCode::NOT_FOUND,
                "strategy.unknown",
                &format!("unknown strategy '{}'", req.strategy),
            );
        };
        entry.risk_share = req.risk_share;
        serde_json::json!({
            "ok": true,
            "strategy": req.strategy,
            "risk_share": entry.risk_share,
        })
        .to_string()
    };
    state.increment_version();
    info!(strategy = %req.strategy, risk_share = req.risk_share, "allocator weights set");

    state.idempotency.record(&key, &digest, 200, &body);
    canonical(200, body)
}

#[derive(Deserialize)]
struct StrategyStateIn {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    risk_share: Option<f64>,
}

async fn update_strategy(
    _auth: OpsToken,
    key: IdemKey,
    Path(strategy): Path<String>,
    State(state): State<Arc<EngineState>>,
    raw: Bytes,
) -> Response {
    let (key, digest) = match idem_begin(&state, key.0, &raw) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let req: StrategyStateIn = match serde_json::from_slice(&raw) {
        Ok(req) => req,
        Err(e) => return bad_body(e),
    };

    let body = {
        let mut strategies = state.control.strategies.write();
        let Some(entry) = strategies.get_mut(&strategy) else {
            return err(
                StatusCode::NOT_FOUND,
                "strategy.unknown",
                &format!("unknown strategy '{strategy}'"),
            );
        };
        if let Some(enabled) = req.enabled {
            entry.enabled = enabled;
        }
        if let Some(share) = req.risk_share {
            entry.risk_share = share.clamp(0.0, 1.0);
        }
        serde_json::json!({
            "ok": true,
            "strategy": strategy,
            "enabled": entry.enabled,
            "risk_share": entry.risk_share,
        })
        .to_string()
    };
    state.increment_version();
    info!(strategy = %strategy, "strategy state updated");

    state.idempotency.record(&key, &digest, 200, &body);
    canonical(200, body)
}

// =============================================================================
// Metrics
// =============================================================================

/// Short spellings accepted from push clients.
fn metric_alias(key: &str) -> &str {
    match key {
        "tick_p50_ms" => "tick_to_order_ms_p50",
        "tick_p95_ms" => "tick_to_order_ms_p95",
        "error_rate_pct" => "venue_error_rate_pct",
        "positions" => "open_positions",
        other => other,
    }
}

/// Regime-signal keys are routed to the regime store so pushed model outputs
/// feed mode selection directly; `realized_total_usd` feeds the trailing-24h
/// PnL window, whose delta lands in `pnl_24h`.
fn merge_metrics(state: &EngineState, updates: &HashMap<String, serde_json::Value>) -> bool {
    let mut changed = false;
    let mut metrics = state.control.metrics.write();
    let mut regime = state.control.regime.write();
    for (raw_key, value) in updates {
        let Some(parsed) = value.as_f64() else {
            continue;
        };
        let key = metric_alias(raw_key);
        match key {
            "p_win_1h" => regime.p_win_1h = parsed,
            "pnl_slope_1h" => regime.pnl_slope_1h = parsed,
            "drawdown_pct_7d" => regime.drawdown_pct_7d = parsed,
            "breadth_up_pct" => regime.breadth_up_pct = parsed,
            "realized_total_usd" => {
                let delta = state.pnl_window.record_realized_total(parsed);
                metrics.insert("pnl_24h".to_string(), delta);
            }
            _ => {
                if metrics.get(key) != Some(&parsed) {
                    metrics.insert(key.to_string(), parsed);
                    changed = true;
                    continue;
                }
                continue;
            }
        }
        changed = true;
    }
    changed
}

#[derive(Deserialize)]
struct MetricsUpdateIn {
    #[serde(flatten)]
    fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    breaker_equity: Option<bool>,
    #[serde(default)]
    breaker_venue: Option<bool>,
}

async fn update_metrics(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<MetricsUpdateIn>,
) -> Response {
    let mut changed = merge_metrics(&state, &req.fields);
    {
        let mut breaker = state.control.breaker.write();
        if let Some(equity) = req.breaker_equity {
            changed |= breaker.equity != equity;
            breaker.equity = equity;
        }
        if let Some(venue) = req.breaker_venue {
            changed |= breaker.venue != venue;
            breaker.venue = venue;
        }
    }
    if changed {
        state.increment_version();
    }
    Json(serde_json::json!({ "ok": true, "changed": changed })).into_response()
}

#[derive(Deserialize)]
struct MetricsPushIn {
    #[serde(default)]
    metrics: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pnl_by_strategy: Option<HashMap<String, serde_json::Value>>,
}

async fn metrics_push(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<MetricsPushIn>,
) -> Response {
    let mut changed = false;
    if let Some(metrics) = &req.metrics {
        changed |= merge_metrics(&state, metrics);
    }
    if let Some(pnl) = &req.pnl_by_strategy {
        let cleaned: HashMap<String, f64> = pnl
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect();
        if !cleaned.is_empty() {
            let mut current = state.control.pnl_by_strategy.write();
            if *current != cleaned {
                *current = cleaned;
                changed = true;
            }
        }
    }
    if changed {
        state.increment_version();
    }
    Json(serde_json::json!({ "ok": true, "changed": changed })).into_response()
}

// =============================================================================
// Universe
// =============================================================================

async fn set_universe_weights(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(weights): Json<UniverseWeights>,
) -> Response {
    *state.control.universe_weights.write() = weights;
    state.increment_version();
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[derive(Deserialize)]
struct UniverseFeaturesIn {
    symbols: Vec<SymbolFeatures>,
}

async fn push_universe_features(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<UniverseFeaturesIn>,
) -> Response {
    let weights = state.control.universe_weights.read().clone();
    let ranked = universe::rank_symbols(&req.symbols, &weights);
    let count = ranked.len();
    *state.control.universe.write() = ranked;
    state.increment_version();
    Json(serde_json::json!({ "ok": true, "count": count })).into_response()
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Deserialize)]
struct TradeIn {
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    pnl_usd: Option<f64>,
    #[serde(default)]
    latency_ms: Option<f64>,
}

async fn ingest_trade(
    _auth: OpsToken,
    State(state): State<Arc<EngineState>>,
    Json(req): Json<TradeIn>,
) -> Response {
    state.record_trade(TradeRecord {
        ts: req.ts.unwrap_or_else(epoch_now),
        strategy: req.strategy,
        symbol: req.symbol,
        side: req.side,
        pnl_usd: req.pnl_usd,
        latency_ms: req.latency_ms,
    });
    Json(serde_json::json!({ "ok": true })).into_response()
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct OrderIn {
    symbol: String,
    side: Side,
    #[serde(default)]
    quote_usd: Option<f64>,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    limit_price: Option<f64>,
    #[serde(default)]
    client_order_id: Option<String>,
    #[serde(default = "default_strategy_kind")]
    strategy: StrategyKind,
    #[serde(default = "default_timeframe")]
    timeframe: Timeframe,
    // Live feature overrides; absent fields fall back to benign defaults so
    // an operator can submit a bare {symbol, side, quote_usd} order.
    #[serde(default)]
    atr_pct: Option<f64>,
    #[serde(default)]
    spread_bps: Option<f64>,
    #[serde(default)]
    vol1m_usd: Option<f64>,
    #[serde(default)]
    liq_score: Option<f64>,
    #[serde(default)]
    event_heat: Option<f64>,
}

fn default_strategy_kind() -> StrategyKind {
    StrategyKind::Momentum
}

fn default_timeframe() -> Timeframe {
    Timeframe::M5
}

async fn orders_market(
    _auth: OpsToken,
    key: IdemKey,
    State(state): State<Arc<EngineState>>,
    raw: Bytes,
) -> Response {
    let (key, digest) = match idem_begin(&state, key.0, &raw) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let req: OrderIn = match serde_json::from_slice(&raw) {
        Ok(req) => req,
        Err(e) => return bad_body(e),
    };

    let (adapter, base_symbol) = match state.routers.resolve(&req.symbol) {
        Ok(resolved) => resolved,
        Err(e) => return err(StatusCode::BAD_REQUEST, "router.unroutable", &e.to_string()),
    };

    let mark = match adapter.get_last_price(&base_symbol).await {
        Ok(Some(px)) => px,
        Ok(None) => match req.limit_price {
            Some(px) => px,
            None => {
                return err(
                    StatusCode::BAD_REQUEST,
                    "market.no_mark",
                    "no mark price available for symbol",
                )
            }
        },
        Err(e) => return err(StatusCode::BAD_GATEWAY, "router.error", &e.to_string()),
    };

    let intent = OrderIntent {
        symbol: req.symbol.clone(),
        side: req.side,
        quote_usd: req.quote_usd,
        quantity: req.quantity,
        limit_price: req.limit_price,
        client_order_id: req.client_order_id.clone(),
        intent: Default::default(),
    };
    let snapshot = MarketSnapshot {
        symbol: base_symbol.clone(),
        mark,
        atr_pct: req.atr_pct.unwrap_or(0.01),
        spread_bps: req.spread_bps.unwrap_or(5.0),
        book_depth_usd: 0.0,
        vol1m_usd: req.vol1m_usd.unwrap_or(1_000_000.0),
        funding_rate_8h: None,
        event_heat: req.event_heat.unwrap_or(0.0),
        velocity: 0.0,
        liq_score: req.liq_score.unwrap_or(0.5),
    };
    let strat = StrategyContext {
        name: format!("{:?}", req.strategy).to_lowercase(),
        kind: req.strategy,
        base_timeframe: req.timeframe,
        leverage_allowed: false,
        priority: 5,
    };

    let (account, daily_loss_pct, peak_drawdown_pct) = {
        let metrics = state.control.metrics.read();
        let m = |k: &str| metrics.get(k).copied().unwrap_or(0.0);
        let equity = m("equity_usd").max(1.0);
        let account = AccountState {
            equity_usd: equity,
            open_risk_sum_pct: m("open_risk_sum_pct"),
            open_positions: m("open_positions") as u32,
            exposure_total_usd: m("exposure_total_usd"),
            exposure_by_symbol_usd: HashMap::new(),
        };
        let daily_loss_pct = (-m("pnl_24h") / equity).max(0.0);
        (account, daily_loss_pct, m("peak_drawdown_pct"))
    };
    let regime = state.control.regime.read().clone();
    let budget = policy::compute_order(&strat, &snapshot, &account, &regime);

    let verdict = state.guard_chain.evaluate(&GateContext {
        intent: &intent,
        snapshot: &snapshot,
        account: &account,
        budget: &budget,
        daily_loss_pct,
        peak_drawdown_pct,
        now: epoch_now(),
    });

    if let Err(reason) = verdict {
        let body = serde_json::json!({
            "ok": false,
            "reason": reason.tag(),
            "mode": budget.mode,
        })
        .to_string();
        state.idempotency.record(&key, &digest, 200, &body);
        return canonical(200, body);
    }

    // Route it: explicit quantity wins, then explicit quote, then the budget.
    let (quote, qty) = match (req.quantity, req.quote_usd) {
        (Some(qty), _) => (None, Some(qty)),
        (None, Some(quote)) => (Some(quote), None),
        (None, None) => (Some(budget.size_usd), None),
    };
    match adapter
        .place_market(
            &base_symbol,
            req.side,
            quote,
            qty,
            req.client_order_id.as_deref(),
        )
        .await
    {
        Ok(ack) => {
            state
                .cooldowns
                .hit(&CooldownGate::key_for(&base_symbol), None);
            state.bus.fire(
                "event_bo.trade",
                serde_json::json!({ "symbol": base_symbol }),
            );
            state.increment_version();
            let body = serde_json::json!({
                "ok": true,
                "mode": budget.mode,
                "size_usd": budget.size_usd,
                "stop_pct": budget.stop_pct,
                "ack": ack,
            })
            .to_string();
            state.idempotency.record(&key, &digest, 200, &body);
            canonical(200, body)
        }
        // Venue errors are surfaced, not retried, and not recorded for
        // replay — a retry with the same key may legitimately succeed.
        Err(e) => err(StatusCode::BAD_GATEWAY, "router.error", &e.to_string()),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::router::paper::PaperRouter;
    use crate::router::RouterRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "test-ops-token";
    const APPROVER: &str = "approver-1";

    fn test_app() -> (Router, Arc<EngineState>, Arc<PaperRouter>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.quarantine.path = dir.path().join("q.json").to_string_lossy().into_owned();
        config.training_cursor_path =
            dir.path().join("cursor.json").to_string_lossy().into_owned();
        std::mem::forget(dir);
        config.ops.token = Some(TOKEN.into());
        config.ops.approver_tokens = vec![APPROVER.into()];

        let paper = Arc::new(PaperRouter::new("BINANCE"));
        let mut registry = RouterRegistry::new("BINANCE");
        registry.register("BINANCE", paper.clone());
        let state = EngineState::new(config, Arc::new(registry));
        (router(state.clone()), state, paper)
    }

    fn req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("X-Ops-Token", TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn status_is_public_and_complete() {
        let (app, _state, _paper) = test_app();
        let resp = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["mode"], "yellow");
        assert_eq!(body["kill"], false);
        assert!(body["strategies"]["momentum"]["enabled"].as_bool().unwrap());
        assert!(body["latency"]["p50_ms"].is_number());
    }

    #[tokio::test]
    async fn missing_token_is_401_and_unconfigured_is_503() {
        let (app, _state, _paper) = test_app();
        let resp = app
            .clone()
            .oneshot(
                Request::post("/risk/mode")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"mode":"green"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // No token configured at all → 503.
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.quarantine.path = dir.path().join("q.json").to_string_lossy().into_owned();
        std::mem::forget(dir);
        let mut registry = RouterRegistry::new("BINANCE");
        registry.register("BINANCE", Arc::new(PaperRouter::new("BINANCE")));
        let state = EngineState::new(config, Arc::new(registry));
        let app = router(state);
        let resp = app
            .oneshot(req("POST", "/risk/mode", serde_json::json!({"mode": "red"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn set_mode_validates_and_applies() {
        let (app, state, _paper) = test_app();

        let resp = app
            .clone()
            .oneshot(req("POST", "/risk/mode", serde_json::json!({"mode": "green"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*state.control.mode.read(), Mode::Green);

        let resp = app
            .oneshot(req("POST", "/risk/mode", serde_json::json!({"mode": "blue"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["code"], "mode.invalid");
    }

    fn kill_req(key: &str, enabled: bool, with_approver: bool) -> Request<Body> {
        let mut builder = Request::post("/kill")
            .header("content-type", "application/json")
            .header("X-Ops-Token", TOKEN)
            .header("Idempotency-Key", key);
        if with_approver {
            builder = builder.header("X-Ops-Approver", APPROVER);
        }
        builder
            .body(Body::from(
                serde_json::json!({ "enabled": enabled }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn kill_requires_approver_and_idempotency_key() {
        let (app, state, _paper) = test_app();

        let resp = app.clone().oneshot(kill_req("k0", true, false)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(!state.kill.load(Ordering::Relaxed));

        let no_key = Request::post("/kill")
            .header("content-type", "application/json")
            .header("X-Ops-Token", TOKEN)
            .header("X-Ops-Approver", APPROVER)
            .body(Body::from(r#"{"enabled":true}"#))
            .unwrap();
        let resp = app.clone().oneshot(no_key).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!state.kill.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn idempotent_kill_replays_byte_equal() {
        let (app, state, _paper) = test_app();

        let first = app.clone().oneshot(kill_req("k1", true, true)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_body = body_string(first).await;
        assert!(state.kill.load(Ordering::Relaxed));

        // Flip the flag behind the API's back; the replay must NOT re-execute.
        state.kill.store(false, Ordering::Relaxed);
        let second = app.clone().oneshot(kill_req("k1", true, true)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_string(second).await, first_body);
        assert!(!state.kill.load(Ordering::Relaxed));

        // Same key, different body → 409.
        let conflict = app.oneshot(kill_req("k1", false, true)).await.unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn allocator_weights_validates_range_and_strategy() {
        let (app, state, _paper) = test_app();

        let ok = req(
            "POST",
            "/allocator/weights",
            serde_json::json!({ "strategy": "trend", "risk_share": 0.4 }),
        );
        let ok = {
            let (mut parts, body) = ok.into_parts();
            parts.headers.insert("Idempotency-Key", "w1".parse().unwrap());
            Request::from_parts(parts, body)
        };
        let resp = app.clone().oneshot(ok).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.control.strategies.read()["trend"].risk_share,
            0.4
        );

        let unknown = req(
            "POST",
            "/allocator/weights",
            serde_json::json!({ "strategy": "arb", "risk_share": 0.4 }),
        );
        let unknown = {
            let (mut parts, body) = unknown.into_parts();
            parts.headers.insert("Idempotency-Key", "w2".parse().unwrap());
            Request::from_parts(parts, body)
        };
        let resp = app.clone().oneshot(unknown).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let oob = req(
            "POST",
            "/allocator/weights",
            serde_json::json!({ "strategy": "trend", "risk_share": 1.4 }),
        );
        let oob = {
            let (mut parts, body) = oob.into_parts();
            parts.headers.insert("Idempotency-Key", "w3".parse().unwrap());
            Request::from_parts(parts, body)
        };
        let resp = app.oneshot(oob).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_push_merges_aliases_and_regime() {
        let (app, state, _paper) = test_app();

        let resp = app
            .oneshot(req(
                "POST",
                "/metrics/push",
                serde_json::json!({
                    "metrics": {
                        "equity_usd": 12000.0,
                        "tick_p50_ms": 42.0,
                        "p_win_1h": 0.7,
                    },
                    "pnl_by_strategy": { "trend": 55.0, "bogus": "nan" },
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let metrics = state.control.metrics.read();
        assert_eq!(metrics["equity_usd"], 12_000.0);
        assert_eq!(metrics["tick_to_order_ms_p50"], 42.0);
        assert_eq!(state.control.regime.read().p_win_1h, 0.7);
        assert_eq!(state.control.pnl_by_strategy.read()["trend"], 55.0);
    }

    #[tokio::test]
    async fn realized_total_push_yields_trailing_delta() {
        let (app, state, _paper) = test_app();

        for total in [100.0, 130.0] {
            let resp = app
                .clone()
                .oneshot(req(
                    "POST",
                    "/metrics/push",
                    serde_json::json!({ "metrics": { "realized_total_usd": total } }),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        // First push anchors the window; the second reports +30 over it.
        assert_eq!(state.control.metrics.read()["pnl_24h"], 30.0);
    }

    #[tokio::test]
    async fn trades_feed_latency_percentiles() {
        let (app, state, _paper) = test_app();

        for ms in [10.0, 20.0, 30.0, 40.0] {
            let resp = app
                .clone()
                .oneshot(req(
                    "POST",
                    "/trades",
                    serde_json::json!({ "symbol": "BTCUSDT", "latency_ms": ms }),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let metrics = state.control.metrics.read();
        assert!((metrics["tick_to_order_ms_p50"] - 25.0).abs() < 1e-9);
        assert!((metrics["tick_to_order_ms_p95"] - 38.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn universe_features_roundtrip_to_buckets() {
        let (app, _state, _paper) = test_app();

        let resp = app
            .clone()
            .oneshot(req(
                "POST",
                "/universe/features",
                serde_json::json!({ "symbols": [
                    { "symbol": "BTCUSDT", "quote_volume_1m_usd": 5e6, "book_depth_usd": 2e6,
                      "spread_bps": 2.0, "velocity": 0.9, "atr_pct": 0.012 },
                    { "symbol": "DOGEUSDT", "quote_volume_1m_usd": 1e5, "book_depth_usd": 5e4,
                      "spread_bps": 20.0, "velocity": -0.2, "atr_pct": 0.01 },
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/universe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        let total = body["core"].as_array().unwrap().len()
            + body["watch"].as_array().unwrap().len()
            + body["bench"].as_array().unwrap().len();
        assert_eq!(total, 2);
    }

    fn order_req(key: &str, body: serde_json::Value) -> Request<Body> {
        Request::post("/orders/market")
            .header("content-type", "application/json")
            .header("X-Ops-Token", TOKEN)
            .header("X-Idempotency-Key", key)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn order_routes_when_guards_pass() {
        let (app, state, paper) = test_app();
        paper.set_price("BTCUSDT", 30_000.0);
        state
            .control
            .metrics
            .write()
            .insert("equity_usd".into(), 10_000.0);

        let resp = app
            .clone()
            .oneshot(order_req(
                "o1",
                serde_json::json!({ "symbol": "BTCUSDT", "side": "BUY", "quote_usd": 3000.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["ack"]["status"], "FILLED");
        assert!((paper.position_qty("BTCUSDT") - 0.1).abs() < 1e-9);

        // Entry cooldown armed: an immediate second order is rejected.
        let resp = app
            .oneshot(order_req(
                "o2",
                serde_json::json!({ "symbol": "BTCUSDT", "side": "BUY", "quote_usd": 3000.0 }),
            ))
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "COOLDOWN");
        assert!((paper.position_qty("BTCUSDT") - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn order_rejected_by_kill_switch() {
        let (app, state, paper) = test_app();
        paper.set_price("ETHUSDT", 2_000.0);
        state.kill.store(true, Ordering::Relaxed);

        let resp = app
            .oneshot(order_req(
                "o3",
                serde_json::json!({ "symbol": "ETHUSDT", "side": "SELL", "quote_usd": 500.0 }),
            ))
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "KILL");
        assert_eq!(paper.position_qty("ETHUSDT"), 0.0);
    }

    #[tokio::test]
    async fn order_requires_idempotency_key() {
        let (app, _state, paper) = test_app();
        paper.set_price("BTCUSDT", 30_000.0);
        let resp = app
            .oneshot(req(
                "POST",
                "/orders/market",
                serde_json::json!({ "symbol": "BTCUSDT", "side": "BUY", "quote_usd": 100.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn order_replay_does_not_double_fill() {
        let (app, state, paper) = test_app();
        paper.set_price("BTCUSDT", 30_000.0);
        state
            .control
            .metrics
            .write()
            .insert("equity_usd".into(), 10_000.0);

        let body = serde_json::json!({ "symbol": "BTCUSDT", "side": "BUY", "quote_usd": 3000.0 });
        let first = app.clone().oneshot(order_req("dup", body.clone())).await.unwrap();
        let first_body = body_string(first).await;
        let second = app.oneshot(order_req("dup", body)).await.unwrap();
        assert_eq!(body_string(second).await, first_body);
        assert!((paper.position_qty("BTCUSDT") - 0.1).abs() < 1e-9);
    }
}
