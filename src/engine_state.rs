// =============================================================================
// Central Engine State — Meridian trading kernel
// =============================================================================
//
// The single source of truth for the process. Every subsystem owns its own
// interior mutability; `EngineState` ties them together and is passed as
// `Arc<EngineState>` into supervised tasks and the control-plane router.
// Nothing here reaches into globals: the runtime constructs the stores once
// and hands out references.
//
// Thread safety:
//   - atomics for the kill switch and version counter,
//   - parking_lot::RwLock for control-plane collections,
//   - subsystem engines (quarantine, windows, rollups) carry their own locks.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::api::guard::{IdempotencyStore, OpsTokenCache};
use crate::bus::{self, EventBus};
use crate::config::EngineConfig;
use crate::guards::chain::GuardChain;
use crate::guards::depeg::DepegFlag;
use crate::ops::health::{HealthNotifier, TransitionCount};
use crate::ops::notify::{self, NotifySink};
use crate::router::RouterRegistry;
use crate::state::cooldown::Cooldowns;
use crate::state::quarantine::QuarantineRegistry;
use crate::state::training_cursor::TrainingCursorStore;
use crate::telemetry::rollups::{BucketRing, BucketSnapshot, DailyRollup};
use crate::telemetry::windows::{LatencyWindow, PnlWindow};
use crate::types::{Mode, RegimeSignal};
use crate::universe::{ScoredSymbol, UniverseWeights};

/// Latency FIFO capacity (samples).
const LATENCY_WINDOW: usize = 400;
/// Trade records retained for /status and latency derivation.
const MAX_TRADE_BUFFER: usize = 400;

// =============================================================================
// Control-plane state
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyToggle {
    pub enabled: bool,
    pub risk_share: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerFlags {
    pub equity: bool,
    pub venue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: f64,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub pnl_usd: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

/// Mutable control-plane state behind the ops endpoints.
pub struct ControlState {
    pub mode: RwLock<Mode>,
    pub strategies: RwLock<HashMap<String, StrategyToggle>>,
    pub universe_weights: RwLock<UniverseWeights>,
    pub metrics: RwLock<HashMap<String, f64>>,
    pub breaker: RwLock<BreakerFlags>,
    pub pnl_by_strategy: RwLock<HashMap<String, f64>>,
    pub trades: RwLock<Vec<TradeRecord>>,
    pub regime: RwLock<RegimeSignal>,
    pub universe: RwLock<Vec<ScoredSymbol>>,
}

fn default_strategies() -> HashMap<String, StrategyToggle> {
    [
        ("scalp", 0.25),
        ("momentum", 0.35),
        ("trend", 0.25),
        ("event", 0.15),
    ]
    .into_iter()
    .map(|(name, share)| {
        (
            name.to_string(),
            StrategyToggle {
                enabled: true,
                risk_share: share,
            },
        )
    })
    .collect()
}

fn default_metrics() -> HashMap<String, f64> {
    [
        ("equity_usd", 2000.0),
        ("open_positions", 0.0),
        ("open_risk_sum_pct", 0.0),
        ("pnl_24h", 0.0),
        ("drawdown_pct", 0.0),
        ("peak_drawdown_pct", 0.0),
        ("exposure_total_usd", 0.0),
        ("tick_to_order_ms_p50", 50.0),
        ("tick_to_order_ms_p95", 95.0),
        ("venue_error_rate_pct", 0.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mode: RwLock::new(Mode::Yellow),
            strategies: RwLock::new(default_strategies()),
            universe_weights: RwLock::new(UniverseWeights::default()),
            metrics: RwLock::new(default_metrics()),
            breaker: RwLock::new(BreakerFlags::default()),
            pnl_by_strategy: RwLock::new(HashMap::new()),
            trades: RwLock::new(Vec::new()),
            regime: RwLock::new(RegimeSignal::default()),
            universe: RwLock::new(Vec::new()),
        }
    }
}

// =============================================================================
// EngineState
// =============================================================================

pub struct EngineState {
    pub config: EngineConfig,
    pub bus: Arc<EventBus>,
    pub routers: Arc<RouterRegistry>,

    // ── Guard-chain inputs ──────────────────────────────────────────────
    pub kill: Arc<AtomicBool>,
    pub quarantine: Arc<QuarantineRegistry>,
    pub cooldowns: Arc<Cooldowns>,
    pub depeg_flag: Arc<DepegFlag>,
    pub guard_chain: GuardChain,

    // ── Telemetry ───────────────────────────────────────────────────────
    pub rollups: Arc<DailyRollup>,
    pub buckets: Arc<BucketRing>,
    pub latency: Arc<LatencyWindow>,
    pub pnl_window: Arc<PnlWindow>,

    // ── Ops ─────────────────────────────────────────────────────────────
    pub sink: Arc<dyn NotifySink>,
    pub health: Arc<HealthNotifier>,
    pub control: ControlState,
    pub training_cursor: Arc<TrainingCursorStore>,
    pub ops_token_cache: OpsTokenCache,
    pub idempotency: IdempotencyStore,

    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Construct the full state tree and wire the standing bus subscribers
    /// (bracket governor and supervised tasks are wired by the caller, which
    /// also owns their lifecycles).
    pub fn new(config: EngineConfig, routers: Arc<RouterRegistry>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.bus.queue_cap));
        let kill = Arc::new(AtomicBool::new(false));
        let quarantine = Arc::new(QuarantineRegistry::load(config.quarantine.clone()));
        let cooldowns = Arc::new(Cooldowns::new(config.guards.cooldown_ttl_sec));
        let depeg_flag = Arc::new(DepegFlag::default());
        let latency = Arc::new(LatencyWindow::new(
            LATENCY_WINDOW,
            &config.router.default_venue,
        ));

        let guard_chain = GuardChain::new(
            &config.guards,
            kill.clone(),
            quarantine.clone(),
            cooldowns.clone(),
            depeg_flag.clone(),
            latency.clone(),
            bus.clone(),
        );

        let sink = notify::build_sink(&config.telegram);
        let health = HealthNotifier::new(config.health.clone(), sink.clone());

        let rollups = Arc::new(DailyRollup::new());
        let buckets = Arc::new(BucketRing::new(
            config.digest.bucket_minutes,
            config.digest.max_buckets,
        ));
        let training_cursor = Arc::new(TrainingCursorStore::load(&config.training_cursor_path));

        let state = Arc::new(Self {
            bus: bus.clone(),
            routers,
            kill,
            quarantine,
            cooldowns,
            depeg_flag,
            guard_chain,
            rollups,
            buckets,
            latency,
            pnl_window: Arc::new(PnlWindow::new()),
            sink: sink.clone(),
            health: health.clone(),
            control: ControlState::default(),
            training_cursor,
            ops_token_cache: OpsTokenCache::default(),
            idempotency: IdempotencyStore::new(config.ops.idempotency_retention_sec),
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
            config,
        });

        health.wire(&state.bus);
        notify::wire_notify_topic(&state.bus, sink);
        state.wire_rollup_mirrors();
        state
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an operator- or strategy-reported trade; updates the latency
    /// window and derived percentile metrics when a latency sample rides in.
    pub fn record_trade(&self, trade: TradeRecord) {
        if let (Some(symbol), Some(ms)) = (&trade.symbol, trade.latency_ms) {
            self.latency.record(symbol, ms);
        } else if let Some(ms) = trade.latency_ms {
            self.latency.record("UNQUOTED", ms);
        }
        if trade.latency_ms.is_some() {
            let (p50, p95) = self.latency.percentiles();
            let mut metrics = self.control.metrics.write();
            metrics.insert("tick_to_order_ms_p50".to_string(), p50);
            metrics.insert("tick_to_order_ms_p95".to_string(), p95);
        }

        let mut trades = self.control.trades.write();
        trades.push(trade);
        let excess = trades.len().saturating_sub(MAX_TRADE_BUFFER);
        if excess > 0 {
            trades.drain(0..excess);
        }
        drop(trades);
        self.increment_version();
    }

    /// Wire the `event_bo.*` mirror subscriptions that feed the daily rollup
    /// and the intraday bucket ring.
    fn wire_rollup_mirrors(self: &Arc<Self>) {
        let topics: [(&str, &str); 5] = [
            ("event_bo.plan_dry", "plans_dry"),
            ("event_bo.plan_live", "plans_live"),
            ("event_bo.trade", "trades"),
            ("event_bo.half", "half_applied"),
            ("event_bo.trail", "trail_update"),
        ];
        for (topic, key) in topics {
            let rollups = self.rollups.clone();
            let buckets = self.buckets.clone();
            let key = key.to_string();
            self.bus.subscribe(
                topic,
                bus::handler(move |payload| {
                    let rollups = rollups.clone();
                    let buckets = buckets.clone();
                    let key = key.clone();
                    async move {
                        let symbol = payload["symbol"].as_str();
                        rollups.inc(&key, symbol, 1);
                        buckets.inc(&key, symbol, 1);
                    }
                }),
            );
        }

        // Skips carry their reason in the payload.
        let rollups = self.rollups.clone();
        let buckets = self.buckets.clone();
        self.bus.subscribe(
            "event_bo.skip",
            bus::handler(move |payload| {
                let rollups = rollups.clone();
                let buckets = buckets.clone();
                async move {
                    let reason = payload["reason"].as_str().unwrap_or("unknown");
                    let key = format!("skip_{reason}");
                    let symbol = payload["symbol"].as_str();
                    rollups.inc(&key, symbol, 1);
                    buckets.inc(&key, symbol, 1);
                }
            }),
        );
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Build the full state snapshot served by `GET /status`.
    pub fn build_snapshot(&self) -> StatusSnapshot {
        let (p50, p95) = self.latency.percentiles();
        StatusSnapshot {
            state_version: self.current_state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            uptime_sec: self.start_time.elapsed().as_secs(),
            mode: *self.control.mode.read(),
            kill: self.kill.load(Ordering::Relaxed),
            strategies: self.control.strategies.read().clone(),
            universe_weights: self.control.universe_weights.read().clone(),
            metrics: self.control.metrics.read().clone(),
            breaker: self.control.breaker.read().clone(),
            pnl_by_strategy: self.control.pnl_by_strategy.read().clone(),
            rollups: self.rollups.counters(),
            top_traded: self.rollups.top_symbols("trades", 5),
            buckets: self.buckets.snapshot(),
            latency: LatencySnapshot {
                p50_ms: p50,
                p95_ms: p95,
                samples: self.latency.sample_count(),
            },
            health_state: self.health.current_state().code(),
            health_transitions: self.health.transition_counts(),
            quarantined: self
                .quarantine
                .blocked_snapshot()
                .into_iter()
                .map(|(symbol, remaining_sec)| QuarantinedSymbol {
                    symbol,
                    remaining_sec,
                })
                .collect(),
            depeg_triggered: self.depeg_flag.is_triggered(),
            bus_dropped_events: self.bus.dropped_count(),
            trades_recorded: self.control.trades.read().len(),
        }
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedSymbol {
    pub symbol: String,
    pub remaining_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_sec: u64,
    pub mode: Mode,
    pub kill: bool,
    pub strategies: HashMap<String, StrategyToggle>,
    pub universe_weights: UniverseWeights,
    pub metrics: HashMap<String, f64>,
    pub breaker: BreakerFlags,
    pub pnl_by_strategy: HashMap<String, f64>,
    pub rollups: HashMap<String, u64>,
    pub top_traded: Vec<(String, u64)>,
    pub buckets: Vec<BucketSnapshot>,
    pub latency: LatencySnapshot,
    pub health_state: u8,
    pub health_transitions: Vec<TransitionCount>,
    pub quarantined: Vec<QuarantinedSymbol>,
    pub depeg_triggered: bool,
    pub bus_dropped_events: u64,
    pub trades_recorded: usize,
}
