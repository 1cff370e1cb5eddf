// =============================================================================
// Guard Chain — ordered policy gates evaluated per order intent
// =============================================================================
//
// Gates run cheapest-and-hardest first; the first non-OK reason wins and the
// remaining gates are not invoked. A rejection is not an error: the reason is
// returned to the caller, counted in the rollups via an `event_bo.skip` bus
// event, and visible in /status.
//
// Default order: kill, quarantine, cooldown, spread, depeg, exposure/position
// caps, latency, drawdown, minimum notional.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::bus::EventBus;
use crate::config::GuardConfig;
use crate::guards::depeg::DepegFlag;
use crate::policy::OrderBudget;
use crate::state::cooldown::Cooldowns;
use crate::state::quarantine::QuarantineRegistry;
use crate::telemetry::windows::LatencyWindow;
use crate::types::{AccountState, MarketSnapshot, OrderIntent};

// =============================================================================
// Reasons & results
// =============================================================================

/// Why an intent was rejected. The tag is the wire/rollup spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Spread,
    Pos,
    Cooldown,
    Latency,
    Dd,
    Kill,
    Quarantine,
    Depeg,
    SizeMin,
    Exposure,
}

impl SkipReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Spread => "SPREAD",
            Self::Pos => "POS",
            Self::Cooldown => "COOLDOWN",
            Self::Latency => "LATENCY",
            Self::Dd => "DD",
            Self::Kill => "KILL",
            Self::Quarantine => "QUARANTINE",
            Self::Depeg => "DEPEG",
            Self::SizeMin => "SIZE_MIN",
            Self::Exposure => "EXPOSURE",
        }
    }

    /// Rollup counter key, e.g. `skip_spread`.
    pub fn rollup_key(&self) -> String {
        format!("skip_{}", self.tag().to_ascii_lowercase())
    }
}

pub enum GateResult {
    Ok,
    Skip(SkipReason),
}

/// Everything a gate may consult. Drawdown fractions come from the telemetry
/// side rather than `AccountState` so the account contract stays minimal.
pub struct GateContext<'a> {
    pub intent: &'a OrderIntent,
    pub snapshot: &'a MarketSnapshot,
    pub account: &'a AccountState,
    pub budget: &'a OrderBudget,
    pub daily_loss_pct: f64,
    pub peak_drawdown_pct: f64,
    pub now: f64,
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &GateContext<'_>) -> GateResult;
}

// =============================================================================
// Gates
// =============================================================================

pub struct KillGate {
    pub kill: Arc<AtomicBool>,
}

impl Gate for KillGate {
    fn name(&self) -> &'static str {
        "kill"
    }
    fn check(&self, _ctx: &GateContext<'_>) -> GateResult {
        if self.kill.load(Ordering::Relaxed) {
            GateResult::Skip(SkipReason::Kill)
        } else {
            GateResult::Ok
        }
    }
}

pub struct QuarantineGate {
    pub registry: Arc<QuarantineRegistry>,
}

impl Gate for QuarantineGate {
    fn name(&self) -> &'static str {
        "quarantine"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let (blocked, _) = self
            .registry
            .is_quarantined_at(&ctx.intent.symbol, ctx.now);
        if blocked {
            GateResult::Skip(SkipReason::Quarantine)
        } else {
            GateResult::Ok
        }
    }
}

pub struct CooldownGate {
    pub cooldowns: Arc<Cooldowns>,
}

impl CooldownGate {
    pub fn key_for(symbol: &str) -> String {
        let base = symbol.split('.').next().unwrap_or(symbol);
        format!("entry:{}", base.to_ascii_uppercase())
    }
}

impl Gate for CooldownGate {
    fn name(&self) -> &'static str {
        "cooldown"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let key = Self::key_for(&ctx.intent.symbol);
        if self.cooldowns.allow_at(&key, ctx.now) {
            GateResult::Ok
        } else {
            GateResult::Skip(SkipReason::Cooldown)
        }
    }
}

pub struct SpreadGate {
    pub max_spread_bps: f64,
}

impl Gate for SpreadGate {
    fn name(&self) -> &'static str {
        "spread"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        if ctx.snapshot.spread_bps > self.max_spread_bps {
            GateResult::Skip(SkipReason::Spread)
        } else {
            GateResult::Ok
        }
    }
}

pub struct DepegGate {
    pub flag: Arc<DepegFlag>,
}

impl Gate for DepegGate {
    fn name(&self) -> &'static str {
        "depeg"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        if self.flag.is_triggered_at(ctx.now) {
            GateResult::Skip(SkipReason::Depeg)
        } else {
            GateResult::Ok
        }
    }
}

pub struct ExposureGate {
    pub max_symbol_exposure_usd: f64,
    pub max_total_exposure_usd: f64,
}

impl Gate for ExposureGate {
    fn name(&self) -> &'static str {
        "exposure"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        if ctx.account.open_positions >= ctx.budget.max_positions {
            return GateResult::Skip(SkipReason::Pos);
        }
        if ctx.account.open_risk_sum_pct >= ctx.budget.risk_cap_sum_r {
            return GateResult::Skip(SkipReason::Exposure);
        }
        let base = ctx
            .intent
            .symbol
            .split('.')
            .next()
            .unwrap_or(&ctx.intent.symbol)
            .to_ascii_uppercase();
        let symbol_exposure = ctx
            .account
            .exposure_by_symbol_usd
            .get(&base)
            .copied()
            .unwrap_or(0.0);
        if symbol_exposure + ctx.budget.size_usd > self.max_symbol_exposure_usd
            || ctx.account.exposure_total_usd + ctx.budget.size_usd > self.max_total_exposure_usd
        {
            return GateResult::Skip(SkipReason::Exposure);
        }
        GateResult::Ok
    }
}

pub struct LatencyGate {
    pub window: Arc<LatencyWindow>,
    pub max_tick_to_order_ms: f64,
}

impl Gate for LatencyGate {
    fn name(&self) -> &'static str {
        "latency"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        match self.window.consume(&ctx.intent.symbol) {
            Some(ms) if ms > self.max_tick_to_order_ms => {
                GateResult::Skip(SkipReason::Latency)
            }
            _ => GateResult::Ok,
        }
    }
}

pub struct DrawdownGate;

impl Gate for DrawdownGate {
    fn name(&self) -> &'static str {
        "drawdown"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        if ctx.daily_loss_pct >= ctx.budget.daily_stop_pct
            || ctx.peak_drawdown_pct >= ctx.budget.peak_drawdown_stop_pct
        {
            GateResult::Skip(SkipReason::Dd)
        } else {
            GateResult::Ok
        }
    }
}

pub struct MinNotionalGate {
    pub min_notional_usd: f64,
}

impl Gate for MinNotionalGate {
    fn name(&self) -> &'static str {
        "min_notional"
    }
    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        // Explicit quote wins; otherwise the sized budget decides.
        let notional = ctx.intent.quote_usd.unwrap_or(ctx.budget.size_usd);
        if notional < self.min_notional_usd {
            GateResult::Skip(SkipReason::SizeMin)
        } else {
            GateResult::Ok
        }
    }
}

// =============================================================================
// Chain
// =============================================================================

pub struct GuardChain {
    gates: Vec<Box<dyn Gate>>,
    bus: Arc<EventBus>,
}

impl GuardChain {
    /// Assemble the default chain. The explicit-context handles come from the
    /// runtime at startup; gates never reach into globals.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &GuardConfig,
        kill: Arc<AtomicBool>,
        quarantine: Arc<QuarantineRegistry>,
        cooldowns: Arc<Cooldowns>,
        depeg_flag: Arc<DepegFlag>,
        latency: Arc<LatencyWindow>,
        bus: Arc<EventBus>,
    ) -> Self {
        let gates: Vec<Box<dyn Gate>> = vec![
            Box::new(KillGate { kill }),
            Box::new(QuarantineGate {
                registry: quarantine,
            }),
            Box::new(CooldownGate { cooldowns }),
            Box::new(SpreadGate {
                max_spread_bps: cfg.max_spread_bps,
            }),
            Box::new(DepegGate { flag: depeg_flag }),
            Box::new(ExposureGate {
                max_symbol_exposure_usd: cfg.max_symbol_exposure_usd,
                max_total_exposure_usd: cfg.max_total_exposure_usd,
            }),
            Box::new(LatencyGate {
                window: latency,
                max_tick_to_order_ms: cfg.max_tick_to_order_ms,
            }),
            Box::new(DrawdownGate),
            Box::new(MinNotionalGate {
                min_notional_usd: cfg.min_notional_usd,
            }),
        ];
        Self { gates, bus }
    }

    /// Build a chain from an explicit gate list (tests, custom orderings).
    pub fn from_gates(gates: Vec<Box<dyn Gate>>, bus: Arc<EventBus>) -> Self {
        Self { gates, bus }
    }

    /// Evaluate the intent. Stops at the first rejecting gate; the rejection
    /// is announced on the bus for rollup counting.
    pub fn evaluate(&self, ctx: &GateContext<'_>) -> Result<(), SkipReason> {
        for gate in &self.gates {
            if let GateResult::Skip(reason) = gate.check(ctx) {
                debug!(
                    symbol = %ctx.intent.symbol,
                    gate = gate.name(),
                    reason = reason.tag(),
                    "intent rejected by guard chain"
                );
                self.bus.fire(
                    "event_bo.skip",
                    serde_json::json!({
                        "symbol": ctx.intent.symbol,
                        "reason": reason.tag().to_ascii_lowercase(),
                    }),
                );
                return Err(reason);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuarantineConfig;
    use crate::types::{IntentKind, Mode, Side};
    use std::sync::atomic::AtomicUsize;

    fn intent(symbol: &str) -> OrderIntent {
        OrderIntent {
            symbol: symbol.into(),
            side: Side::Buy,
            quote_usd: Some(1_000.0),
            quantity: None,
            limit_price: None,
            client_order_id: None,
            intent: IntentKind::Generic,
        }
    }

    fn snapshot(spread_bps: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            mark: 30_000.0,
            atr_pct: 0.01,
            spread_bps,
            book_depth_usd: 1_000_000.0,
            vol1m_usd: 1_000_000.0,
            funding_rate_8h: None,
            event_heat: 0.0,
            velocity: 0.0,
            liq_score: 0.8,
        }
    }

    fn budget() -> OrderBudget {
        OrderBudget {
            mode: Mode::Green,
            size_usd: 1_000.0,
            stop_pct: 0.01,
            max_positions: 10,
            risk_cap_sum_r: 0.09,
            daily_stop_pct: 0.075,
            peak_drawdown_stop_pct: 0.24,
        }
    }

    struct Ctx {
        intent: OrderIntent,
        snapshot: MarketSnapshot,
        account: AccountState,
        budget: OrderBudget,
    }

    impl Ctx {
        fn new() -> Self {
            Self {
                intent: intent("BTCUSDT"),
                snapshot: snapshot(5.0),
                account: AccountState {
                    equity_usd: 10_000.0,
                    ..Default::default()
                },
                budget: budget(),
            }
        }

        fn gate_ctx(&self) -> GateContext<'_> {
            GateContext {
                intent: &self.intent,
                snapshot: &self.snapshot,
                account: &self.account,
                budget: &self.budget,
                daily_loss_pct: 0.0,
                peak_drawdown_pct: 0.0,
                now: 1_000.0,
            }
        }
    }

    fn default_chain(kill: Arc<AtomicBool>) -> (GuardChain, Arc<Cooldowns>, Arc<QuarantineRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let quarantine = Arc::new(QuarantineRegistry::load(QuarantineConfig {
            max_stops_in_window: 2,
            window_sec: 3600.0,
            quarantine_sec: 14_400.0,
            path: dir
                .path()
                .join("q.json")
                .to_string_lossy()
                .into_owned(),
        }));
        // Leak the tempdir so the path stays writable for the test lifetime.
        std::mem::forget(dir);
        let cooldowns = Arc::new(Cooldowns::new(300.0));
        let cfg = GuardConfig {
            max_spread_bps: 25.0,
            cooldown_ttl_sec: 300.0,
            max_tick_to_order_ms: 1500.0,
            min_notional_usd: 10.0,
            max_symbol_exposure_usd: 50_000.0,
            max_total_exposure_usd: 250_000.0,
        };
        let chain = GuardChain::new(
            &cfg,
            kill,
            quarantine.clone(),
            cooldowns.clone(),
            Arc::new(DepegFlag::default()),
            Arc::new(LatencyWindow::new(400, "BINANCE")),
            Arc::new(EventBus::new(0)),
        );
        (chain, cooldowns, quarantine)
    }

    #[tokio::test]
    async fn clean_intent_passes_all_gates() {
        let (chain, _, _) = default_chain(Arc::new(AtomicBool::new(false)));
        let ctx = Ctx::new();
        assert!(chain.evaluate(&ctx.gate_ctx()).is_ok());
    }

    #[tokio::test]
    async fn kill_switch_wins_over_everything() {
        let (chain, cooldowns, quarantine) = default_chain(Arc::new(AtomicBool::new(true)));
        // Poison the later gates too; KILL must still be the reason.
        cooldowns.hit_at(&CooldownGate::key_for("BTCUSDT"), Some(600.0), 1_000.0);
        quarantine.record_stop_at("BTCUSDT", 999.0);
        quarantine.record_stop_at("BTCUSDT", 1_000.0);

        let ctx = Ctx::new();
        assert_eq!(chain.evaluate(&ctx.gate_ctx()), Err(SkipReason::Kill));
    }

    #[tokio::test]
    async fn quarantine_precedes_cooldown() {
        let (chain, cooldowns, quarantine) = default_chain(Arc::new(AtomicBool::new(false)));
        cooldowns.hit_at(&CooldownGate::key_for("BTCUSDT"), Some(600.0), 900.0);
        quarantine.record_stop_at("BTCUSDT", 999.0);
        quarantine.record_stop_at("BTCUSDT", 1_000.0);

        let ctx = Ctx::new();
        assert_eq!(chain.evaluate(&ctx.gate_ctx()), Err(SkipReason::Quarantine));
    }

    #[tokio::test]
    async fn spread_and_size_min_rejections() {
        let (chain, _, _) = default_chain(Arc::new(AtomicBool::new(false)));

        let mut wide = Ctx::new();
        wide.snapshot = snapshot(40.0);
        assert_eq!(chain.evaluate(&wide.gate_ctx()), Err(SkipReason::Spread));

        let mut dust = Ctx::new();
        dust.intent.quote_usd = Some(5.0);
        assert_eq!(chain.evaluate(&dust.gate_ctx()), Err(SkipReason::SizeMin));
    }

    #[tokio::test]
    async fn position_and_exposure_caps() {
        let (chain, _, _) = default_chain(Arc::new(AtomicBool::new(false)));

        let mut crowded = Ctx::new();
        crowded.account.open_positions = 10;
        assert_eq!(chain.evaluate(&crowded.gate_ctx()), Err(SkipReason::Pos));

        let mut risky = Ctx::new();
        risky.account.open_risk_sum_pct = 0.09;
        assert_eq!(chain.evaluate(&risky.gate_ctx()), Err(SkipReason::Exposure));

        let mut heavy = Ctx::new();
        heavy
            .account
            .exposure_by_symbol_usd
            .insert("BTCUSDT".into(), 49_900.0);
        assert_eq!(chain.evaluate(&heavy.gate_ctx()), Err(SkipReason::Exposure));
    }

    #[tokio::test]
    async fn drawdown_gate_uses_dynamic_limits() {
        let (chain, _, _) = default_chain(Arc::new(AtomicBool::new(false)));
        let ctx = Ctx::new();
        let gate_ctx = GateContext {
            daily_loss_pct: 0.08,
            ..ctx.gate_ctx()
        };
        assert_eq!(chain.evaluate(&gate_ctx), Err(SkipReason::Dd));
    }

    #[tokio::test]
    async fn short_circuit_stops_at_first_rejection() {
        // A counting gate placed after an always-reject gate must never run.
        struct CountingGate(Arc<AtomicUsize>);
        impl Gate for CountingGate {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn check(&self, _ctx: &GateContext<'_>) -> GateResult {
                self.0.fetch_add(1, Ordering::SeqCst);
                GateResult::Ok
            }
        }
        struct RejectGate;
        impl Gate for RejectGate {
            fn name(&self) -> &'static str {
                "reject"
            }
            fn check(&self, _ctx: &GateContext<'_>) -> GateResult {
                GateResult::Skip(SkipReason::Spread)
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let chain = GuardChain::from_gates(
            vec![
                Box::new(RejectGate),
                Box::new(CountingGate(calls.clone())),
            ],
            Arc::new(EventBus::new(0)),
        );

        let ctx = Ctx::new();
        assert_eq!(chain.evaluate(&ctx.gate_ctx()), Err(SkipReason::Spread));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rollup_key_spelling() {
        assert_eq!(SkipReason::SizeMin.rollup_key(), "skip_size_min");
        assert_eq!(SkipReason::Dd.rollup_key(), "skip_dd");
    }
}
