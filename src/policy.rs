// =============================================================================
// Dynamic Sizing Policy — regime → mode → size/stop/concurrency/drawdown
// =============================================================================
//
// Pure functions, no I/O. The numeric constants here are contract: the guard
// chain, allocator, and digests all assume these exact tables. `compute_order`
// bundles the individual derivations into one budget for a single intent.
// =============================================================================

use serde::Serialize;

use crate::types::{
    AccountState, MarketSnapshot, Mode, RegimeSignal, StrategyContext, StrategyKind, Timeframe,
    VolState,
};

/// Everything the execution path needs to know about one prospective order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBudget {
    pub mode: Mode,
    pub size_usd: f64,
    pub stop_pct: f64,
    pub max_positions: u32,
    pub risk_cap_sum_r: f64,
    pub daily_stop_pct: f64,
    pub peak_drawdown_stop_pct: f64,
}

/// Map a regime signal to a risk posture.
///
/// Score bands: green at >= 0.65, red at <= -0.35, yellow between.
pub fn choose_mode(regime: &RegimeSignal) -> Mode {
    let mut score = 0.0;
    score += (regime.p_win_1h - 0.5) * 2.0;
    score += 0.8 * regime.pnl_slope_1h.tanh();
    score += 0.5 * (regime.breadth_up_pct - 0.5) * 2.0;
    score += match regime.volatility_state {
        VolState::High => 0.15,
        VolState::Med => 0.0,
        VolState::Low => -0.10,
    };
    score -= 0.8 * (regime.drawdown_pct_7d - 0.10).max(0.0);

    if score >= 0.65 {
        Mode::Green
    } else if score <= -0.35 {
        Mode::Red
    } else {
        Mode::Yellow
    }
}

/// Per-trade risk as a fraction of equity, from the (strategy type, mode)
/// table, adjusted by base timeframe and floored at 5 bps.
pub fn per_trade_risk_pct(mode: Mode, strat: &StrategyContext) -> f64 {
    let base: f64 = match (strat.kind, mode) {
        (StrategyKind::Scalp, Mode::Red) => 0.004,
        (StrategyKind::Scalp, Mode::Yellow) => 0.008,
        (StrategyKind::Scalp, Mode::Green) => 0.012,
        (StrategyKind::Momentum, Mode::Red) => 0.006,
        (StrategyKind::Momentum, Mode::Yellow) => 0.012,
        (StrategyKind::Momentum, Mode::Green) => 0.018,
        (StrategyKind::Trend, Mode::Red) => 0.007,
        (StrategyKind::Trend, Mode::Yellow) => 0.015,
        (StrategyKind::Trend, Mode::Green) => 0.022,
        (StrategyKind::Event, Mode::Red) => 0.003,
        (StrategyKind::Event, Mode::Yellow) => 0.007,
        (StrategyKind::Event, Mode::Green) => 0.012,
    };
    let tf_adj = match strat.base_timeframe {
        Timeframe::M1 => -0.0015,
        Timeframe::M5 => -0.001,
        Timeframe::M15 => 0.0,
        Timeframe::H1 => 0.001,
        Timeframe::H4 => 0.002,
    };
    (base + tf_adj).max(0.0005)
}

/// Stop distance as a fraction of price, ATR-scaled with spread/liquidity/
/// event-heat adjustments on the multiplier.
pub fn target_stop_pct(strat: &StrategyContext, mkt: &MarketSnapshot) -> f64 {
    let k_base = match strat.kind {
        StrategyKind::Scalp => 0.9,
        StrategyKind::Momentum => 1.2,
        StrategyKind::Trend => 1.6,
        StrategyKind::Event => 1.3,
    };
    let spread_penalty = (mkt.spread_bps / 10_000.0 * 5.0).min(0.5);
    let liq_bonus = 0.2 * mkt.liq_score;
    let heat_bonus = match strat.kind {
        StrategyKind::Momentum | StrategyKind::Event => -0.2 * mkt.event_heat,
        _ => 0.0,
    };
    let k = (k_base + spread_penalty - liq_bonus + heat_bonus).max(0.6);
    (k * mkt.atr_pct.max(0.001)).max(0.002)
}

fn mode_risk_cap(mode: Mode) -> f64 {
    match mode {
        Mode::Green => 0.10,
        Mode::Yellow => 0.06,
        Mode::Red => 0.03,
    }
}

fn mode_impact_cap(mode: Mode) -> f64 {
    match mode {
        Mode::Green => 0.02,
        Mode::Yellow => 0.015,
        Mode::Red => 0.01,
    }
}

/// `(size_usd, stop_pct)` for one order: risk-based size, capped by liquidity
/// impact, degraded by a spread/liquidity quality factor.
pub fn dynamic_position_notional_usd(
    mode: Mode,
    strat: &StrategyContext,
    mkt: &MarketSnapshot,
    acct: &AccountState,
) -> (f64, f64) {
    let stop_pct = target_stop_pct(strat, mkt);
    let risk_pct = per_trade_risk_pct(mode, strat);
    let free_risk = (mode_risk_cap(mode) - acct.open_risk_sum_pct).max(0.0);
    let risk_use = risk_pct.min(if free_risk > 0.0 {
        free_risk
    } else {
        risk_pct * 0.5
    });
    let risk_usd = acct.equity_usd * risk_use;
    let size_by_risk = risk_usd / stop_pct.max(1e-6);
    let size_by_liquidity = mode_impact_cap(mode) * mkt.vol1m_usd;
    let quality = (1.0 - mkt.spread_bps / 50.0).clamp(0.05, 1.0) * (0.5 + 0.5 * mkt.liq_score);
    let size_usd = (size_by_risk * quality).min(size_by_liquidity);
    (size_usd.max(0.0), stop_pct)
}

/// `(max_positions, residual_risk_cap)` for the current mode and account.
/// Position headroom scales with equity; the residual cap decays as open
/// positions exceed the scaled limit.
pub fn dynamic_concurrent_limits(mode: Mode, acct: &AccountState) -> (u32, f64) {
    let base_positions = match mode {
        Mode::Red => 3.0,
        Mode::Yellow => 6.0,
        Mode::Green => 10.0,
    };
    let base_risk_cap = match mode {
        Mode::Red => 0.03,
        Mode::Yellow => 0.06,
        Mode::Green => 0.09,
    };
    let scale = 1.0 + ((acct.equity_usd / 2000.0).max(1.0).log10() * 0.25).min(0.5);
    let positions = ((base_positions * scale) as u32).max(1);
    let excess = acct.open_positions.saturating_sub(positions) as f64;
    let residual_cap = (base_risk_cap - 0.004 * excess).max(0.01);
    (positions, residual_cap)
}

/// `(daily_stop_pct, peak_drawdown_stop_pct)`: mode baselines squeezed by 7d
/// drawdown stress and widened slightly when the regime signal is decisive.
pub fn dynamic_drawdown_limits(mode: Mode, regime: &RegimeSignal) -> (f64, f64) {
    let base_daily = match mode {
        Mode::Red => 0.035,
        Mode::Yellow => 0.055,
        Mode::Green => 0.075,
    };
    let base_peak = match mode {
        Mode::Red => 0.12,
        Mode::Yellow => 0.18,
        Mode::Green => 0.24,
    };
    let stress = (regime.drawdown_pct_7d - 0.08).max(0.0);
    let pvar = (regime.p_win_1h - 0.5).abs();
    let daily = (base_daily - 0.015 * stress + 0.01 * pvar).max(0.02);
    let peak = (base_peak - 0.10 * stress + 0.05 * pvar).max(0.10);
    (daily, peak)
}

/// Bundle the individual derivations into one order budget.
pub fn compute_order(
    strat: &StrategyContext,
    mkt: &MarketSnapshot,
    acct: &AccountState,
    regime: &RegimeSignal,
) -> OrderBudget {
    let mode = choose_mode(regime);
    let (size_usd, stop_pct) = dynamic_position_notional_usd(mode, strat, mkt, acct);
    let (max_positions, risk_cap_sum_r) = dynamic_concurrent_limits(mode, acct);
    let (daily_stop_pct, peak_drawdown_stop_pct) = dynamic_drawdown_limits(mode, regime);
    OrderBudget {
        mode,
        size_usd,
        stop_pct,
        max_positions,
        risk_cap_sum_r,
        daily_stop_pct,
        peak_drawdown_stop_pct,
    }
}
