// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Current UNIX time in fractional seconds.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that reduces a position opened with `self`.
    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("invalid side: '{other}'"),
        }
    }
}

/// What an order is for; brackets carry their leg so downstream handlers can
/// tell an exit apart from a fresh entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentKind {
    Generic,
    BracketTp,
    BracketSl,
}

impl Default for IntentKind {
    fn default() -> Self {
        Self::Generic
    }
}

/// A desired order produced by a strategy and evaluated by the guard chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    /// Quote-notional in USD. Exactly one of `quote_usd` / `quantity` should
    /// be set; the router forwards whichever is present.
    #[serde(default)]
    pub quote_usd: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub intent: IntentKind,
}

/// Live per-symbol market features consumed by the sizing policy and gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub mark: f64,
    pub atr_pct: f64,
    pub spread_bps: f64,
    /// Book depth in USD within ±10 bps of mid.
    pub book_depth_usd: f64,
    pub vol1m_usd: f64,
    #[serde(default)]
    pub funding_rate_8h: Option<f64>,
    #[serde(default)]
    pub event_heat: f64,
    #[serde(default)]
    pub velocity: f64,
    #[serde(default)]
    pub liq_score: f64,
}

/// Account-level aggregates fed into sizing and exposure gates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub equity_usd: f64,
    /// Sum of open per-trade risks as a fraction of equity.
    pub open_risk_sum_pct: f64,
    pub open_positions: u32,
    pub exposure_total_usd: f64,
    #[serde(default)]
    pub exposure_by_symbol_usd: std::collections::HashMap<String, f64>,
}

/// Scalar summary of recent market/portfolio behavior feeding mode selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSignal {
    pub p_win_1h: f64,
    pub pnl_slope_1h: f64,
    pub drawdown_pct_7d: f64,
    pub breadth_up_pct: f64,
    pub volatility_state: VolState,
}

impl Default for RegimeSignal {
    fn default() -> Self {
        Self {
            p_win_1h: 0.5,
            pnl_slope_1h: 0.0,
            drawdown_pct_7d: 0.0,
            breadth_up_pct: 0.5,
            volatility_state: VolState::Med,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolState {
    Low,
    Med,
    High,
}

/// Categorical risk posture derived from regime signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Red,
    Yellow,
    Green,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Red => write!(f, "red"),
            Self::Yellow => write!(f, "yellow"),
            Self::Green => write!(f, "green"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(Self::Red),
            "yellow" => Ok(Self::Yellow),
            "green" => Ok(Self::Green),
            other => anyhow::bail!("invalid mode: '{other}'"),
        }
    }
}

/// Strategy archetype used for risk-table lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Scalp,
    Momentum,
    Trend,
    Event,
}

/// Base timeframe of a strategy; adjusts per-trade risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

/// Identity and shape of the strategy submitting an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContext {
    pub name: String,
    pub kind: StrategyKind,
    pub base_timeframe: Timeframe,
    pub leverage_allowed: bool,
    pub priority: u8,
}

/// Executed (partial or complete) order notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub ts: f64,
    pub symbol: String,
    pub side: Side,
    pub avg_price: f64,
    pub filled_qty: f64,
    pub venue: String,
    #[serde(default)]
    pub intent: IntentKind,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// A raw order update from a venue user stream, before translation into a
/// [`FillEvent`].
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub event: String,
    pub execution_type: String,
    pub symbol: String,
    pub side: String,
    pub last_filled_qty: f64,
    pub last_filled_price: f64,
    pub event_time_ms: i64,
    pub order_id: Option<String>,
    pub venue: String,
}

/// Health state carried on `health.state` bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Ok = 0,
    Degraded = 1,
    Halted = 2,
}

impl HealthState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Degraded),
            2 => Some(Self::Halted),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Degraded => "DEGRADED",
            Self::Halted => "HALTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_roundtrip_and_opposite() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("HOLD".parse::<Side>().is_err());
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn mode_parses_case_insensitive() {
        assert_eq!("GREEN".parse::<Mode>().unwrap(), Mode::Green);
        assert!("blue".parse::<Mode>().is_err());
    }

    #[test]
    fn health_state_codes() {
        assert_eq!(HealthState::from_code(2), Some(HealthState::Halted));
        assert_eq!(HealthState::from_code(7), None);
        assert_eq!(HealthState::Degraded.label(), "DEGRADED");
    }

    #[test]
    fn intent_deserialises_with_defaults() {
        let json = r#"{ "symbol": "BTCUSDT", "side": "BUY", "quote_usd": 100.0 }"#;
        let intent: OrderIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.intent, IntentKind::Generic);
        assert!(intent.quantity.is_none());
        assert_eq!(intent.quote_usd, Some(100.0));
    }
}
