// =============================================================================
// Order Router Contract — abstract venue capability set + registry
// =============================================================================
//
// The kernel never talks to a venue directly; everything goes through the
// `VenueRouter` capability set. Adapters are registered per venue suffix and
// selected by qualified symbol ("BTCUSDT.BINANCE" → the BINANCE adapter,
// fed "BTCUSDT"). Optional capabilities (`set_preferred_quote`,
// `place_limit_ioc`) default to a structured Unsupported error so callers can
// probe without downcasting.
// =============================================================================

pub mod binance;
pub mod paper;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::types::Side;

// =============================================================================
// Errors
// =============================================================================

/// Structured router failure surfaced to the caller. The guard chain never
/// retries these; re-entry is the strategy's concern.
#[derive(Debug)]
pub enum RouterError {
    /// The adapter does not implement this optional capability.
    Unsupported(&'static str),
    /// The venue rejected the request with its own error code.
    Venue { code: i64, message: String },
    /// Transport-level failure (connect, TLS, timeout).
    Transport(String),
    /// The request was blocked locally (trading disabled, stop amend gated).
    Blocked(&'static str),
    /// Response arrived but could not be interpreted.
    BadResponse(String),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported(cap) => write!(f, "capability not supported: {cap}"),
            Self::Venue { code, message } => write!(f, "venue error {code}: {message}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Blocked(reason) => write!(f, "blocked: {reason}"),
            Self::BadResponse(msg) => write!(f, "bad venue response: {msg}"),
        }
    }
}

impl std::error::Error for RouterError {}

pub type RouterResult<T> = Result<T, RouterError>;

// =============================================================================
// Wire types
// =============================================================================

/// Acknowledgement for a placed/amended order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub status: String,
    pub avg_fill_price: f64,
    pub filled_qty: f64,
    pub order_id: Option<String>,
    pub venue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenOrderInfo {
    pub symbol: String,
    pub side: Side,
    pub order_id: String,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
}

// =============================================================================
// Capability set
// =============================================================================

/// Venue adapter capability set. Symbols passed in are unqualified (suffix
/// already stripped by the registry).
#[async_trait]
pub trait VenueRouter: Send + Sync {
    fn venue(&self) -> &str;

    async fn get_last_price(&self, symbol: &str) -> RouterResult<Option<f64>>;

    /// Market order by quote notional or base quantity (exactly one set).
    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        quote_usd: Option<f64>,
        quantity: Option<f64>,
        client_order_id: Option<&str>,
    ) -> RouterResult<OrderAck>;

    async fn place_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck>;

    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
    ) -> RouterResult<OrderAck>;

    /// Place or move a reduce-only stop. Implementations must refuse with
    /// [`RouterError::Blocked`] unless stop amends are allowed by config.
    async fn amend_stop_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        stop_px: f64,
        qty: f64,
    ) -> RouterResult<OrderAck>;

    /// Optional: immediate-or-cancel limit order (fee-asset topups).
    async fn place_limit_ioc(
        &self,
        _symbol: &str,
        _side: Side,
        _qty: f64,
        _limit_px: f64,
    ) -> RouterResult<OrderAck> {
        Err(RouterError::Unsupported("place_limit_ioc"))
    }

    async fn list_positions(&self) -> RouterResult<Vec<PositionInfo>>;

    async fn list_open_orders(&self) -> RouterResult<Vec<OpenOrderInfo>>;

    /// Master switch; a disabled adapter rejects all placements locally.
    async fn set_trading_enabled(&self, enabled: bool);

    /// Optional: repoint quoting to another quote asset.
    async fn set_preferred_quote(&self, _asset: &str) -> RouterResult<()> {
        Err(RouterError::Unsupported("set_preferred_quote"))
    }
}

// =============================================================================
// Symbol qualification helpers
// =============================================================================

/// Split "BTCUSDT.BINANCE" into ("BTCUSDT", Some("BINANCE")).
pub fn split_qualified(symbol: &str) -> (String, Option<String>) {
    match symbol.split_once('.') {
        Some((base, venue)) if !venue.is_empty() => {
            (base.to_ascii_uppercase(), Some(venue.to_ascii_uppercase()))
        }
        _ => (symbol.to_ascii_uppercase(), None),
    }
}

/// "BTCUSDT" + "BINANCE" → "BTCUSDT.BINANCE"; already-qualified symbols pass
/// through unchanged.
pub fn qualify(symbol: &str, venue: &str) -> String {
    if symbol.contains('.') {
        symbol.to_ascii_uppercase()
    } else {
        format!("{}.{}", symbol.to_ascii_uppercase(), venue.to_ascii_uppercase())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps venue suffixes (and optional per-symbol overrides) to adapters.
pub struct RouterRegistry {
    adapters: HashMap<String, Arc<dyn VenueRouter>>,
    symbol_overrides: HashMap<String, String>,
    default_venue: String,
}

impl RouterRegistry {
    pub fn new(default_venue: &str) -> Self {
        Self {
            adapters: HashMap::new(),
            symbol_overrides: HashMap::new(),
            default_venue: default_venue.to_ascii_uppercase(),
        }
    }

    pub fn register(&mut self, venue: &str, adapter: Arc<dyn VenueRouter>) {
        self.adapters.insert(venue.to_ascii_uppercase(), adapter);
    }

    /// Pin an unqualified symbol to a venue regardless of the default.
    pub fn pin_symbol(&mut self, symbol: &str, venue: &str) {
        self.symbol_overrides
            .insert(symbol.to_ascii_uppercase(), venue.to_ascii_uppercase());
    }

    pub fn default_venue(&self) -> &str {
        &self.default_venue
    }

    /// Resolve a (possibly qualified) symbol to its adapter and base symbol.
    pub fn resolve(&self, symbol: &str) -> RouterResult<(Arc<dyn VenueRouter>, String)> {
        let (base, venue) = split_qualified(symbol);
        let venue = venue
            .or_else(|| self.symbol_overrides.get(&base).cloned())
            .unwrap_or_else(|| self.default_venue.clone());
        match self.adapters.get(&venue) {
            Some(adapter) => Ok((adapter.clone(), base)),
            None => Err(RouterError::Unsupported("no adapter for venue")),
        }
    }

    /// Adapter for the default venue, for venue-wide operations (kill switch,
    /// quote switching, position enumeration).
    pub fn default_adapter(&self) -> RouterResult<Arc<dyn VenueRouter>> {
        self.adapters
            .get(&self.default_venue)
            .cloned()
            .ok_or(RouterError::Unsupported("no adapter for default venue"))
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn VenueRouter>> {
        self.adapters.values()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::paper::PaperRouter;

    #[test]
    fn qualification_roundtrip() {
        assert_eq!(split_qualified("btcusdt.binance"), ("BTCUSDT".into(), Some("BINANCE".into())));
        assert_eq!(split_qualified("ETHUSDT"), ("ETHUSDT".into(), None));
        assert_eq!(qualify("btcusdt", "binance"), "BTCUSDT.BINANCE");
        assert_eq!(qualify("BTCUSDT.BYBIT", "BINANCE"), "BTCUSDT.BYBIT");
    }

    #[tokio::test]
    async fn registry_resolves_default_override_and_suffix() {
        let mut registry = RouterRegistry::new("BINANCE");
        registry.register("BINANCE", Arc::new(PaperRouter::new("BINANCE")));
        registry.register("BYBIT", Arc::new(PaperRouter::new("BYBIT")));
        registry.pin_symbol("SOLUSDT", "BYBIT");

        let (adapter, base) = registry.resolve("BTCUSDT").unwrap();
        assert_eq!(adapter.venue(), "BINANCE");
        assert_eq!(base, "BTCUSDT");

        let (adapter, _) = registry.resolve("SOLUSDT").unwrap();
        assert_eq!(adapter.venue(), "BYBIT");

        let (adapter, base) = registry.resolve("ethusdt.bybit").unwrap();
        assert_eq!(adapter.venue(), "BYBIT");
        assert_eq!(base, "ETHUSDT");

        assert!(registry.resolve("BTCUSDT.KRAKEN").is_err());
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_unsupported() {
        struct Minimal;
        #[async_trait]
        impl VenueRouter for Minimal {
            fn venue(&self) -> &str {
                "TEST"
            }
            async fn get_last_price(&self, _s: &str) -> RouterResult<Option<f64>> {
                Ok(None)
            }
            async fn place_market(
                &self,
                _s: &str,
                _side: Side,
                _q: Option<f64>,
                _qty: Option<f64>,
                _id: Option<&str>,
            ) -> RouterResult<OrderAck> {
                Err(RouterError::Blocked("test"))
            }
            async fn place_reduce_only_limit(
                &self,
                _s: &str,
                _side: Side,
                _qty: f64,
                _px: f64,
            ) -> RouterResult<OrderAck> {
                Err(RouterError::Blocked("test"))
            }
            async fn place_reduce_only_market(
                &self,
                _s: &str,
                _side: Side,
                _qty: f64,
            ) -> RouterResult<OrderAck> {
                Err(RouterError::Blocked("test"))
            }
            async fn amend_stop_reduce_only(
                &self,
                _s: &str,
                _side: Side,
                _px: f64,
                _qty: f64,
            ) -> RouterResult<OrderAck> {
                Err(RouterError::Blocked("test"))
            }
            async fn list_positions(&self) -> RouterResult<Vec<PositionInfo>> {
                Ok(vec![])
            }
            async fn list_open_orders(&self) -> RouterResult<Vec<OpenOrderInfo>> {
                Ok(vec![])
            }
            async fn set_trading_enabled(&self, _enabled: bool) {}
        }

        let r = Minimal;
        assert!(matches!(
            r.set_preferred_quote("USDC").await,
            Err(RouterError::Unsupported(_))
        ));
        assert!(matches!(
            r.place_limit_ioc("BNBUSDT", Side::Buy, 1.0, 500.0).await,
            Err(RouterError::Unsupported(_))
        ));
    }
}
