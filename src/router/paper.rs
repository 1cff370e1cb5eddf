// =============================================================================
// Paper Venue Adapter — in-process fills for dry runs and tests
// =============================================================================
//
// Fills market orders instantly at the seeded last price and tracks net
// positions with a volume-weighted average entry. Reduce-only orders clamp to
// the open quantity. No latency, no partial fills.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{OpenOrderInfo, OrderAck, PositionInfo, RouterError, RouterResult, VenueRouter};
use crate::types::Side;

#[derive(Default)]
struct PaperInner {
    last_prices: HashMap<String, f64>,
    /// symbol → (net qty signed, avg entry price)
    positions: HashMap<String, (f64, f64)>,
    open_orders: Vec<OpenOrderInfo>,
    trading_enabled: bool,
    preferred_quote: String,
}

pub struct PaperRouter {
    venue: String,
    inner: Mutex<PaperInner>,
}

impl PaperRouter {
    pub fn new(venue: &str) -> Self {
        Self {
            venue: venue.to_ascii_uppercase(),
            inner: Mutex::new(PaperInner {
                trading_enabled: true,
                preferred_quote: "USDT".to_string(),
                ..Default::default()
            }),
        }
    }

    /// Seed the mark used to fill subsequent orders.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.inner
            .lock()
            .last_prices
            .insert(symbol.to_ascii_uppercase(), price);
    }

    /// Net signed position for `symbol` (test observability).
    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.inner
            .lock()
            .positions
            .get(&symbol.to_ascii_uppercase())
            .map(|&(qty, _)| qty)
            .unwrap_or(0.0)
    }

    pub fn preferred_quote(&self) -> String {
        self.inner.lock().preferred_quote.clone()
    }

    pub fn trading_enabled(&self) -> bool {
        self.inner.lock().trading_enabled
    }

    fn fill(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        px: f64,
        reduce_only: bool,
    ) -> RouterResult<OrderAck> {
        let symbol = symbol.to_ascii_uppercase();
        let mut inner = self.inner.lock();
        // The trading flag halts new entries; reduce-only exits still pass.
        if !inner.trading_enabled && !reduce_only {
            return Err(RouterError::Blocked("trading disabled"));
        }

        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let entry = inner.positions.entry(symbol.clone()).or_insert((0.0, 0.0));
        let (cur_qty, cur_avg) = *entry;

        let applied = if reduce_only {
            // Clamp to the open quantity in the opposite direction.
            if cur_qty == 0.0 || cur_qty.signum() == signed.signum() {
                return Err(RouterError::Blocked("nothing to reduce"));
            }
            signed.abs().min(cur_qty.abs()) * signed.signum()
        } else {
            signed
        };

        let new_qty = cur_qty + applied;
        let new_avg = if new_qty == 0.0 {
            0.0
        } else if cur_qty.signum() == new_qty.signum() && new_qty.abs() > cur_qty.abs() {
            // Adding to the position: volume-weighted entry.
            (cur_avg * cur_qty.abs() + px * applied.abs()) / new_qty.abs()
        } else if cur_qty == 0.0 {
            px
        } else {
            cur_avg
        };
        *entry = (new_qty, new_avg);

        Ok(OrderAck {
            status: "FILLED".to_string(),
            avg_fill_price: px,
            filled_qty: applied.abs(),
            order_id: Some(Uuid::new_v4().to_string()),
            venue: self.venue.clone(),
        })
    }
}

#[async_trait]
impl VenueRouter for PaperRouter {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn get_last_price(&self, symbol: &str) -> RouterResult<Option<f64>> {
        Ok(self
            .inner
            .lock()
            .last_prices
            .get(&symbol.to_ascii_uppercase())
            .copied())
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        quote_usd: Option<f64>,
        quantity: Option<f64>,
        _client_order_id: Option<&str>,
    ) -> RouterResult<OrderAck> {
        let px = self
            .get_last_price(symbol)
            .await?
            .ok_or_else(|| RouterError::BadResponse("no paper price seeded".into()))?;
        let qty = match (quantity, quote_usd) {
            (Some(qty), _) => qty,
            (None, Some(quote)) => quote / px,
            (None, None) => return Err(RouterError::Blocked("no quote or quantity")),
        };
        self.fill(symbol, side, qty, px, false)
    }

    async fn place_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck> {
        // Paper fills the exit immediately at the limit.
        self.fill(symbol, side, qty, limit_px, true)
    }

    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        let px = self
            .get_last_price(symbol)
            .await?
            .ok_or_else(|| RouterError::BadResponse("no paper price seeded".into()))?;
        self.fill(symbol, side, qty, px, true)
    }

    async fn amend_stop_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        stop_px: f64,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        // Tracked as a resting order; paper never triggers stops.
        let mut inner = self.inner.lock();
        let order_id = Uuid::new_v4().to_string();
        inner.open_orders.push(OpenOrderInfo {
            symbol: symbol.to_ascii_uppercase(),
            side,
            order_id: order_id.clone(),
            price: stop_px,
            orig_qty: qty,
            executed_qty: 0.0,
        });
        Ok(OrderAck {
            status: "NEW".to_string(),
            avg_fill_price: 0.0,
            filled_qty: 0.0,
            order_id: Some(order_id),
            venue: self.venue.clone(),
        })
    }

    async fn place_limit_ioc(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck> {
        self.fill(symbol, side, qty, limit_px, false)
    }

    async fn list_positions(&self) -> RouterResult<Vec<PositionInfo>> {
        let inner = self.inner.lock();
        let mut out: Vec<PositionInfo> = inner
            .positions
            .iter()
            .filter(|(_, &(qty, _))| qty != 0.0)
            .map(|(symbol, &(qty, avg_price))| PositionInfo {
                symbol: symbol.clone(),
                qty,
                avg_price,
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(out)
    }

    async fn list_open_orders(&self) -> RouterResult<Vec<OpenOrderInfo>> {
        Ok(self.inner.lock().open_orders.clone())
    }

    async fn set_trading_enabled(&self, enabled: bool) {
        self.inner.lock().trading_enabled = enabled;
    }

    async fn set_preferred_quote(&self, asset: &str) -> RouterResult<()> {
        self.inner.lock().preferred_quote = asset.to_ascii_uppercase();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_order_fills_and_tracks_position() {
        let router = PaperRouter::new("PAPER");
        router.set_price("BTCUSDT", 30_000.0);

        let ack = router
            .place_market("BTCUSDT", Side::Buy, Some(3_000.0), None, None)
            .await
            .unwrap();
        assert_eq!(ack.status, "FILLED");
        assert!((ack.filled_qty - 0.1).abs() < 1e-9);
        assert!((router.position_qty("BTCUSDT") - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reduce_only_clamps_to_open_qty() {
        let router = PaperRouter::new("PAPER");
        router.set_price("ETHUSDT", 2_000.0);
        router
            .place_market("ETHUSDT", Side::Buy, None, Some(1.0), None)
            .await
            .unwrap();

        let ack = router
            .place_reduce_only_market("ETHUSDT", Side::Sell, 5.0)
            .await
            .unwrap();
        assert!((ack.filled_qty - 1.0).abs() < 1e-9);
        assert_eq!(router.position_qty("ETHUSDT"), 0.0);
    }

    #[tokio::test]
    async fn reduce_only_with_no_position_is_blocked() {
        let router = PaperRouter::new("PAPER");
        router.set_price("ETHUSDT", 2_000.0);
        let res = router
            .place_reduce_only_market("ETHUSDT", Side::Sell, 1.0)
            .await;
        assert!(matches!(res, Err(RouterError::Blocked(_))));
    }

    #[tokio::test]
    async fn disabled_trading_blocks_fills() {
        let router = PaperRouter::new("PAPER");
        router.set_price("BTCUSDT", 30_000.0);
        router.set_trading_enabled(false).await;
        let res = router
            .place_market("BTCUSDT", Side::Buy, Some(100.0), None, None)
            .await;
        assert!(matches!(res, Err(RouterError::Blocked(_))));
    }

    #[tokio::test]
    async fn averaging_into_a_position() {
        let router = PaperRouter::new("PAPER");
        router.set_price("BTCUSDT", 100.0);
        router
            .place_market("BTCUSDT", Side::Buy, None, Some(1.0), None)
            .await
            .unwrap();
        router.set_price("BTCUSDT", 200.0);
        router
            .place_market("BTCUSDT", Side::Buy, None, Some(1.0), None)
            .await
            .unwrap();

        let positions = router.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].avg_price - 150.0).abs() < 1e-9);
        assert!((positions[0].qty - 2.0).abs() < 1e-9);
    }
}
