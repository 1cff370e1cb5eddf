// =============================================================================
// Binance Venue Adapters — HMAC-SHA256 signed REST, spot and futures
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
//
// Both adapters share `SignedClient`; they differ in base URL, path prefix,
// and how reduce-only intent is expressed (futures has a native reduceOnly
// flag; on spot an exit is just an opposite-side order).
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{OpenOrderInfo, OrderAck, PositionInfo, RouterError, RouterResult, VenueRouter};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// =============================================================================
// Signed REST core
// =============================================================================

#[derive(Clone)]
pub struct SignedClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl SignedClient {
    pub fn new(
        api_key: &str,
        secret: &str,
        base_url: &str,
        timeout_sec: u64,
    ) -> anyhow::Result<Self> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(timeout_sec))
            .build()?;
        Ok(Self {
            secret: secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> RouterResult<serde_json::Value> {
        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| RouterError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RouterError::BadResponse(e.to_string()))?;

        if !status.is_success() {
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
            let message = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown venue error")
                .to_string();
            return Err(RouterError::Venue { code, message });
        }
        Ok(body)
    }
}

fn fmt_qty(qty: f64) -> String {
    format!("{qty:.8}")
}

fn parse_str_f64(val: &serde_json::Value) -> f64 {
    val.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| val.as_f64())
        .unwrap_or(0.0)
}

/// Parse a Binance order response into an [`OrderAck`], deriving the average
/// fill price from cumulative quote over executed qty when present.
fn parse_ack(body: &serde_json::Value, venue: &str) -> OrderAck {
    let executed_qty = parse_str_f64(&body["executedQty"]);
    let cumulative_quote = parse_str_f64(&body["cummulativeQuoteQty"]);
    let avg = if executed_qty > 0.0 && cumulative_quote > 0.0 {
        cumulative_quote / executed_qty
    } else {
        parse_str_f64(&body["avgPrice"])
    };
    OrderAck {
        status: body["status"].as_str().unwrap_or("UNKNOWN").to_string(),
        avg_fill_price: avg,
        filled_qty: executed_qty,
        order_id: body["orderId"].as_i64().map(|id| id.to_string()),
        venue: venue.to_string(),
    }
}

// =============================================================================
// Spot adapter
// =============================================================================

pub struct BinanceSpotRouter {
    client: SignedClient,
    trading_enabled: AtomicBool,
    allow_stop_amend: bool,
    preferred_quote: parking_lot::Mutex<String>,
}

impl BinanceSpotRouter {
    pub fn new(client: SignedClient, allow_stop_amend: bool) -> Self {
        Self {
            client,
            trading_enabled: AtomicBool::new(true),
            allow_stop_amend,
            preferred_quote: parking_lot::Mutex::new("USDT".to_string()),
        }
    }

    fn ensure_enabled(&self) -> RouterResult<()> {
        if self.trading_enabled.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RouterError::Blocked("trading disabled"))
        }
    }
}

#[async_trait]
impl VenueRouter for BinanceSpotRouter {
    fn venue(&self) -> &str {
        "BINANCE"
    }

    async fn get_last_price(&self, symbol: &str) -> RouterResult<Option<f64>> {
        let params = format!("symbol={symbol}");
        let body = self
            .client
            .send(reqwest::Method::GET, "/api/v3/ticker/price", &params, false)
            .await?;
        let px = parse_str_f64(&body["price"]);
        Ok((px > 0.0).then_some(px))
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        quote_usd: Option<f64>,
        quantity: Option<f64>,
        client_order_id: Option<&str>,
    ) -> RouterResult<OrderAck> {
        self.ensure_enabled()?;
        let mut params = format!("symbol={symbol}&side={side}&type=MARKET");
        match (quote_usd, quantity) {
            (Some(quote), _) => params.push_str(&format!("&quoteOrderQty={quote:.2}")),
            (None, Some(qty)) => params.push_str(&format!("&quantity={}", fmt_qty(qty))),
            (None, None) => return Err(RouterError::Blocked("no quote or quantity")),
        }
        if let Some(id) = client_order_id {
            params.push_str(&format!("&newClientOrderId={id}"));
        }
        debug!(symbol, %side, "placing spot market order");
        let body = self
            .client
            .send(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn place_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck> {
        // Exits bypass the trading flag; it only halts new entries.
        // Spot has no reduce-only flag; the exit leg is an opposite-side GTC.
        let params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&quantity={}&price={limit_px}",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn amend_stop_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        stop_px: f64,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        if !self.allow_stop_amend {
            return Err(RouterError::Blocked("stop amend disabled"));
        }
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_LOSS_LIMIT&timeInForce=GTC&quantity={}&stopPrice={stop_px}&price={stop_px}",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn place_limit_ioc(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck> {
        self.ensure_enabled()?;
        let params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=IOC&quantity={}&price={limit_px}",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/api/v3/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn list_positions(&self) -> RouterResult<Vec<PositionInfo>> {
        // Spot "positions" are non-quote balances.
        let body = self
            .client
            .send(reqwest::Method::GET, "/api/v3/account", "", true)
            .await?;
        let balances = body["balances"]
            .as_array()
            .ok_or_else(|| RouterError::BadResponse("missing balances".into()))?;
        let preferred = self.preferred_quote.lock().clone();
        let positions = balances
            .iter()
            .filter_map(|b| {
                let asset = b["asset"].as_str()?;
                let free = parse_str_f64(&b["free"]);
                let locked = parse_str_f64(&b["locked"]);
                let qty = free + locked;
                if qty <= 0.0 || asset == preferred {
                    return None;
                }
                Some(PositionInfo {
                    symbol: format!("{asset}{preferred}"),
                    qty,
                    avg_price: 0.0,
                })
            })
            .collect();
        Ok(positions)
    }

    async fn list_open_orders(&self) -> RouterResult<Vec<OpenOrderInfo>> {
        let body = self
            .client
            .send(reqwest::Method::GET, "/api/v3/openOrders", "", true)
            .await?;
        let orders = body
            .as_array()
            .ok_or_else(|| RouterError::BadResponse("openOrders is not an array".into()))?;
        Ok(orders
            .iter()
            .filter_map(|o| {
                Some(OpenOrderInfo {
                    symbol: o["symbol"].as_str()?.to_string(),
                    side: o["side"].as_str()?.parse().ok()?,
                    order_id: o["orderId"].as_i64()?.to_string(),
                    price: parse_str_f64(&o["price"]),
                    orig_qty: parse_str_f64(&o["origQty"]),
                    executed_qty: parse_str_f64(&o["executedQty"]),
                })
            })
            .collect())
    }

    async fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::Relaxed);
        warn!(enabled, venue = self.venue(), "trading flag changed");
    }

    async fn set_preferred_quote(&self, asset: &str) -> RouterResult<()> {
        *self.preferred_quote.lock() = asset.to_ascii_uppercase();
        warn!(asset, "preferred quote switched");
        Ok(())
    }
}

// =============================================================================
// Futures adapter
// =============================================================================

pub struct BinanceFuturesRouter {
    client: SignedClient,
    trading_enabled: AtomicBool,
    allow_stop_amend: bool,
}

impl BinanceFuturesRouter {
    pub fn new(client: SignedClient, allow_stop_amend: bool) -> Self {
        Self {
            client,
            trading_enabled: AtomicBool::new(true),
            allow_stop_amend,
        }
    }

    fn ensure_enabled(&self) -> RouterResult<()> {
        if self.trading_enabled.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RouterError::Blocked("trading disabled"))
        }
    }
}

#[async_trait]
impl VenueRouter for BinanceFuturesRouter {
    fn venue(&self) -> &str {
        "BINANCE_FUTURES"
    }

    async fn get_last_price(&self, symbol: &str) -> RouterResult<Option<f64>> {
        let params = format!("symbol={symbol}");
        let body = self
            .client
            .send(reqwest::Method::GET, "/fapi/v1/ticker/price", &params, false)
            .await?;
        let px = parse_str_f64(&body["price"]);
        Ok((px > 0.0).then_some(px))
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        quote_usd: Option<f64>,
        quantity: Option<f64>,
        client_order_id: Option<&str>,
    ) -> RouterResult<OrderAck> {
        self.ensure_enabled()?;
        // Futures has no quoteOrderQty; convert quote notional via last price.
        let qty = match (quantity, quote_usd) {
            (Some(qty), _) => qty,
            (None, Some(quote)) => {
                let px = self
                    .get_last_price(symbol)
                    .await?
                    .ok_or_else(|| RouterError::BadResponse("no mark for sizing".into()))?;
                quote / px
            }
            (None, None) => return Err(RouterError::Blocked("no quote or quantity")),
        };
        let mut params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}",
            fmt_qty(qty)
        );
        if let Some(id) = client_order_id {
            params.push_str(&format!("&newClientOrderId={id}"));
        }
        debug!(symbol, %side, "placing futures market order");
        let body = self
            .client
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn place_reduce_only_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_px: f64,
    ) -> RouterResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&quantity={}&price={limit_px}&reduceOnly=true",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn place_reduce_only_market(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}&reduceOnly=true",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn amend_stop_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        stop_px: f64,
        qty: f64,
    ) -> RouterResult<OrderAck> {
        if !self.allow_stop_amend {
            return Err(RouterError::Blocked("stop amend disabled"));
        }
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_px}&quantity={}&reduceOnly=true",
            fmt_qty(qty)
        );
        let body = self
            .client
            .send(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        Ok(parse_ack(&body, self.venue()))
    }

    async fn list_positions(&self) -> RouterResult<Vec<PositionInfo>> {
        let body = self
            .client
            .send(reqwest::Method::GET, "/fapi/v2/positionRisk", "", true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| RouterError::BadResponse("positionRisk is not an array".into()))?;
        Ok(rows
            .iter()
            .filter_map(|p| {
                let qty = parse_str_f64(&p["positionAmt"]);
                if qty == 0.0 {
                    return None;
                }
                Some(PositionInfo {
                    symbol: p["symbol"].as_str()?.to_string(),
                    qty,
                    avg_price: parse_str_f64(&p["entryPrice"]),
                })
            })
            .collect())
    }

    async fn list_open_orders(&self) -> RouterResult<Vec<OpenOrderInfo>> {
        let body = self
            .client
            .send(reqwest::Method::GET, "/fapi/v1/openOrders", "", true)
            .await?;
        let orders = body
            .as_array()
            .ok_or_else(|| RouterError::BadResponse("openOrders is not an array".into()))?;
        Ok(orders
            .iter()
            .filter_map(|o| {
                Some(OpenOrderInfo {
                    symbol: o["symbol"].as_str()?.to_string(),
                    side: o["side"].as_str()?.parse().ok()?,
                    order_id: o["orderId"].as_i64()?.to_string(),
                    price: parse_str_f64(&o["price"]),
                    orig_qty: parse_str_f64(&o["origQty"]),
                    executed_qty: parse_str_f64(&o["executedQty"]),
                })
            })
            .collect())
    }

    async fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::Relaxed);
        warn!(enabled, venue = self.venue(), "trading flag changed");
    }
}

impl std::fmt::Debug for SignedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client =
            SignedClient::new("key", "secret", "https://api.binance.com", 5).unwrap();
        let sig = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, client.sign("symbol=BTCUSDT&side=SELL"));
    }

    #[test]
    fn ack_parses_cumulative_quote_average() {
        let body = serde_json::json!({
            "status": "FILLED",
            "executedQty": "0.50000000",
            "cummulativeQuoteQty": "15000.00000000",
            "orderId": 42,
        });
        let ack = parse_ack(&body, "BINANCE");
        assert_eq!(ack.status, "FILLED");
        assert_eq!(ack.filled_qty, 0.5);
        assert_eq!(ack.avg_fill_price, 30_000.0);
        assert_eq!(ack.order_id.as_deref(), Some("42"));
    }

    #[test]
    fn ack_falls_back_to_avg_price_field() {
        let body = serde_json::json!({
            "status": "NEW",
            "executedQty": "0",
            "avgPrice": "101.5",
            "orderId": 7,
        });
        let ack = parse_ack(&body, "BINANCE_FUTURES");
        assert_eq!(ack.filled_qty, 0.0);
        assert_eq!(ack.avg_fill_price, 101.5);
    }

    #[tokio::test]
    async fn stop_amend_gated_by_config() {
        let client =
            SignedClient::new("key", "secret", "https://api.binance.com", 5).unwrap();
        let router = BinanceSpotRouter::new(client, false);
        let res = router
            .amend_stop_reduce_only("BTCUSDT", Side::Sell, 29_910.0, 0.1)
            .await;
        assert!(matches!(res, Err(RouterError::Blocked(_))));
    }

    #[tokio::test]
    async fn disabled_trading_blocks_locally() {
        let client =
            SignedClient::new("key", "secret", "https://api.binance.com", 5).unwrap();
        let router = BinanceSpotRouter::new(client, true);
        router.set_trading_enabled(false).await;
        let res = router
            .place_market("BTCUSDT", Side::Buy, Some(100.0), None, None)
            .await;
        assert!(matches!(res, Err(RouterError::Blocked(_))));
    }
}
