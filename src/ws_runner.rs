// =============================================================================
// WS Runner — resilient wrapper around a venue order/execution stream
// =============================================================================
//
// Generic over the stream source: a factory yields a stream of order updates,
// each update is forwarded to the handler, and any termination (error or
// clean end) reconnects with jittered backoff. Health signals ride the bus
// when enabled:
//
//   connect    → health.state {state: 0, reason: "ws_connected"}
//   disconnect → health.state {state: 1, reason: "ws_disconnected"}
//   silence    → health.state {state: 1, reason: "ws_silent"} after
//                WS_DISCONNECT_ALERT_SEC without an update (once per episode).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::WsConfig;
use crate::types::OrderUpdate;

#[async_trait]
pub trait OrderUpdateStream: Send {
    /// Next update, `Ok(None)` on clean stream end.
    async fn next_update(&mut self) -> Result<Option<OrderUpdate>>;
}

pub type StreamFactory = Box<
    dyn Fn() -> BoxFuture<'static, Result<Box<dyn OrderUpdateStream>>> + Send + Sync + 'static,
>;

pub type UpdateHandler = Arc<dyn Fn(OrderUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct WsRunner {
    factory: StreamFactory,
    on_update: UpdateHandler,
    bus: Arc<EventBus>,
    cfg: WsConfig,
}

impl WsRunner {
    pub fn new(
        factory: StreamFactory,
        on_update: UpdateHandler,
        bus: Arc<EventBus>,
        cfg: WsConfig,
    ) -> Self {
        Self {
            factory,
            on_update,
            bus,
            cfg,
        }
    }

    fn fire_health(&self, state: u8, reason: &str) {
        if !self.cfg.health_enabled {
            return;
        }
        self.bus.fire(
            "health.state",
            serde_json::json!({ "state": state, "reason": reason }),
        );
    }

    /// Run until shutdown. Never returns an error — reconnection is the whole
    /// point; the supervisor only sees a clean exit on shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let backoffs = &self.cfg.reconnect_backoff_ms;
        let mut attempt: usize = 0;

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let connected_at = std::time::Instant::now();
            match (self.factory)().await {
                Ok(mut stream) => {
                    info!("ws connected");
                    self.fire_health(0, "ws_connected");
                    attempt = 0;

                    self.consume(&mut stream, &mut shutdown_rx).await;
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                    self.fire_health(1, "ws_disconnected");
                    if connected_at.elapsed().as_secs() >= 60 {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "ws connect failed");
                    self.fire_health(1, "ws_disconnected");
                }
            }

            let step = backoffs[attempt.min(backoffs.len() - 1)];
            attempt += 1;
            let jitter = rand::thread_rng().gen_range(0..200);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(step + jitter)) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    /// Drain one connection until it ends, errors, or shutdown. The silence
    /// watchdog fires `ws_silent` once per quiet episode and keeps waiting.
    async fn consume(
        &self,
        stream: &mut Box<dyn OrderUpdateStream>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let alert_after = Duration::from_secs(self.cfg.disconnect_alert_sec.max(1));
        let mut silent_alerted = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                next = tokio::time::timeout(alert_after, stream.next_update()) => {
                    match next {
                        Err(_) => {
                            // No update within the alert window.
                            if !silent_alerted {
                                warn!(silent_sec = self.cfg.disconnect_alert_sec, "ws silent");
                                self.fire_health(1, "ws_silent");
                                silent_alerted = true;
                            }
                        }
                        Ok(Ok(Some(upd))) => {
                            silent_alerted = false;
                            (self.on_update)(upd).await;
                        }
                        Ok(Ok(None)) => {
                            warn!("ws stream ended");
                            return;
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "ws read error");
                            return;
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Binance user-data stream
// =============================================================================

/// Order updates from the Binance user-data stream (executionReport events).
pub struct BinanceUserStream {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl BinanceUserStream {
    /// Obtain a listen key and open the stream. The listenKey endpoint wants
    /// the API key header but no signature.
    pub async fn connect(api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build listen-key client")?;
        let resp: serde_json::Value = client
            .post("https://api.binance.com/api/v3/userDataStream")
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .context("listenKey request failed")?
            .json()
            .await
            .context("failed to parse listenKey response")?;
        let listen_key = resp["listenKey"]
            .as_str()
            .context("listenKey missing from response")?;

        let url = format!("wss://stream.binance.com:9443/ws/{listen_key}");
        let (ws, _response) = connect_async(&url)
            .await
            .context("failed to connect user-data stream")?;
        info!("binance user-data stream connected");
        Ok(Self { ws })
    }
}

/// Parse an executionReport message into an [`OrderUpdate`]; other event
/// types yield a non-fill update the listener ignores.
fn parse_user_event(text: &str) -> Result<OrderUpdate> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse user-stream JSON")?;
    let event = root["e"].as_str().unwrap_or("").to_string();

    let str_f64 = |v: &serde_json::Value| -> f64 {
        v.as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| v.as_f64())
            .unwrap_or(0.0)
    };

    Ok(OrderUpdate {
        execution_type: root["x"].as_str().unwrap_or("").to_string(),
        symbol: root["s"].as_str().unwrap_or("").to_string(),
        side: root["S"].as_str().unwrap_or("").to_string(),
        last_filled_qty: str_f64(&root["l"]),
        last_filled_price: str_f64(&root["L"]),
        event_time_ms: root["E"].as_i64().unwrap_or(0),
        order_id: root["i"].as_i64().map(|id| id.to_string()),
        venue: "BINANCE".to_string(),
        event,
    })
}

#[async_trait]
impl OrderUpdateStream for BinanceUserStream {
    async fn next_update(&mut self) -> Result<Option<OrderUpdate>> {
        loop {
            match self.ws.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_user_event(&text) {
                        Ok(upd) => return Ok(Some(upd)),
                        Err(e) => {
                            warn!(error = %e, "failed to parse user-stream message");
                            continue;
                        }
                    }
                }
                Some(Ok(tokio_tungstenite::tungstenite::Message::Ping(_)))
                | Some(Ok(tokio_tungstenite::tungstenite::Message::Pong(_))) => continue,
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                    return Ok(None)
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedStream {
        script: VecDeque<Result<Option<OrderUpdate>>>,
    }

    #[async_trait]
    impl OrderUpdateStream for ScriptedStream {
        async fn next_update(&mut self) -> Result<Option<OrderUpdate>> {
            match self.script.pop_front() {
                Some(item) => item,
                None => Ok(None),
            }
        }
    }

    fn upd(symbol: &str) -> OrderUpdate {
        OrderUpdate {
            event: "executionReport".into(),
            execution_type: "TRADE".into(),
            symbol: symbol.into(),
            side: "BUY".into(),
            last_filled_qty: 1.0,
            last_filled_price: 100.0,
            event_time_ms: 0,
            order_id: None,
            venue: "BINANCE".into(),
        }
    }

    fn ws_cfg() -> WsConfig {
        WsConfig {
            reconnect_backoff_ms: vec![1, 2],
            health_enabled: true,
            disconnect_alert_sec: 1,
        }
    }

    #[tokio::test]
    async fn forwards_updates_and_reconnects() {
        let bus = Arc::new(EventBus::new(0));
        let health: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
        let health_h = health.clone();
        bus.subscribe(
            "health.state",
            crate::bus::handler(move |p| {
                let health_h = health_h.clone();
                async move {
                    health_h
                        .lock()
                        .push(p["reason"].as_str().unwrap_or("").to_string());
                }
            }),
        );

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
        let seen_h = seen.clone();
        let handler: UpdateHandler = Arc::new(move |u: OrderUpdate| {
            let seen_h = seen_h.clone();
            Box::pin(async move {
                seen_h.lock().push(u.symbol);
            })
        });

        // First connection delivers two updates then ends; later connections
        // deliver nothing.
        let connections = Arc::new(Mutex::new(0usize));
        let connections_f = connections.clone();
        let factory: StreamFactory = Box::new(move || {
            let connections_f = connections_f.clone();
            Box::pin(async move {
                let mut conns = connections_f.lock();
                *conns += 1;
                let script: VecDeque<Result<Option<OrderUpdate>>> = if *conns == 1 {
                    VecDeque::from([Ok(Some(upd("BTCUSDT"))), Ok(Some(upd("ETHUSDT"))), Ok(None)])
                } else {
                    VecDeque::from([Ok(None)])
                };
                Ok(Box::new(ScriptedStream { script }) as Box<dyn OrderUpdateStream>)
            })
        });

        let runner = WsRunner::new(factory, handler, bus, ws_cfg());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { runner.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = shutdown_tx.send(true);
        run.await.unwrap().unwrap();

        assert_eq!(*seen.lock(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let health = health.lock();
        assert!(health.contains(&"ws_connected".to_string()));
        assert!(health.contains(&"ws_disconnected".to_string()));
        assert!(*connections.lock() >= 2);
    }

    #[tokio::test]
    async fn silence_emits_ws_silent_once_per_episode() {
        let bus = Arc::new(EventBus::new(0));
        let silents = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let silents_h = silents.clone();
        bus.subscribe(
            "health.state",
            crate::bus::handler(move |p| {
                let silents_h = silents_h.clone();
                async move {
                    if p["reason"] == "ws_silent" {
                        silents_h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            }),
        );

        struct QuietStream;
        #[async_trait]
        impl OrderUpdateStream for QuietStream {
            async fn next_update(&mut self) -> Result<Option<OrderUpdate>> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }

        let factory: StreamFactory = Box::new(|| {
            Box::pin(async { Ok(Box::new(QuietStream) as Box<dyn OrderUpdateStream>) })
        });
        let handler: UpdateHandler = Arc::new(|_| Box::pin(async {}));

        let runner = WsRunner::new(factory, handler, bus, ws_cfg());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // Well past several alert windows; still one alert for the episode.
        tokio::time::sleep(Duration::from_millis(3200)).await;
        let _ = shutdown_tx.send(true);
        run.await.unwrap().unwrap();

        assert_eq!(silents.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_execution_report() {
        let msg = r#"{
            "e": "executionReport", "E": 1700000000000, "s": "BTCUSDT",
            "S": "BUY", "x": "TRADE", "l": "0.10000000", "L": "30000.00",
            "i": 12345
        }"#;
        let upd = parse_user_event(msg).unwrap();
        assert_eq!(upd.event, "executionReport");
        assert_eq!(upd.execution_type, "TRADE");
        assert_eq!(upd.symbol, "BTCUSDT");
        assert_eq!(upd.last_filled_qty, 0.1);
        assert_eq!(upd.last_filled_price, 30_000.0);
        assert_eq!(upd.order_id.as_deref(), Some("12345"));
    }
}
