// =============================================================================
// Depeg Guard — confirmation-counted stable-parity watcher
// =============================================================================
//
// Each tick estimates peg deviation as the max of the direct USDT/USDC leg and
// the implied BTC-leg parity (BTCUSDT / BTCUSDC), in percent. Deviation at or
// above the threshold increments a confirmation counter; anything below
// resets it. Hitting `confirm_windows` trips the guard:
//
//   - a cooldown window opens (`safe_until`), during which ticks are inert
//     and the DEPEG gate rejects new intents,
//   - `risk.depeg_trigger` and `health.state = HALTED` fire on the bus,
//   - trading is disabled at the router; optionally positions are flattened
//     with reduce-only markets and the preferred quote flips to USDC.
//
// Every action is best-effort: failures are logged and never re-raised.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::DepegConfig;
use crate::router::RouterRegistry;
use crate::types::{epoch_now, Side};

/// Shared trigger window, read by the guard chain's DEPEG gate.
#[derive(Default)]
pub struct DepegFlag {
    until: Mutex<f64>,
}

impl DepegFlag {
    pub fn is_triggered_at(&self, now: f64) -> bool {
        now < *self.until.lock()
    }

    pub fn is_triggered(&self) -> bool {
        self.is_triggered_at(epoch_now())
    }

    pub fn remaining_at(&self, now: f64) -> f64 {
        (*self.until.lock() - now).max(0.0)
    }

    fn arm(&self, until: f64) {
        *self.until.lock() = until;
    }
}

pub struct DepegGuard {
    cfg: DepegConfig,
    routers: Arc<RouterRegistry>,
    bus: Arc<EventBus>,
    flag: Arc<DepegFlag>,
    confirm: Mutex<u32>,
}

impl DepegGuard {
    pub fn new(
        cfg: DepegConfig,
        routers: Arc<RouterRegistry>,
        bus: Arc<EventBus>,
        flag: Arc<DepegFlag>,
    ) -> Self {
        Self {
            cfg,
            routers,
            bus,
            flag,
            confirm: Mutex::new(0),
        }
    }

    pub fn flag(&self) -> Arc<DepegFlag> {
        self.flag.clone()
    }

    pub fn confirm_count(&self) -> u32 {
        *self.confirm.lock()
    }

    async fn last(&self, symbol: &str) -> f64 {
        match self.routers.resolve(symbol) {
            Ok((adapter, base)) => match adapter.get_last_price(&base).await {
                Ok(Some(px)) => px,
                Ok(None) => 0.0,
                Err(e) => {
                    debug!(symbol, error = %e, "depeg price fetch failed");
                    0.0
                }
            },
            Err(e) => {
                debug!(symbol, error = %e, "depeg router resolve failed");
                0.0
            }
        }
    }

    /// Max deviation in percent over the configured watch pairs.
    async fn peg_deviation(&self) -> f64 {
        let mut devs: Vec<f64> = Vec::new();
        let watched = |s: &str| self.cfg.watch_symbols.iter().any(|w| w == s);

        if watched("USDTUSDC") {
            let usdt_usdc = self.last("USDTUSDC").await;
            if usdt_usdc > 0.0 {
                devs.push((usdt_usdc - 1.0).abs() * 100.0);
            }
        }
        if watched("BTCUSDT") && watched("BTCUSDC") {
            let btc_usdt = self.last("BTCUSDT").await;
            let btc_usdc = self.last("BTCUSDC").await;
            if btc_usdt > 0.0 && btc_usdc > 0.0 {
                let implied = btc_usdt / btc_usdc;
                devs.push((implied - 1.0).abs() * 100.0);
            }
        }
        devs.into_iter().fold(0.0, f64::max)
    }

    pub async fn tick(&self) {
        self.tick_at(epoch_now()).await;
    }

    pub async fn tick_at(&self, now: f64) {
        if !self.cfg.enabled {
            return;
        }
        if self.flag.is_triggered_at(now) {
            return;
        }

        let dev = self.peg_deviation().await;
        let triggered = {
            let mut confirm = self.confirm.lock();
            if dev >= self.cfg.threshold_pct {
                *confirm += 1;
            } else {
                *confirm = 0;
            }
            *confirm >= self.cfg.confirm_windows
        };

        if !triggered {
            return;
        }

        self.flag
            .arm(now + 60.0 * self.cfg.cooldown_min as f64);
        *self.confirm.lock() = 0;

        self.bus
            .fire("risk.depeg_trigger", serde_json::json!({ "deviation_pct": dev }));
        self.bus.fire(
            "health.state",
            serde_json::json!({ "state": 2, "reason": "depeg_trigger" }),
        );

        self.apply_actions(dev).await;
    }

    async fn apply_actions(&self, dev: f64) {
        warn!(deviation_pct = dev, "DEPEG triggered — halting new entries");

        let adapter = match self.routers.default_adapter() {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "depeg actions skipped — no default adapter");
                return;
            }
        };

        adapter.set_trading_enabled(false).await;

        if self.cfg.exit_risk {
            let positions = match adapter.list_positions().await {
                Ok(positions) => positions,
                Err(e) => {
                    warn!(error = %e, "depeg flatten: position listing failed");
                    Vec::new()
                }
            };
            for p in positions {
                if p.qty == 0.0 {
                    continue;
                }
                let side = if p.qty > 0.0 { Side::Sell } else { Side::Buy };
                if let Err(e) = adapter
                    .place_reduce_only_market(&p.symbol, side, p.qty.abs())
                    .await
                {
                    warn!(symbol = %p.symbol, error = %e, "depeg flatten failed");
                }
            }
        }

        if self.cfg.switch_quote {
            if let Err(e) = adapter.set_preferred_quote("USDC").await {
                warn!(error = %e, "depeg quote switch failed");
            }
        }
    }
}
