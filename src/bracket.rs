// =============================================================================
// Bracket Governor — TP/SL governance wired off trade.fill events
// =============================================================================
//
// Each fill gets a reduce-only limit take-profit and (when stop amends are
// allowed) a reduce-only stop, both sized to the filled quantity. Offsets come
// from TP_BPS / SL_BPS. Errors never escape the handler — a failed bracket
// must not disturb the bus or the next fill.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bus::{self, EventBus, Payload};
use crate::config::BracketConfig;
use crate::router::{RouterError, RouterRegistry};
use crate::types::Side;

pub struct BracketGovernor {
    cfg: BracketConfig,
    routers: Arc<RouterRegistry>,
}

/// TP/SL prices for a fill. BUY brackets sit above/below the average; SELL
/// brackets mirror around it.
pub fn bracket_prices(side: Side, avg: f64, tp_bps: f64, sl_bps: f64) -> (f64, f64) {
    let tp_mult = 1.0 + tp_bps / 10_000.0;
    let sl_mult = 1.0 - sl_bps / 10_000.0;
    match side {
        Side::Buy => (avg * tp_mult, avg * sl_mult),
        Side::Sell => (avg * (2.0 - tp_mult), avg * (2.0 - sl_mult)),
    }
}

impl BracketGovernor {
    pub fn new(cfg: BracketConfig, routers: Arc<RouterRegistry>) -> Arc<Self> {
        Arc::new(Self { cfg, routers })
    }

    /// Subscribe to `trade.fill`. No-op when disabled by config.
    pub fn wire(self: &Arc<Self>, bus: &EventBus) {
        if !self.cfg.enabled {
            info!("bracket governor disabled via config");
            return;
        }
        let governor = self.clone();
        bus.subscribe(
            "trade.fill",
            bus::handler(move |payload| {
                let governor = governor.clone();
                async move {
                    governor.on_fill(payload).await;
                }
            }),
        );
        info!(
            tp_bps = self.cfg.tp_bps,
            sl_bps = self.cfg.sl_bps,
            allow_stop_amend = self.cfg.allow_stop_amend,
            "bracket governor wired"
        );
    }

    /// Handle one fill payload. Malformed or zero-quantity fills are ignored.
    pub async fn on_fill(&self, evt: Payload) {
        let symbol = evt["symbol"].as_str().unwrap_or("").to_ascii_uppercase();
        let side: Option<Side> = evt["side"].as_str().and_then(|s| s.parse().ok());
        let avg = evt["avg_price"].as_f64().unwrap_or(0.0);
        let qty = evt["filled_qty"].as_f64().unwrap_or(0.0);

        let Some(side) = side else { return };
        if symbol.is_empty() || avg <= 0.0 || qty <= 0.0 {
            return;
        }

        let (tp_px, sl_px) = bracket_prices(side, avg, self.cfg.tp_bps, self.cfg.sl_bps);
        let exit_side = side.opposite();

        let (adapter, base) = match self.routers.resolve(&symbol) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "bracket: no route for fill");
                return;
            }
        };

        if let Err(e) = adapter
            .place_reduce_only_limit(&base, exit_side, qty.abs(), tp_px)
            .await
        {
            warn!(symbol = %base, error = %e, "bracket TP placement failed");
        }

        if self.cfg.allow_stop_amend {
            match adapter
                .amend_stop_reduce_only(&base, exit_side, sl_px, qty.abs())
                .await
            {
                Ok(_) => {}
                Err(RouterError::Blocked(reason)) => {
                    debug!(symbol = %base, reason, "bracket SL skipped");
                }
                Err(e) => warn!(symbol = %base, error = %e, "bracket SL placement failed"),
            }
        }

        info!(
            symbol = %base,
            %side,
            qty,
            avg,
            tp = tp_px,
            sl = sl_px,
            "bracket issued"
        );
    }
}
