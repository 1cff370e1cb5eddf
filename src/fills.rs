// =============================================================================
// Fills Listener — translates venue order updates into trade.fill bus events
// =============================================================================
//
// Consumes the raw updates forwarded by the WS runner. Only execution reports
// of type TRADE/FILL become `trade.fill` events; everything else (NEW,
// CANCELED, partial bookkeeping) is dropped here. Malformed updates are
// logged and swallowed so a bad message never stalls the stream.
// =============================================================================

use std::sync::Arc;

use tracing::warn;

use crate::bus::EventBus;
use crate::types::{FillEvent, IntentKind, OrderUpdate, Side};

pub struct FillsListener {
    bus: Arc<EventBus>,
}

impl FillsListener {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }

    /// Translate one order update; fires `trade.fill` when it is a fill.
    pub fn on_update(&self, upd: &OrderUpdate) {
        if upd.event != "executionReport" {
            return;
        }
        if !matches!(upd.execution_type.as_str(), "TRADE" | "FILL") {
            return;
        }
        let side: Side = match upd.side.parse() {
            Ok(side) => side,
            Err(_) => {
                warn!(symbol = %upd.symbol, side = %upd.side, "fill with unknown side dropped");
                return;
            }
        };
        if upd.symbol.is_empty() || upd.last_filled_qty <= 0.0 || upd.last_filled_price <= 0.0 {
            return;
        }

        let fill = FillEvent {
            ts: upd.event_time_ms as f64 / 1000.0,
            symbol: upd.symbol.to_ascii_uppercase(),
            side,
            avg_price: upd.last_filled_price,
            filled_qty: upd.last_filled_qty,
            venue: if upd.venue.is_empty() {
                "BINANCE".to_string()
            } else {
                upd.venue.clone()
            },
            intent: IntentKind::Generic,
            order_id: upd.order_id.clone(),
        };

        match serde_json::to_value(&fill) {
            Ok(payload) => self.bus.fire("trade.fill", payload),
            Err(e) => warn!(error = %e, "failed to serialise fill event"),
        }
    }
}
