// =============================================================================
// Fee Manager — keeps the fee-asset balance above the discount minimum
// =============================================================================
//
// Paying fees in the venue's fee asset earns a discount; running dry silently
// switches fees to the traded asset. The loop checks the fee-asset balance
// every `check_interval_sec`, and when its USD value drops below the
// threshold (and the per-topup cooldown allows), buys `topup_amount_usd`
// worth with an IOC limit at the current mark. The kill switch and trading
// flag are enforced by the router, not here.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::FeeConfig;
use crate::router::{RouterRegistry, VenueRouter};
use crate::types::{epoch_now, Side};

pub struct FeeManager {
    cfg: FeeConfig,
    routers: Arc<RouterRegistry>,
    last_topup_ts: Mutex<f64>,
}

impl FeeManager {
    pub fn new(cfg: FeeConfig, routers: Arc<RouterRegistry>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            routers,
            last_topup_ts: Mutex::new(0.0),
        })
    }

    /// Fee-asset balance from the position listing (spot positions are
    /// balances keyed "<ASSET><QUOTE>").
    async fn fee_asset_balance(&self, adapter: &Arc<dyn VenueRouter>) -> f64 {
        match adapter.list_positions().await {
            Ok(positions) => positions
                .iter()
                .find(|p| p.symbol.starts_with(&self.cfg.fee_asset))
                .map(|p| p.qty)
                .unwrap_or(0.0),
            Err(e) => {
                warn!(error = %e, "fee manager: balance fetch failed");
                0.0
            }
        }
    }

    /// One check pass at `now`. Returns `true` when a topup was submitted.
    pub async fn check_and_topup_at(&self, now: f64) -> bool {
        let adapter = match self.routers.resolve(&self.cfg.fee_symbol) {
            Ok((adapter, _)) => adapter,
            Err(e) => {
                warn!(error = %e, "fee manager: no route for fee symbol");
                return false;
            }
        };

        let mark = match adapter.get_last_price(&self.cfg.fee_symbol).await {
            Ok(Some(px)) if px > 0.0 => px,
            Ok(_) => {
                warn!(symbol = %self.cfg.fee_symbol, "fee manager: no mark available");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "fee manager: mark fetch failed");
                return false;
            }
        };

        let balance = self.fee_asset_balance(&adapter).await;
        let value_usd = balance * mark;
        if value_usd >= self.cfg.topup_threshold_usd {
            debug!(
                asset = %self.cfg.fee_asset,
                balance,
                value_usd,
                "fee asset balance ok"
            );
            return false;
        }

        {
            let last = self.last_topup_ts.lock();
            if now - *last < self.cfg.min_topup_interval_sec as f64 {
                debug!(
                    remaining_sec = self.cfg.min_topup_interval_sec as f64 - (now - *last),
                    "fee topup cooldown active"
                );
                return false;
            }
        }

        let qty = self.cfg.topup_amount_usd / mark;
        info!(
            asset = %self.cfg.fee_asset,
            balance,
            value_usd,
            qty,
            amount_usd = self.cfg.topup_amount_usd,
            "fee asset low — topping up"
        );

        match adapter
            .place_limit_ioc(&self.cfg.fee_symbol, Side::Buy, qty, mark)
            .await
        {
            Ok(ack) => {
                *self.last_topup_ts.lock() = now;
                info!(order_id = ?ack.order_id, status = %ack.status, "fee topup placed");
                true
            }
            Err(e) => {
                warn!(error = %e, "fee topup failed");
                false
            }
        }
    }

    /// Supervised loop. Sleeps first, matching a fresh-start engine that just
    /// reconciled balances.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if !self.cfg.enabled {
            info!("fee manager disabled via config");
            return Ok(());
        }
        info!(
            threshold_usd = self.cfg.topup_threshold_usd,
            amount_usd = self.cfg.topup_amount_usd,
            interval_sec = self.cfg.check_interval_sec,
            "fee manager started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.cfg.check_interval_sec)) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
            self.check_and_topup_at(epoch_now()).await;
        }
    }
}
