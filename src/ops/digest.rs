// =============================================================================
// Digest Job — periodic rollup summary → notification sink
// =============================================================================
//
// Formats the daily counters (plans, trades, efficiency, half-size, skip
// breakdown), optionally the top-5 traded symbols, and optionally the last
// 24 h split into 6 h buckets, then pushes the text to the sink. Failures are
// logged and swallowed; the next interval tries again.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::DigestConfig;
use crate::ops::notify::NotifySink;
use crate::telemetry::rollups::{BucketRing, DailyRollup};

pub struct DigestJob {
    cfg: DigestConfig,
    rollups: Arc<DailyRollup>,
    buckets: Arc<BucketRing>,
    sink: Arc<dyn NotifySink>,
}

impl DigestJob {
    pub fn new(
        cfg: DigestConfig,
        rollups: Arc<DailyRollup>,
        buckets: Arc<BucketRing>,
        sink: Arc<dyn NotifySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            rollups,
            buckets,
            sink,
        })
    }

    /// Render the digest text from the current rollup state.
    pub fn summary(&self) -> String {
        let counters = self.rollups.counters();
        let trades = counters.get("trades").copied().unwrap_or(0);
        let live_plans = counters.get("plans_live").copied().unwrap_or(0);
        let dry_plans = counters.get("plans_dry").copied().unwrap_or(0);
        let half = counters.get("half_applied").copied().unwrap_or(0);
        let efficiency = if live_plans > 0 {
            trades as f64 / live_plans as f64
        } else {
            0.0
        };

        let mut skips: Vec<(&String, &u64)> = counters
            .iter()
            .filter(|(k, _)| k.starts_with("skip_"))
            .collect();
        skips.sort_by(|a, b| a.0.cmp(b.0));
        let skip_line = if skips.is_empty() {
            "—".to_string()
        } else {
            skips
                .iter()
                .map(|(k, v)| format!("{}: *{v}*", k.trim_start_matches("skip_")))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut lines = vec![
            "*Event Breakout – Daily Digest*".to_string(),
            format!("Plans LIVE: *{live_plans}*"),
            format!("Plans DRY: *{dry_plans}*"),
            format!("Trades: *{trades}*"),
            format!("Efficiency (trades/live): *{efficiency:.2}*"),
            format!("Half-size applied: *{half}*"),
            format!("Skips ▸ {skip_line}"),
        ];

        if self.cfg.include_symbols {
            let tops = self.rollups.top_symbols("trades", 5);
            if !tops.is_empty() {
                let symtxt = tops
                    .iter()
                    .map(|(s, n)| format!("{s} *{n}*"))
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!("Top traded: {symtxt}"));
            }
        }

        if self.cfg.six_hour_enabled {
            let snap = self.buckets.snapshot();
            if !snap.is_empty() {
                lines.push("\n*Last 24h (6h buckets)*".to_string());
                for (i, bucket) in snap.iter().enumerate() {
                    let trades_b = bucket.cnt.get("trades").copied().unwrap_or(0);
                    let live_b = bucket.cnt.get("plans_live").copied().unwrap_or(0);
                    let eff_b = if live_b > 0 {
                        trades_b as f64 / live_b as f64
                    } else {
                        0.0
                    };
                    let half_b = bucket.cnt.get("half_applied").copied().unwrap_or(0);
                    let skips_b: u64 = bucket
                        .cnt
                        .iter()
                        .filter(|(k, _)| k.starts_with("skip_"))
                        .map(|(_, v)| v)
                        .sum();
                    lines.push(format!(
                        "B{}: trades *{trades_b}*, live *{live_b}*, eff *{eff_b:.2}*, half *{half_b}*, skips *{skips_b}*",
                        i + 1
                    ));
                }
            }
        }

        lines.join("\n")
    }

    /// One digest pass: roll the day if due, render, send.
    pub async fn run_once(&self) {
        self.rollups.maybe_reset();
        let text = self.summary();
        match self.sink.send(&text, Some("Markdown")).await {
            Ok(()) => info!(
                len = text.len(),
                live = self.rollups.get("plans_live"),
                trades = self.rollups.get("trades"),
                "digest sent"
            ),
            Err(e) => warn!(error = %e, "digest send failed"),
        }
    }

    /// Sends on entry, then every interval — the first digest goes out at
    /// startup, not a day later.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if !self.cfg.enabled {
            info!("digest job disabled via config");
            return Ok(());
        }
        let interval = std::time::Duration::from_secs(self.cfg.interval_min * 60);
        loop {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }
}
