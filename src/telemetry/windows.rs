// =============================================================================
// Latency & PnL Windows — rolling samples for percentiles and 24h deltas
// =============================================================================
//
// Three independent pieces of state, each behind its own lock:
//
//   - a bounded FIFO of tick→order latency samples (percentile source),
//   - a most-recent-latency-per-symbol map with pop semantics, keyed by both
//     the raw and the base/qualified symbol so either spelling finds it,
//   - a trailing-24h (ts, realized_total) window for PnL deltas.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::types::epoch_now;

const PNL_WINDOW_SEC: f64 = 86_400.0;

/// Linear-interpolation quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = (n - 1) as f64 * q;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let frac = pos - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * frac
            }
        }
    }
}

// =============================================================================
// LatencyWindow
// =============================================================================

struct LatencyInner {
    samples: VecDeque<f64>,
    last_by_symbol: HashMap<String, f64>,
}

pub struct LatencyWindow {
    inner: Mutex<LatencyInner>,
    capacity: usize,
    default_venue: String,
}

impl LatencyWindow {
    pub fn new(capacity: usize, default_venue: &str) -> Self {
        Self {
            inner: Mutex::new(LatencyInner {
                samples: VecDeque::with_capacity(capacity),
                last_by_symbol: HashMap::new(),
            }),
            capacity,
            default_venue: default_venue.to_uppercase(),
        }
    }

    /// Record one tick→order latency sample. Negative or non-finite values
    /// are ignored. The per-symbol slot is written under both the raw key and
    /// its base (suffix-stripped) spelling.
    pub fn record(&self, symbol: &str, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        let raw = symbol.to_ascii_uppercase();
        let base = raw.split('.').next().unwrap_or(&raw).to_string();

        let mut inner = self.inner.lock();
        inner.samples.push_back(latency_ms);
        while inner.samples.len() > self.capacity {
            inner.samples.pop_front();
        }
        inner.last_by_symbol.insert(base.clone(), latency_ms);
        if raw != base {
            inner.last_by_symbol.insert(raw, latency_ms);
        }
    }

    /// Pop the most recent latency for `symbol`, trying the raw key and its
    /// default-venue-qualified spelling. Single-reader semantics: a second
    /// consume returns `None` until the next record.
    pub fn consume(&self, symbol: &str) -> Option<f64> {
        let raw = symbol.to_ascii_uppercase();
        let mut keys = vec![raw.clone()];
        if !raw.contains('.') {
            keys.push(format!("{raw}.{}", self.default_venue));
        } else if let Some(base) = raw.split('.').next() {
            keys.push(base.to_string());
        }

        let mut inner = self.inner.lock();
        let hit = keys.iter().find_map(|k| inner.last_by_symbol.remove(k));
        if hit.is_some() {
            // Drop the sibling spelling too so the pop is observed once.
            for k in &keys {
                inner.last_by_symbol.remove(k);
            }
        }
        hit
    }

    /// `(p50, p95)` over the retained samples; `(0, 0)` when empty.
    pub fn percentiles(&self) -> (f64, f64) {
        let mut samples: Vec<f64> = {
            let inner = self.inner.lock();
            inner.samples.iter().copied().collect()
        };
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        (quantile(&samples, 0.5), quantile(&samples, 0.95))
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }
}

// =============================================================================
// PnlWindow
// =============================================================================

pub struct PnlWindow {
    window: Mutex<VecDeque<(f64, f64)>>,
}

impl PnlWindow {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Record the current realized total and return the trailing-24h delta
    /// (`total − oldest surviving total`).
    pub fn record_realized_total(&self, total_usd: f64) -> f64 {
        self.record_realized_total_at(total_usd, epoch_now())
    }

    pub fn record_realized_total_at(&self, total_usd: f64, now: f64) -> f64 {
        let cutoff = now - PNL_WINDOW_SEC;
        let mut window = self.window.lock();
        window.push_back((now, total_usd));
        while window.front().map(|&(ts, _)| ts < cutoff).unwrap_or(false) {
            window.pop_front();
        }
        let anchor = window.front().map(|&(_, v)| v).unwrap_or(total_usd);
        total_usd - anchor
    }

    pub fn len(&self) -> usize {
        self.window.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.lock().is_empty()
    }
}

impl Default for PnlWindow {
    fn default() -> Self {
        Self::new()
    }
}
