// =============================================================================
// Telemetry Rollups — daily counters and rolling intraday buckets
// =============================================================================
//
// Two collections feed the digest and /status:
//
//   - DailyRollup: a counter map plus a (key, symbol) counter map, reset when
//     the UTC day rolls over (checked on every increment).
//   - BucketRing: fixed-size time buckets (default 6 h), each with its own
//     counters; at most `max_buckets` are retained.
//
// Counter keys follow the event_bo vocabulary: `trades`, `plans_live`,
// `plans_dry`, `half_applied`, `trail_update`, `skip_<reason>`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::epoch_now;

const DAY_SEC: f64 = 86_400.0;

/// UTC midnight at or before `now`.
fn day_boundary(now: f64) -> f64 {
    (now / DAY_SEC).floor() * DAY_SEC
}

// =============================================================================
// DailyRollup
// =============================================================================

#[derive(Default)]
struct DailyInner {
    reset_ts: f64,
    cnt: HashMap<String, u64>,
    by_symbol: HashMap<(String, String), u64>,
}

pub struct DailyRollup {
    inner: Mutex<DailyInner>,
}

impl DailyRollup {
    pub fn new() -> Self {
        Self::new_at(epoch_now())
    }

    pub fn new_at(now: f64) -> Self {
        Self {
            inner: Mutex::new(DailyInner {
                reset_ts: day_boundary(now),
                ..Default::default()
            }),
        }
    }

    /// Clear both maps and re-anchor the boundary if the day has rolled.
    pub fn maybe_reset(&self) {
        self.maybe_reset_at(epoch_now());
    }

    pub fn maybe_reset_at(&self, now: f64) {
        let mut inner = self.inner.lock();
        Self::reset_if_due(&mut inner, now);
    }

    fn reset_if_due(inner: &mut DailyInner, now: f64) {
        if now >= inner.reset_ts + DAY_SEC {
            inner.cnt.clear();
            inner.by_symbol.clear();
            inner.reset_ts = day_boundary(now);
        }
    }

    pub fn inc(&self, key: &str, symbol: Option<&str>, n: u64) {
        self.inc_at(key, symbol, n, epoch_now());
    }

    pub fn inc_at(&self, key: &str, symbol: Option<&str>, n: u64, now: f64) {
        let mut inner = self.inner.lock();
        Self::reset_if_due(&mut inner, now);
        *inner.cnt.entry(key.to_string()).or_insert(0) += n;
        if let Some(sym) = symbol {
            *inner
                .by_symbol
                .entry((key.to_string(), sym.to_string()))
                .or_insert(0) += n;
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.inner.lock().cnt.get(key).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> HashMap<String, u64> {
        self.inner.lock().cnt.clone()
    }

    /// The `k` highest (symbol, count) pairs for `key`, sorted descending.
    pub fn top_symbols(&self, key: &str, k: usize) -> Vec<(String, u64)> {
        let inner = self.inner.lock();
        let mut items: Vec<(String, u64)> = inner
            .by_symbol
            .iter()
            .filter(|((kk, _), _)| kk == key)
            .map(|((_, sym), &n)| (sym.clone(), n))
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        items.truncate(k);
        items
    }
}

// =============================================================================
// BucketRing
// =============================================================================

struct Bucket {
    start: i64,
    cnt: HashMap<String, u64>,
    by_symbol: HashMap<(String, String), u64>,
}

/// One bucket as exposed to the digest and /status: newest first.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub start: i64,
    pub cnt: HashMap<String, u64>,
    /// Per-symbol trade counts within the bucket.
    pub by_symbol: HashMap<String, u64>,
}

pub struct BucketRing {
    bucket_sec: i64,
    max_buckets: usize,
    buckets: Mutex<Vec<Bucket>>,
}

impl BucketRing {
    pub fn new(bucket_minutes: u64, max_buckets: usize) -> Self {
        Self {
            bucket_sec: (bucket_minutes * 60) as i64,
            max_buckets,
            buckets: Mutex::new(Vec::new()),
        }
    }

    fn current_start(&self, now: f64) -> i64 {
        (now as i64).div_euclid(self.bucket_sec) * self.bucket_sec
    }

    pub fn inc(&self, key: &str, symbol: Option<&str>, n: u64) {
        self.inc_at(key, symbol, n, epoch_now());
    }

    pub fn inc_at(&self, key: &str, symbol: Option<&str>, n: u64, now: f64) {
        let start = self.current_start(now);
        let mut buckets = self.buckets.lock();

        let rotate = buckets.last().map(|b| b.start != start).unwrap_or(true);
        if rotate {
            buckets.push(Bucket {
                start,
                cnt: HashMap::new(),
                by_symbol: HashMap::new(),
            });
            let excess = buckets.len().saturating_sub(self.max_buckets);
            if excess > 0 {
                buckets.drain(0..excess);
            }
        }

        let bucket = buckets.last_mut().expect("just ensured non-empty");
        *bucket.cnt.entry(key.to_string()).or_insert(0) += n;
        if let Some(sym) = symbol {
            *bucket
                .by_symbol
                .entry((key.to_string(), sym.to_string()))
                .or_insert(0) += n;
        }
    }

    /// Newest-first snapshot of the retained buckets.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .rev()
            .map(|b| BucketSnapshot {
                start: b.start,
                cnt: b.cnt.clone(),
                by_symbol: b
                    .by_symbol
                    .iter()
                    .filter(|((k, _), _)| k == "trades")
                    .map(|((_, sym), &n)| (sym.clone(), n))
                    .collect(),
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1_700_000_000.0; // 2023-11-14 22:13:20 UTC

    #[test]
    fn daily_counts_and_top_symbols() {
        let rollup = DailyRollup::new_at(T0);
        rollup.inc_at("trades", Some("BTCUSDT"), 3, T0);
        rollup.inc_at("trades", Some("ETHUSDT"), 1, T0 + 1.0);
        rollup.inc_at("plans_live", Some("BTCUSDT"), 2, T0 + 2.0);

        assert_eq!(rollup.get("trades"), 4);
        assert_eq!(rollup.get("plans_live"), 2);
        assert_eq!(
            rollup.top_symbols("trades", 5),
            vec![("BTCUSDT".to_string(), 3), ("ETHUSDT".to_string(), 1)]
        );
    }

    #[test]
    fn daily_resets_across_day_boundary() {
        let rollup = DailyRollup::new_at(T0);
        rollup.inc_at("trades", None, 5, T0);

        // First increment of the next UTC day observes a fresh counter.
        let next_day = day_boundary(T0) + DAY_SEC + 10.0;
        rollup.inc_at("trades", None, 1, next_day);
        assert_eq!(rollup.get("trades"), 1);
        assert!(rollup.top_symbols("trades", 5).is_empty());
    }

    #[test]
    fn daily_no_reset_within_same_day() {
        let rollup = DailyRollup::new_at(T0);
        rollup.inc_at("trades", None, 5, T0);
        rollup.inc_at("trades", None, 1, day_boundary(T0) + DAY_SEC - 1.0);
        assert_eq!(rollup.get("trades"), 6);
    }

    #[test]
    fn bucket_ring_rotates_and_bounds() {
        let ring = BucketRing::new(360, 4);
        let bucket_sec = 360.0 * 60.0;

        for i in 0..6 {
            ring.inc_at("trades", Some("BTCUSDT"), 1, T0 + i as f64 * bucket_sec);
        }

        let snap = ring.snapshot();
        assert_eq!(snap.len(), 4);
        // Newest first, distinct starts, strictly descending.
        for pair in snap.windows(2) {
            assert!(pair[0].start > pair[1].start);
        }
        assert_eq!(snap[0].by_symbol.get("BTCUSDT"), Some(&1));
    }

    #[test]
    fn bucket_accumulates_within_window() {
        let ring = BucketRing::new(360, 4);
        ring.inc_at("trades", Some("ETHUSDT"), 1, T0);
        ring.inc_at("trades", Some("ETHUSDT"), 2, T0 + 30.0);
        ring.inc_at("skip_spread", None, 1, T0 + 60.0);

        let snap = ring.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].cnt.get("trades"), Some(&3));
        assert_eq!(snap[0].cnt.get("skip_spread"), Some(&1));
        // Only trade counts surface per-symbol.
        assert_eq!(snap[0].by_symbol.get("ETHUSDT"), Some(&3));
    }
}
