// =============================================================================
// Cooldown Map — per-key minimum wait between actions
// =============================================================================
//
// Keys are arbitrary strings ("entry:BTCUSDT", "notify:depeg", ...). `hit`
// stamps the next-allowed time; `allow` checks it; entries are evicted lazily
// on query. Purely in-memory — cooldowns reset on restart by design.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::epoch_now;

pub struct Cooldowns {
    default_ttl: f64,
    entries: Mutex<HashMap<String, f64>>,
}

impl Cooldowns {
    pub fn new(default_ttl: f64) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, epoch_now())
    }

    pub fn allow_at(&self, key: &str, now: f64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(&expiry) if now < expiry => false,
            Some(_) => {
                entries.remove(key);
                true
            }
            None => true,
        }
    }

    /// Start (or restart) the cooldown for `key`. `ttl` of `None` uses the
    /// default supplied at construction.
    pub fn hit(&self, key: &str, ttl: Option<f64>) {
        self.hit_at(key, ttl, epoch_now());
    }

    pub fn hit_at(&self, key: &str, ttl: Option<f64>, now: f64) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.lock().insert(key.to_string(), now + ttl);
    }

    pub fn remaining(&self, key: &str) -> f64 {
        self.remaining_at(key, epoch_now())
    }

    pub fn remaining_at(&self, key: &str, now: f64) -> f64 {
        let expiry = self.entries.lock().get(key).copied().unwrap_or(0.0);
        (expiry - now).max(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_throughout_ttl_then_allowed() {
        let cd = Cooldowns::new(0.0);
        cd.hit_at("k", Some(30.0), 100.0);

        // Monotonicity: blocked on [t0, t0+ttl), allowed from t0+ttl.
        assert!(!cd.allow_at("k", 100.0));
        assert!(!cd.allow_at("k", 129.999));
        assert!(cd.allow_at("k", 130.0));
        assert!(cd.allow_at("k", 200.0));
    }

    #[test]
    fn default_ttl_applies_when_unspecified() {
        let cd = Cooldowns::new(60.0);
        cd.hit_at("k", None, 0.0);
        assert!(!cd.allow_at("k", 59.0));
        assert!(cd.allow_at("k", 60.0));
    }

    #[test]
    fn remaining_counts_down_and_floors_at_zero() {
        let cd = Cooldowns::new(0.0);
        cd.hit_at("k", Some(10.0), 0.0);
        assert_eq!(cd.remaining_at("k", 4.0), 6.0);
        assert_eq!(cd.remaining_at("k", 10.0), 0.0);
        assert_eq!(cd.remaining_at("missing", 0.0), 0.0);
    }

    #[test]
    fn unknown_key_is_allowed() {
        let cd = Cooldowns::new(5.0);
        assert!(cd.allow_at("never-hit", 0.0));
    }

    #[test]
    fn rehit_extends_the_window() {
        let cd = Cooldowns::new(0.0);
        cd.hit_at("k", Some(10.0), 0.0);
        cd.hit_at("k", Some(10.0), 5.0);
        assert!(!cd.allow_at("k", 12.0));
        assert!(cd.allow_at("k", 15.0));
    }
}
