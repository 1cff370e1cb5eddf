// =============================================================================
// Quarantine Registry — repeated stop-loss exits block a symbol for hours
// =============================================================================
//
// Policy: `max_stops_in_window` stop-loss exits within `window_sec` puts the
// symbol on the bench for `quarantine_sec`. This cuts chop re-entries on a
// symbol whose behavior just burned us twice.
//
// Symbols are normalised (venue suffix stripped, upper-cased) so "btcusdt"
// and "BTCUSDT.BINANCE" share one entry. Every mutation is persisted to
// `state/quarantine.json` with an atomic tmp + rename write; a corrupt or
// missing file on startup yields an empty registry.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::QuarantineConfig;
use crate::types::epoch_now;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    stops: HashMap<String, Vec<f64>>,
    #[serde(default)]
    blocked: HashMap<String, f64>,
}

pub struct QuarantineRegistry {
    inner: Mutex<PersistedState>,
    policy: QuarantineConfig,
    path: PathBuf,
}

/// Strip a venue suffix and upper-case: "solusdt.BINANCE" → "SOLUSDT".
fn normalize(symbol: &str) -> String {
    symbol
        .split('.')
        .next()
        .unwrap_or(symbol)
        .to_ascii_uppercase()
}

impl QuarantineRegistry {
    /// Load the registry from `policy.path`, falling back to empty state on
    /// any read or parse failure.
    pub fn load(policy: QuarantineConfig) -> Self {
        let path = PathBuf::from(&policy.path);
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        blocked = state.blocked.len(),
                        "quarantine state loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt quarantine state — starting empty");
                    PersistedState::default()
                }
            },
            Err(_) => PersistedState::default(),
        };
        Self {
            inner: Mutex::new(state),
            policy,
            path,
        }
    }

    /// Record a stop-loss exit for `symbol`. Prunes stops older than the
    /// window and, when the threshold is hit, blocks the symbol for
    /// `quarantine_sec`.
    pub fn record_stop(&self, symbol: &str) {
        self.record_stop_at(symbol, epoch_now());
    }

    pub fn record_stop_at(&self, symbol: &str, now: f64) {
        let sym = normalize(symbol);
        {
            let mut state = self.inner.lock();
            let cutoff = now - self.policy.window_sec;
            let stops = state.stops.entry(sym.clone()).or_default();
            stops.push(now);
            stops.retain(|&t| t >= cutoff);
            if stops.len() >= self.policy.max_stops_in_window {
                state
                    .blocked
                    .insert(sym.clone(), now + self.policy.quarantine_sec);
                warn!(
                    symbol = %sym,
                    block_sec = self.policy.quarantine_sec,
                    "symbol quarantined after repeated stops"
                );
            }
            self.persist(&state);
        }
    }

    /// Whether `symbol` is blocked, and the remaining block time in seconds.
    /// An expired block is removed (and the removal persisted).
    pub fn is_quarantined(&self, symbol: &str) -> (bool, f64) {
        self.is_quarantined_at(symbol, epoch_now())
    }

    pub fn is_quarantined_at(&self, symbol: &str, now: f64) -> (bool, f64) {
        let sym = normalize(symbol);
        let mut state = self.inner.lock();
        let until = state.blocked.get(&sym).copied().unwrap_or(0.0);
        if now >= until {
            if state.blocked.remove(&sym).is_some() {
                self.persist(&state);
            }
            return (false, 0.0);
        }
        (true, (until - now).max(0.0))
    }

    /// Manually clear a symbol's block and stop history.
    pub fn lift(&self, symbol: &str) {
        let sym = normalize(symbol);
        let mut state = self.inner.lock();
        state.blocked.remove(&sym);
        state.stops.remove(&sym);
        self.persist(&state);
        info!(symbol = %sym, "quarantine lifted");
    }

    /// Currently blocked symbols with their remaining seconds, for /status.
    pub fn blocked_snapshot(&self) -> Vec<(String, f64)> {
        self.blocked_snapshot_at(epoch_now())
    }

    pub fn blocked_snapshot_at(&self, now: f64) -> Vec<(String, f64)> {
        let state = self.inner.lock();
        let mut out: Vec<(String, f64)> = state
            .blocked
            .iter()
            .filter(|(_, &until)| until > now)
            .map(|(sym, &until)| (sym.clone(), until - now))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Atomic write: tmp sibling + rename. Persist failures are logged and
    /// swallowed; an unwritable disk must not take down the guard path.
    fn persist(&self, state: &PersistedState) {
        if let Err(e) = self.write_atomic(state) {
            warn!(path = %self.path.display(), error = %e, "failed to persist quarantine state");
        }
    }

    fn write_atomic(&self, state: &PersistedState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let content =
            serde_json::to_string(state).context("failed to serialise quarantine state")?;
        let tmp = tmp_sibling(&self.path);
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
