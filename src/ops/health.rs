// =============================================================================
// Health Notifier — debounced state transitions → notification sink
// =============================================================================
//
// Subscribes to `health.state`. Duplicate states are suppressed; transitions
// inside the debounce window are ignored entirely. Accepted transitions bump
// a (from, to, reason) counter surfaced in /status and push a formatted
// message to the sink. Sink failures never propagate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::bus::{self, EventBus, Payload};
use crate::config::HealthConfig;
use crate::ops::notify::NotifySink;
use crate::types::{epoch_now, HealthState};

#[derive(Debug, Clone, Serialize)]
pub struct TransitionCount {
    pub from: u8,
    pub to: u8,
    pub reason: String,
    pub count: u64,
}

struct Inner {
    last_state: HealthState,
    last_change_ts: f64,
    transitions: HashMap<(u8, u8, String), u64>,
}

pub struct HealthNotifier {
    cfg: HealthConfig,
    sink: Arc<dyn NotifySink>,
    inner: Mutex<Inner>,
}

impl HealthNotifier {
    pub fn new(cfg: HealthConfig, sink: Arc<dyn NotifySink>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sink,
            inner: Mutex::new(Inner {
                last_state: HealthState::Ok,
                last_change_ts: 0.0,
                transitions: HashMap::new(),
            }),
        })
    }

    pub fn wire(self: &Arc<Self>, bus: &EventBus) {
        let notifier = self.clone();
        bus.subscribe(
            "health.state",
            bus::handler(move |payload| {
                let notifier = notifier.clone();
                async move {
                    notifier.on_health_state(payload, epoch_now()).await;
                }
            }),
        );
    }

    pub fn current_state(&self) -> HealthState {
        self.inner.lock().last_state
    }

    pub fn transition_counts(&self) -> Vec<TransitionCount> {
        let inner = self.inner.lock();
        let mut out: Vec<TransitionCount> = inner
            .transitions
            .iter()
            .map(|((from, to, reason), &count)| TransitionCount {
                from: *from,
                to: *to,
                reason: reason.clone(),
                count,
            })
            .collect();
        out.sort_by(|a, b| (a.from, a.to, &a.reason).cmp(&(b.from, b.to, &b.reason)));
        out
    }

    pub async fn on_health_state(&self, evt: Payload, now: f64) {
        if !self.cfg.tg_enabled {
            return;
        }
        let Some(new_state) = evt["state"].as_i64().and_then(HealthState::from_code) else {
            return;
        };
        let reason = evt["reason"].as_str().unwrap_or("").to_string();

        let accepted = {
            let mut inner = self.inner.lock();
            if new_state == inner.last_state {
                None
            } else if now - inner.last_change_ts < self.cfg.debounce_sec {
                None
            } else {
                let from = inner.last_state;
                *inner
                    .transitions
                    .entry((from.code(), new_state.code(), reason.clone()))
                    .or_insert(0) += 1;
                inner.last_state = new_state;
                inner.last_change_ts = now;
                Some(from)
            }
        };

        if accepted.is_none() {
            return;
        }

        let emoji = match new_state {
            HealthState::Ok => "🟢",
            HealthState::Degraded => "🟡",
            HealthState::Halted => "🔴",
        };
        let msg = format!(
            "{emoji} *Health state:* {}\n*Reason:* `{reason}`",
            new_state.label()
        );
        if let Err(e) = self.sink.send(&msg, Some("Markdown")).await {
            warn!(error = %e, "health notification send failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::notify::RecordingSink;

    fn notifier(sink: Arc<RecordingSink>) -> Arc<HealthNotifier> {
        HealthNotifier::new(
            HealthConfig {
                tg_enabled: true,
                debounce_sec: 10.0,
            },
            sink,
        )
    }

    fn evt(state: i64, reason: &str) -> Payload {
        serde_json::json!({ "state": state, "reason": reason })
    }

    #[tokio::test]
    async fn first_transition_sends_duplicate_suppressed() {
        let sink = RecordingSink::new();
        let hn = notifier(sink.clone());

        hn.on_health_state(evt(2, "test"), 1000.0).await;
        hn.on_health_state(evt(2, "dup"), 1030.0).await;

        assert_eq!(sink.messages.lock().len(), 1);
        assert!(sink.messages.lock()[0].contains("HALTED"));
        assert_eq!(hn.current_state(), HealthState::Halted);
    }

    #[tokio::test]
    async fn debounce_window_drops_transition() {
        let sink = RecordingSink::new();
        let hn = notifier(sink.clone());

        hn.on_health_state(evt(1, "ws_disconnected"), 1000.0).await;
        // Real transition, but inside the 10s debounce window.
        hn.on_health_state(evt(0, "ws_connected"), 1005.0).await;
        assert_eq!(sink.messages.lock().len(), 1);
        assert_eq!(hn.current_state(), HealthState::Degraded);

        // Past the window it is accepted.
        hn.on_health_state(evt(0, "ws_connected"), 1011.0).await;
        assert_eq!(sink.messages.lock().len(), 2);
        assert_eq!(hn.current_state(), HealthState::Ok);
    }

    #[tokio::test]
    async fn transition_counter_labels() {
        let sink = RecordingSink::new();
        let hn = notifier(sink.clone());

        hn.on_health_state(evt(1, "ws_silent"), 1000.0).await;
        hn.on_health_state(evt(0, "ws_connected"), 1020.0).await;
        hn.on_health_state(evt(1, "ws_silent"), 1040.0).await;

        let counts = hn.transition_counts();
        let silent = counts
            .iter()
            .find(|c| c.reason == "ws_silent" && c.from == 0)
            .unwrap();
        assert_eq!(silent.count, 1);
        assert_eq!(counts.iter().map(|c| c.count).sum::<u64>(), 3);
    }

    #[tokio::test]
    async fn sink_failure_does_not_propagate_or_block_state() {
        let sink = RecordingSink::new();
        sink.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let hn = notifier(sink.clone());

        hn.on_health_state(evt(2, "depeg_trigger"), 1000.0).await;
        assert_eq!(hn.current_state(), HealthState::Halted);
        assert!(sink.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_config_ignores_everything() {
        let sink = RecordingSink::new();
        let hn = HealthNotifier::new(
            HealthConfig {
                tg_enabled: false,
                debounce_sec: 10.0,
            },
            sink.clone(),
        );
        hn.on_health_state(evt(2, "test"), 1000.0).await;
        assert!(sink.messages.lock().is_empty());
        assert_eq!(hn.current_state(), HealthState::Ok);
    }

    #[tokio::test]
    async fn malformed_state_ignored() {
        let sink = RecordingSink::new();
        let hn = notifier(sink.clone());
        hn.on_health_state(serde_json::json!({ "state": "broken" }), 1000.0)
            .await;
        hn.on_health_state(serde_json::json!({ "state": 9 }), 1000.0).await;
        assert!(sink.messages.lock().is_empty());
    }
}
