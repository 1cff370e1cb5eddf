// =============================================================================
// Model Promotion Watcher — polls artifact mtimes, announces promotions
// =============================================================================
//
// The trainer promotes a model by atomically replacing its artifact files.
// This watcher polls the configured paths, tracks the max mtime seen, and
// fires `model.promoted` with every path at the new maximum. The first
// observation only seeds the baseline. Missing files are skipped silently —
// artifacts appear and disappear during promotion.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::bus::EventBus;
use crate::config::ModelWatchConfig;

pub struct ModelPromotionWatcher {
    paths: Vec<PathBuf>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    last_mtime: Mutex<Option<f64>>,
}

fn mtime_epoch(meta: &std::fs::Metadata) -> Option<f64> {
    meta.modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

impl ModelPromotionWatcher {
    pub fn new(cfg: &ModelWatchConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            paths: cfg.paths.iter().map(PathBuf::from).collect(),
            bus,
            poll_interval: Duration::from_secs_f64(cfg.poll_interval_sec),
            last_mtime: Mutex::new(None),
        })
    }

    /// One poll pass. Returns the promotion payload when a newer artifact was
    /// observed (after the baseline has been seeded).
    pub fn probe(&self) -> Option<serde_json::Value> {
        let mut latest_mtime = f64::MIN;
        let mut latest_paths: Vec<String> = Vec::new();

        for path in &self.paths {
            let Ok(meta) = std::fs::metadata(path) else {
                continue;
            };
            let Some(mtime) = mtime_epoch(&meta) else {
                continue;
            };
            if mtime > latest_mtime {
                latest_mtime = mtime;
                latest_paths = vec![path.to_string_lossy().into_owned()];
            } else if mtime == latest_mtime {
                latest_paths.push(path.to_string_lossy().into_owned());
            }
        }

        if latest_paths.is_empty() {
            return None;
        }

        let mut last = self.last_mtime.lock();
        match *last {
            None => {
                // First observation seeds the baseline without firing.
                *last = Some(latest_mtime);
                None
            }
            Some(prev) if latest_mtime > prev => {
                *last = Some(latest_mtime);
                Some(serde_json::json!({
                    "paths": latest_paths,
                    "mtime": latest_mtime,
                }))
            }
            Some(_) => None,
        }
    }

    /// Supervised loop: probe, fire, sleep.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            info!("model watcher idle — no paths configured");
            return Ok(());
        }
        loop {
            if let Some(payload) = self.probe() {
                info!(paths = ?payload["paths"], "model promotion detected");
                self.bus.fire("model.promoted", payload);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn watcher_for(paths: Vec<PathBuf>) -> Arc<ModelPromotionWatcher> {
        let cfg = ModelWatchConfig {
            paths: paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            poll_interval_sec: 1.0,
        };
        ModelPromotionWatcher::new(&cfg, Arc::new(EventBus::new(0)))
    }

    fn set_mtime(path: &PathBuf, epoch: u64) {
        let t = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(epoch);
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(t).unwrap();
    }

    #[test]
    fn first_probe_seeds_without_firing() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.bin");
        fs::write(&model, b"v1").unwrap();

        let watcher = watcher_for(vec![model]);
        assert!(watcher.probe().is_none());
    }

    #[test]
    fn newer_mtime_fires_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.bin");
        fs::write(&model, b"v1").unwrap();
        set_mtime(&model, 1_700_000_000);

        let watcher = watcher_for(vec![model.clone()]);
        assert!(watcher.probe().is_none()); // baseline

        set_mtime(&model, 1_700_000_100);
        let payload = watcher.probe().expect("promotion expected");
        assert_eq!(payload["paths"][0], model.to_string_lossy().into_owned());
        assert_eq!(payload["mtime"], 1_700_000_100.0);

        // Unchanged afterwards: quiet.
        assert!(watcher.probe().is_none());
    }

    #[test]
    fn ties_report_all_newest_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"y").unwrap();
        set_mtime(&a, 1_700_000_000);
        set_mtime(&b, 1_700_000_000);

        let watcher = watcher_for(vec![a.clone(), b.clone()]);
        assert!(watcher.probe().is_none());

        set_mtime(&a, 1_700_000_500);
        set_mtime(&b, 1_700_000_500);
        let payload = watcher.probe().unwrap();
        assert_eq!(payload["paths"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.bin");
        let missing = dir.path().join("missing.bin");
        fs::write(&present, b"x").unwrap();
        set_mtime(&present, 1_700_000_000);

        let watcher = watcher_for(vec![missing, present.clone()]);
        assert!(watcher.probe().is_none());
        set_mtime(&present, 1_700_000_200);
        assert!(watcher.probe().is_some());
    }
}
