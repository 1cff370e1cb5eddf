// =============================================================================
// Supervised Task Runner + Watchdog
// =============================================================================
//
// The supervisor owns every long-lived task in the engine (WS stream, digest,
// fee manager, depeg tick, model watcher). Each task receives a shutdown
// receiver; on error it is restarted with jittered backoff (500 ms → 1 s →
// 2 s, holding at the last step). Shutdown broadcasts the signal and joins
// each task within a bounded grace period; a task that overruns the global
// deadline forces the process down so the orchestrator restarts it clean.
//
// The watchdog is the only cross-thread interaction in the engine: an OS
// thread that checks a heartbeat timestamp every 5 s and self-kills the
// process (exit code 1) when the event loop stalls.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::types::epoch_now;

/// A run of a supervised task finished this long after starting; treat it as
/// a stable run and reset the backoff ladder.
const STABLE_RUN_SEC: u64 = 60;

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Factory invoked for every (re)start of a supervised task. The receiver
/// flips to `true` on shutdown; tasks must select on it and return promptly.
pub type TaskFactory =
    Box<dyn Fn(watch::Receiver<bool>) -> TaskFuture + Send + Sync + 'static>;

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    cfg: SupervisorConfig,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            cfg,
        }
    }

    /// A fresh receiver for the shutdown signal, for wiring into non-supervised
    /// consumers (e.g. the API server's graceful-shutdown future).
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named task under supervision. The factory is re-invoked after
    /// every failure, with backoff; a clean `Ok(())` return ends supervision.
    pub fn spawn(&self, name: &str, factory: TaskFactory) {
        let name = name.to_string();
        let backoff_ms = self.cfg.backoff_ms.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut attempt: usize = 0;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let started = std::time::Instant::now();
                let fut = factory(shutdown_rx.clone());
                match fut.await {
                    Ok(()) => {
                        info!(task = %task_name, "supervised task finished cleanly");
                        break;
                    }
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if started.elapsed().as_secs() >= STABLE_RUN_SEC {
                            attempt = 0;
                        }
                        let step = backoff_ms[attempt.min(backoff_ms.len() - 1)];
                        attempt += 1;
                        let jitter = rand::thread_rng().gen_range(0..200);
                        warn!(
                            task = %task_name,
                            error = %e,
                            backoff_ms = step + jitter,
                            "supervised task failed — restarting"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(step + jitter)) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                }
            }
        });

        self.tasks.lock().push((name, handle));
    }

    /// Broadcast shutdown and join every task within the configured grace.
    ///
    /// Returns `true` if all tasks stopped in time. On overrun the caller is
    /// expected to force-exit; the overrunning handles are aborted here so a
    /// polite caller can still proceed.
    pub async fn shutdown(&self) -> bool {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());

        let task_grace = Duration::from_secs(self.cfg.task_grace_sec);
        let deadline =
            std::time::Instant::now() + Duration::from_secs(self.cfg.shutdown_grace_sec);
        let mut all_clean = true;

        for (name, mut handle) in handles {
            let remaining = deadline
                .saturating_duration_since(std::time::Instant::now())
                .min(task_grace);
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => info!(task = %name, "task stopped"),
                Err(_) => {
                    error!(task = %name, "task exceeded shutdown grace — aborting");
                    handle.abort();
                    all_clean = false;
                }
            }
        }

        all_clean
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Self-kill guard against event-loop stalls. `heartbeat()` is called from a
/// loop-resident ticker; the monitor thread terminates the process when the
/// gap exceeds the timeout, so an external orchestrator can restart us.
pub struct Watchdog {
    last_tick: Arc<AtomicU64>,
    timeout_sec: u64,
}

impl Watchdog {
    pub fn new(timeout_sec: u64) -> Self {
        Self {
            last_tick: Arc::new(AtomicU64::new(epoch_now() as u64)),
            timeout_sec,
        }
    }

    pub fn heartbeat(&self) {
        self.last_tick.store(epoch_now() as u64, Ordering::Relaxed);
    }

    /// Whether the heartbeat gap exceeds the timeout at `now`.
    pub fn stalled_at(&self, now: u64) -> bool {
        now.saturating_sub(self.last_tick.load(Ordering::Relaxed)) > self.timeout_sec
    }

    /// Start the monitor thread. Checks every 5 s; on breach, logs critical
    /// and terminates the process with exit code 1.
    pub fn start(&self) {
        let last_tick = self.last_tick.clone();
        let timeout = self.timeout_sec;
        std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                info!(timeout_sec = timeout, "watchdog started");
                loop {
                    std::thread::sleep(Duration::from_secs(5));
                    let now = epoch_now() as u64;
                    let gap = now.saturating_sub(last_tick.load(Ordering::Relaxed));
                    if gap > timeout {
                        error!(gap_sec = gap, "WATCHDOG: engine stalled — terminating process");
                        std::process::exit(1);
                    }
                }
            })
            .expect("failed to spawn watchdog thread");
    }

    /// Spawn the in-loop heartbeat ticker as a supervised task factory.
    pub fn ticker(self: &Arc<Self>) -> TaskFactory {
        let wd = self.clone();
        Box::new(move |mut shutdown_rx: watch::Receiver<bool>| {
            let wd = wd.clone();
            Box::pin(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = interval.tick() => wd.heartbeat(),
                        _ = shutdown_rx.changed() => return Ok(()),
                    }
                }
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_cfg() -> SupervisorConfig {
        SupervisorConfig {
            backoff_ms: vec![1, 2, 4],
            task_grace_sec: 1,
            shutdown_grace_sec: 2,
            watchdog_timeout_sec: 30,
        }
    }

    #[tokio::test]
    async fn restarts_failing_task_until_success() {
        let sup = Supervisor::new(test_cfg());
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_f = runs.clone();
        sup.spawn(
            "flaky",
            Box::new(move |_rx| {
                let runs_f = runs_f.clone();
                Box::pin(async move {
                    let n = runs_f.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        anyhow::bail!("boom #{n}");
                    }
                    Ok(())
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn shutdown_cancels_long_running_task() {
        let sup = Supervisor::new(test_cfg());

        sup.spawn(
            "long",
            Box::new(move |mut rx: watch::Receiver<bool>| {
                Box::pin(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                            _ = rx.changed() => return Ok(()),
                        }
                    }
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.shutdown().await);
    }

    #[tokio::test]
    async fn shutdown_reports_overrunning_task() {
        let sup = Supervisor::new(test_cfg());

        // Ignores the shutdown signal entirely.
        sup.spawn(
            "stubborn",
            Box::new(move |_rx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sup.shutdown().await);
    }

    #[test]
    fn watchdog_stall_detection() {
        let wd = Watchdog::new(30);
        let now = epoch_now() as u64;
        assert!(!wd.stalled_at(now));
        assert!(!wd.stalled_at(now + 30));
        assert!(wd.stalled_at(now + 31));
        wd.heartbeat();
        assert!(!wd.stalled_at(epoch_now() as u64));
    }
}
