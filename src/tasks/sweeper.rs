//! Cleanup Sweeper
//!
//! Background task that periodically removes expired cache entries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lock::mutex_lock;

const SOURCE: &str = "tasks::sweeper";

// == Sweep Report ==
/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed
    pub removed: usize,
    /// Per-entry failures that were isolated and skipped
    pub failures: usize,
}

/// The work a sweeper runs on every tick.
pub type SweepFn = Arc<dyn Fn() -> SweepReport + Send + Sync>;

// == Sweeper ==
/// Owns the periodic cleanup task for one cache.
///
/// Passes never overlap: the periodic loop waits for the running pass, and
/// `sweep_once` shares the same guard.
pub struct Sweeper {
    name: String,
    sweep_fn: Mutex<Option<SweepFn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<Mutex<()>>,
}

impl Sweeper {
    /// Creates an idle sweeper; `name` tags log lines.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sweep_fn: Mutex::new(None),
            handle: Mutex::new(None),
            running: Arc::new(Mutex::new(())),
        }
    }

    // == Start ==
    /// Schedules `sweep_fn` every `interval`, replacing any running schedule.
    ///
    /// The first pass runs one full interval after the call. Returns false
    /// when there is no tokio runtime to spawn on; `sweep_once` still works.
    pub fn start(&self, interval: Duration, sweep_fn: SweepFn) -> bool {
        self.stop();
        *mutex_lock(&self.sweep_fn, SOURCE, "start") = Some(sweep_fn.clone());

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    cache = %self.name,
                    "No tokio runtime available, periodic cleanup disabled"
                );
                return false;
            }
        };

        let name = self.name.clone();
        let running = self.running.clone();
        let handle = runtime.spawn(async move {
            info!(
                cache = %name,
                "Starting TTL cleanup task with interval of {:?}", interval
            );

            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let report = run_guarded(&running, &sweep_fn);
                log_report(&name, report);
            }
        });

        *mutex_lock(&self.handle, SOURCE, "start") = Some(handle);
        true
    }

    // == Stop ==
    /// Cancels the periodic task. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = mutex_lock(&self.handle, SOURCE, "stop").take() {
            handle.abort();
            debug!(cache = %self.name, "Cleanup task stopped");
        }
    }

    // == Sweep Once ==
    /// Runs one pass synchronously with the configured sweep function.
    pub fn sweep_once(&self) -> SweepReport {
        let sweep_fn = mutex_lock(&self.sweep_fn, SOURCE, "sweep_once").clone();
        match sweep_fn {
            Some(sweep_fn) => {
                let report = run_guarded(&self.running, &sweep_fn);
                log_report(&self.name, report);
                report
            }
            None => SweepReport::default(),
        }
    }

    /// True while the periodic task is scheduled.
    pub fn is_running(&self) -> bool {
        mutex_lock(&self.handle, SOURCE, "is_running")
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_guarded(running: &Mutex<()>, sweep_fn: &SweepFn) -> SweepReport {
    let _guard = mutex_lock(running, SOURCE, "sweep");
    sweep_fn()
}

fn log_report(name: &str, report: SweepReport) {
    if report.failures > 0 {
        warn!(
            cache = %name,
            failures = report.failures,
            "TTL cleanup: {} entries failed to notify", report.failures
        );
    }
    if report.removed > 0 {
        info!(cache = %name, "TTL cleanup: removed {} expired entries", report.removed);
    } else {
        debug!(cache = %name, "TTL cleanup: no expired entries found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_sweep(counter: Arc<AtomicUsize>) -> SweepFn {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            SweepReport {
                removed: 1,
                failures: 0,
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::new("test");

        assert!(sweeper.start(Duration::from_secs(1), counting_sweep(counter.clone())));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        sweeper.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stop_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::new("test");
        sweeper.start(Duration::from_secs(1), counting_sweep(counter.clone()));

        sweeper.stop();
        sweeper.stop();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn test_sweep_once_without_schedule() {
        let sweeper = Sweeper::new("test");
        assert_eq!(sweeper.sweep_once(), SweepReport::default());

        let counter = Arc::new(AtomicUsize::new(0));
        sweeper.start(Duration::from_secs(3600), counting_sweep(counter.clone()));
        assert_eq!(sweeper.sweep_once().removed, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_outside_runtime_keeps_manual_sweeps() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::new("test");

        assert!(!sweeper.start(Duration::from_secs(1), counting_sweep(counter.clone())));
        assert!(!sweeper.is_running());
        sweeper.sweep_once();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
