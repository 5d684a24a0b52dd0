//! Fleet-wide scheduling of selection runs.
//!
//! A run over many instances is bounded two ways: a semaphore caps how
//! many selections execute at once, and a busy set keeps one instance
//! from being worked on twice. A periodic tick that arrives while an
//! instance is still mid-run skips that instance instead of queueing
//! behind it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::selector::CancelFlag;

/// What one scheduling pass did.
#[derive(Debug)]
pub struct TickReport<R> {
    /// Completed runs, sorted by instance name.
    pub outcomes: Vec<(String, R)>,
    /// Instances passed over because they were busy or the scheduler
    /// was shutting down.
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct Scheduler {
    limit: Arc<Semaphore>,
    busy: Arc<Mutex<HashSet<String>>>,
    cancel: CancelFlag,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            busy: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancelFlag::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Flag shared with every run this scheduler launches.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the given instances once. Busy instances are skipped, the
    /// rest proceed under the concurrency ceiling.
    pub async fn run_once<F, Fut, R>(&self, names: Vec<String>, runner: F) -> TickReport<R>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let mut skipped = Vec::new();
        let mut tasks = JoinSet::new();

        for name in names {
            if self.cancel.is_cancelled() {
                skipped.push(name);
                continue;
            }
            if !self.claim(&name) {
                debug!(instance = %name, "busy, skipping");
                skipped.push(name);
                continue;
            }
            let permit = match self.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed by shutdown.
                    self.release(&name);
                    skipped.push(name);
                    continue;
                }
            };
            // Guarded release, so a panicking runner cannot leave the
            // instance marked busy forever.
            let guard = BusyGuard {
                busy: self.busy.clone(),
                name: name.clone(),
            };
            let fut = runner(name.clone());
            tasks.spawn(async move {
                let result = fut.await;
                drop(permit);
                drop(guard);
                (name, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(pair) = joined {
                outcomes.push(pair);
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        TickReport { outcomes, skipped }
    }

    /// Tick forever until [`Scheduler::shutdown`]. Each tick launches a
    /// pass without waiting for it, so a pass outlasting the interval
    /// meets the busy-set on the next tick rather than piling up. After
    /// shutdown the loop drains in-flight passes before returning;
    /// their runs see the cancel flag between steps and finish the step
    /// they are on.
    pub async fn run_periodic<F, Fut, R>(
        &self,
        every: Duration,
        names: impl Fn() -> Vec<String>,
        runner: F,
    ) where
        F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => break,
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let tick_names = names();
            if tick_names.is_empty() {
                continue;
            }
            debug!(instances = tick_names.len(), "maintenance tick");
            let scheduler = self.clone();
            let runner = runner.clone();
            passes.spawn(async move {
                let report = scheduler.run_once(tick_names, runner).await;
                if !report.skipped.is_empty() {
                    info!(skipped = ?report.skipped, "tick skipped busy instances");
                }
            });
            while passes.try_join_next().is_some() {}
        }
        while passes.join_next().await.is_some() {}
        info!("periodic schedule stopped");
    }

    /// Stop the periodic loop and fail further launches. Runs already
    /// in flight see the cancel flag at their next step.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.limit.close();
        self.notify.notify_waiters();
    }

    fn claim(&self, name: &str) -> bool {
        self.busy.lock().unwrap().insert(name.to_string())
    }

    fn release(&self, name: &str) {
        self.busy.lock().unwrap().remove(name);
    }
}

/// Clears an instance's busy-set entry when its run ends, panicking
/// runners included.
struct BusyGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.lock().unwrap().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn test_concurrency_ceiling_holds() {
        let scheduler = Scheduler::new(2);
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let names: Vec<String> = (0..6).map(|i| format!("i{i}")).collect();

        let report = scheduler
            .run_once(names, {
                let active = active.clone();
                let peak = peak.clone();
                move |_name| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
            .await;

        assert_eq!(report.outcomes.len(), 6);
        assert!(report.skipped.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_busy_instance_is_skipped_not_queued() {
        let scheduler = Scheduler::new(4);
        let gate = Arc::new(Notify::new());
        let running = Arc::new(Notify::new());

        let long_run = {
            let scheduler = scheduler.clone();
            let gate = gate.clone();
            let running = running.clone();
            tokio::spawn(async move {
                scheduler
                    .run_once(vec!["alpha".to_string()], move |_name| {
                        let gate = gate.clone();
                        let running = running.clone();
                        async move {
                            running.notify_one();
                            gate.notified().await;
                            "held"
                        }
                    })
                    .await
            })
        };
        running.notified().await;

        // A pass while alpha is mid-run: alpha is skipped, beta runs.
        let report = scheduler
            .run_once(
                vec!["alpha".to_string(), "beta".to_string()],
                |_name| async { "done" },
            )
            .await;
        assert_eq!(report.skipped, vec!["alpha".to_string()]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].0, "beta");

        gate.notify_one();
        let first = long_run.await.unwrap();
        assert_eq!(first.outcomes.len(), 1);

        // Released after its run completes.
        let report = scheduler
            .run_once(vec!["alpha".to_string()], |_name| async { "done" })
            .await;
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_run_once_after_shutdown_skips_everything() {
        let scheduler = Scheduler::new(2);
        scheduler.shutdown();
        let report = scheduler
            .run_once(
                vec!["a".to_string(), "b".to_string()],
                |_name| async { "done" },
            )
            .await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn test_panicked_run_frees_the_instance() {
        let scheduler = Scheduler::new(2);
        let report = scheduler
            .run_once(vec!["a".to_string()], |_name| async {
                panic!("runner blew up");
            })
            .await;
        assert!(report.outcomes.is_empty());
        assert!(report.skipped.is_empty());

        // The slot is free again; a later pass runs instead of skipping.
        let report = scheduler
            .run_once(vec!["a".to_string()], |_name| async { "fine" })
            .await;
        assert!(report.skipped.is_empty());
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_inflight_pass() {
        let scheduler = Scheduler::new(2);
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let loop_task = tokio::spawn({
            let scheduler = scheduler.clone();
            let started = started.clone();
            let finished = finished.clone();
            async move {
                scheduler
                    .run_periodic(
                        Duration::from_millis(10),
                        || vec!["a".to_string()],
                        move |_name| {
                            let started = started.clone();
                            let finished = finished.clone();
                            async move {
                                started.notify_one();
                                tokio::time::sleep(Duration::from_millis(120)).await;
                                finished.store(true, Ordering::SeqCst);
                            }
                        },
                    )
                    .await;
            }
        });

        started.notified().await;
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .expect("loop drains and exits")
            .unwrap();

        // The in-flight run was allowed to finish, not dropped mid-step.
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_stops_periodic_loop() {
        let scheduler = Scheduler::new(2);
        let ticks = Arc::new(AtomicU32::new(0));
        let loop_task = tokio::spawn({
            let scheduler = scheduler.clone();
            let ticks = ticks.clone();
            async move {
                scheduler
                    .run_periodic(
                        Duration::from_millis(20),
                        || vec!["a".to_string()],
                        move |_name| {
                            let ticks = ticks.clone();
                            async move {
                                ticks.fetch_add(1, Ordering::SeqCst);
                            }
                        },
                    )
                    .await;
            }
        });

        tokio::time::sleep(Duration::from_millis(90)).await;
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(1), loop_task)
            .await
            .expect("loop exits after shutdown")
            .unwrap();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
