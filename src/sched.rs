// =============================================================================
// Scheduler — named recurring tasks on independent intervals
// =============================================================================
//
// A cooperative task runner on the tokio runtime. Each registered task owns
// a timer loop; at most one instance of a named task runs at a time — when a
// tick fires while the previous invocation is still in flight, the tick is
// dropped and logged instead of queued.
//
// `stop()` flips a watch flag all loops select on, then waits for in-flight
// handlers up to a grace period before abandoning them. A handler that
// fails is the handler's problem: bodies return (), and anything fallible
// inside them logs its own errors. The scheduler never dies with a task.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed handler future.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler factory invoked once per tick.
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

enum TaskSpec {
    Recurring {
        interval: Duration,
        initial_delay: Duration,
        handler: TaskHandler,
    },
    Once {
        delay: Duration,
        handler: TaskHandler,
    },
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, TaskSpec>,
    running: HashMap<String, JoinHandle<()>>,
    started: bool,
}

/// Process-wide task runner.
pub struct Scheduler {
    registry: Mutex<Registry>,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Mutex::new(Registry::default()),
            shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a recurring task. First tick fires after `interval`.
    pub fn schedule_recurring(&self, name: &str, interval: Duration, handler: TaskHandler) {
        self.schedule_recurring_offset(name, interval, Duration::ZERO, handler);
    }

    /// Register a recurring task whose first tick is pushed out by
    /// `initial_delay` — how the per-symbol market-data tasks stagger.
    pub fn schedule_recurring_offset(
        &self,
        name: &str,
        interval: Duration,
        initial_delay: Duration,
        handler: TaskHandler,
    ) {
        let spec = TaskSpec::Recurring {
            interval,
            initial_delay,
            handler,
        };
        let mut registry = self.registry.lock();
        if registry.started {
            let handle = self.spawn(name.to_string(), spec);
            registry.running.insert(name.to_string(), handle);
        } else {
            registry.pending.insert(name.to_string(), spec);
        }
    }

    /// Register a one-shot task.
    pub fn schedule_once(&self, name: &str, delay: Duration, handler: TaskHandler) {
        let spec = TaskSpec::Once { delay, handler };
        let mut registry = self.registry.lock();
        if registry.started {
            let handle = self.spawn(name.to_string(), spec);
            registry.running.insert(name.to_string(), handle);
        } else {
            registry.pending.insert(name.to_string(), spec);
        }
    }

    /// Cancel a task by name, whether pending or running.
    pub fn cancel(&self, name: &str) {
        let mut registry = self.registry.lock();
        registry.pending.remove(name);
        if let Some(handle) = registry.running.remove(name) {
            handle.abort();
            info!(task = name, "task cancelled");
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn every registered task loop.
    pub fn start(&self) {
        let mut registry = self.registry.lock();
        if registry.started {
            return;
        }
        registry.started = true;

        let pending: Vec<(String, TaskSpec)> = registry.pending.drain().collect();
        for (name, spec) in pending {
            let handle = self.spawn(name.clone(), spec);
            registry.running.insert(name, handle);
        }
        info!(tasks = registry.running.len(), "scheduler started");
    }

    /// Stop all task loops: no new ticks fire, in-flight handlers get
    /// `grace` to finish, stragglers are abandoned.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.load(Ordering::SeqCst),
                    "grace period elapsed — abandoning in-flight handlers"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let mut registry = self.registry.lock();
        for (name, handle) in registry.running.drain() {
            handle.abort();
            debug!(task = %name, "task loop stopped");
        }
        info!("scheduler stopped");
    }

    /// Number of handler invocations currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn spawn(&self, name: String, spec: TaskSpec) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let in_flight = self.in_flight.clone();

        match spec {
            TaskSpec::Once { delay, handler } => tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
                in_flight.fetch_add(1, Ordering::SeqCst);
                handler().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                debug!(task = %name, "one-shot task complete");
            }),

            TaskSpec::Recurring {
                interval,
                initial_delay,
                handler,
            } => tokio::spawn(async move {
                if !initial_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(initial_delay) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }

                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let busy = Arc::new(AtomicBool::new(false));

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if busy
                                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                .is_err()
                            {
                                warn!(task = %name, "previous invocation still running — tick dropped");
                                continue;
                            }

                            in_flight.fetch_add(1, Ordering::SeqCst);
                            let fut = handler();
                            let busy = busy.clone();
                            let in_flight = in_flight.clone();
                            tokio::spawn(async move {
                                fut.await;
                                busy.store(false, Ordering::SeqCst);
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("Scheduler")
            .field("started", &registry.started)
            .field("pending", &registry.pending.len())
            .field("running", &registry.running.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn counting_handler(counter: Arc<AtomicUsize>) -> TaskHandler {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_task_fires_on_interval() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring("tick", Duration::from_secs(1), counting_handler(count.clone()));
        sched.start();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_do_not_fire_before_start() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring("tick", Duration::from_secs(1), counting_handler(count.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sched.start();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_drops_overlapping_ticks() {
        let sched = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));

        let (running_c, max_c, done_c) = (running.clone(), max_seen.clone(), completions.clone());
        sched.schedule_recurring(
            "slow",
            Duration::from_secs(1),
            Arc::new(move || {
                let running = running_c.clone();
                let max_seen = max_c.clone();
                let completions = done_c.clone();
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    // Runs for 2.5 intervals.
                    tokio::time::sleep(Duration::from_millis(2_500)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    completions.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        sched.start();

        tokio::time::sleep(Duration::from_millis(9_900)).await;
        // Ticks at 1..9s; runs start at 1s, 4s(?), 7s — never concurrently.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(completions.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_once_fires_exactly_once() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_once("boot", Duration::from_secs(2), counting_handler(count.clone()));
        sched.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_staggers_first_tick() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring_offset(
            "staggered",
            Duration::from_secs(5),
            Duration::from_secs(10),
            counting_handler(count.clone()),
        );
        sched.start();

        tokio::time::sleep(Duration::from_millis(14_900)).await;
        // delay 10s + first interval 5s = 15s for the first tick.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring("tick", Duration::from_secs(1), counting_handler(count.clone()));
        sched.start();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        sched.cancel("tick");
        let at_cancel = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_all_ticks() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring("a", Duration::from_secs(1), counting_handler(count.clone()));
        sched.schedule_recurring("b", Duration::from_secs(2), counting_handler(count.clone()));
        sched.start();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        let before = count.load(Ordering::SeqCst);
        assert!(before > 0);

        sched.stop(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_after_start_spawns_immediately() {
        let sched = Scheduler::new();
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        sched.schedule_recurring("late", Duration::from_secs(1), counting_handler(count.clone()));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
