//! Worker pool that pulls keys off the queue and applies the outcome policy
//!
//! Each worker loop takes one eligible key, invokes the reconciler under a
//! wall-clock deadline, and then performs exactly one of:
//!
//! - success, no follow-up: `forget` (resets backoff)
//! - success, scheduled follow-up: `forget` + `add_after`
//! - conflict: immediate `add` (the next pass re-reads fresh state)
//! - any other failure: `add_rate_limited`
//!
//! and always `done`. Workers exit cooperatively once the queue shuts down;
//! an in-flight reconcile runs to completion first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{Action, ObjectKey, Reconcile, WorkQueue};
use crate::Error;

/// Tuning knobs for the [`Dispatcher`]
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of concurrent worker loops (N >= 1)
    pub workers: usize,
    /// Wall-clock budget for one reconcile pass; exceeding it is a
    /// transient error
    pub reconcile_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            reconcile_timeout: Duration::from_secs(crate::DEFAULT_RECONCILE_TIMEOUT_SECS),
        }
    }
}

/// Runs N worker loops over one shared [`WorkQueue`]
///
/// Per-key reconciles are strictly serialized by the queue; across different
/// keys they run in parallel with no ordering guarantee.
pub struct Dispatcher<R> {
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    config: EngineConfig,
}

impl<R: Reconcile> Dispatcher<R> {
    /// Create a dispatcher over the given queue and reconciler
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<R>, config: EngineConfig) -> Self {
        Self {
            queue,
            reconciler,
            config,
        }
    }

    /// Run all worker loops until the queue shuts down and drains
    pub async fn run(self) {
        let workers = self.config.workers.max(1);
        info!(workers, "starting dispatcher");

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let queue = self.queue.clone();
                let reconciler = self.reconciler.clone();
                let timeout = self.config.reconcile_timeout;
                tokio::spawn(async move {
                    worker_loop(id, queue, reconciler, timeout).await;
                })
            })
            .collect();

        for handle in handles {
            // Worker loops only end by returning; a join error means a panic
            // escaped the reconciler, which we surface in the log
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("dispatcher stopped");
    }
}

async fn worker_loop<R: Reconcile>(
    id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    timeout: Duration,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let outcome = match tokio::time::timeout(timeout, reconciler.reconcile(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::DeadlineExceeded(timeout)),
        };

        match outcome {
            Ok(Action::AwaitChange) => {
                queue.forget(&key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                debug!(key = %key, delay_secs = delay.as_secs(), "scheduled follow-up");
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) if e.is_conflict() => {
                warn!(key = %key, error = %e, "conflict, retrying with fresh read");
                queue.add(key.clone());
            }
            Err(e) => {
                error!(key = %key, error = %e, "reconcile failed, backing off");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted reconciler: pops the next outcome for a key and records the
    /// maximum observed concurrency per key
    struct ScriptedReconciler {
        script: Mutex<HashMap<ObjectKey, Vec<Result<Action, Error>>>>,
        calls: Mutex<Vec<ObjectKey>>,
        in_flight: Mutex<HashMap<ObjectKey, usize>>,
        overlapped: Mutex<bool>,
        pause: Duration,
    }

    impl ScriptedReconciler {
        fn new(pause: Duration) -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                overlapped: Mutex::new(false),
                pause,
            }
        }

        fn on(&self, key: &ObjectKey, outcome: Result<Action, Error>) {
            self.script
                .lock()
                .unwrap()
                .entry(key.clone())
                .or_default()
                .push(outcome);
        }

        fn calls_for(&self, key: &ObjectKey) -> usize {
            self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
        }
    }

    #[async_trait]
    impl Reconcile for ScriptedReconciler {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let count = in_flight.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    *self.overlapped.lock().unwrap() = true;
                }
            }
            self.calls.lock().unwrap().push(key.clone());
            tokio::time::sleep(self.pause).await;
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if let Some(count) = in_flight.get_mut(key) {
                    *count -= 1;
                }
            }
            let mut script = self.script.lock().unwrap();
            let outcomes = script.entry(key.clone()).or_default();
            if outcomes.is_empty() {
                Ok(Action::AwaitChange)
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    async fn run_until_drained(
        queue: Arc<WorkQueue>,
        reconciler: Arc<ScriptedReconciler>,
        workers: usize,
        settle: Duration,
    ) {
        let dispatcher = Dispatcher::new(
            queue.clone(),
            reconciler,
            EngineConfig {
                workers,
                reconcile_timeout: Duration::from_secs(60),
            },
        );
        let handle = tokio::spawn(dispatcher.run());
        tokio::time::sleep(settle).await;
        queue.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_key_is_processed_once() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::ZERO));
        queue.add(key("a"));

        run_until_drained(queue.clone(), reconciler.clone(), 1, Duration::from_secs(1)).await;

        assert_eq!(reconciler.calls_for(&key("a")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_schedules_a_second_delivery() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::ZERO));
        reconciler.on(&key("a"), Ok(Action::requeue(Duration::from_secs(5))));
        queue.add(key("a"));

        run_until_drained(queue.clone(), reconciler.clone(), 1, Duration::from_secs(10)).await;

        // First delivery returned RequeueAfter(5s); the follow-up delivery
        // returned AwaitChange and ended the cycle
        assert_eq!(reconciler.calls_for(&key("a")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_with_backoff() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::ZERO));
        reconciler.on(&key("a"), Err(Error::serialization("boom")));
        queue.add(key("a"));

        // 1s base backoff: the retry lands inside the settle window
        run_until_drained(queue.clone(), reconciler.clone(), 1, Duration::from_secs(5)).await;

        assert_eq!(reconciler.calls_for(&key("a")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_retried_immediately() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::ZERO));
        reconciler.on(&key("a"), Err(Error::conflict("stale write")));
        queue.add(key("a"));

        // Settle window far below the 1s backoff base: only an immediate
        // retry can land here
        run_until_drained(
            queue.clone(),
            reconciler.clone(),
            1,
            Duration::from_millis(100),
        )
        .await;

        assert_eq!(reconciler.calls_for(&key("a")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_never_reconciles_concurrently() {
        let queue = Arc::new(WorkQueue::new());
        // Slow reconciles + 4 workers: overlap would happen without the
        // queue's in-flight deferral
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::from_millis(200)));
        queue.add(key("a"));

        let dispatcher = Dispatcher::new(
            queue.clone(),
            reconciler.clone(),
            EngineConfig {
                workers: 4,
                reconcile_timeout: Duration::from_secs(60),
            },
        );
        let handle = tokio::spawn(dispatcher.run());

        // Rapid duplicate deliveries while the first reconcile is running
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            queue.add(key("a"));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.shutdown();
        handle.await.unwrap();

        assert!(!*reconciler.overlapped.lock().unwrap());
        assert!(reconciler.calls_for(&key("a")) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_in_parallel() {
        let queue = Arc::new(WorkQueue::new());
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::from_millis(500)));
        queue.add(key("a"));
        queue.add(key("b"));

        let started = tokio::time::Instant::now();
        run_until_drained(queue.clone(), reconciler.clone(), 2, Duration::from_secs(1)).await;

        // Two 500ms reconciles on two workers fit in ~1s of virtual time;
        // serial execution would need 1s before the settle window closed
        assert_eq!(reconciler.calls_for(&key("a")), 1);
        assert_eq!(reconciler.calls_for(&key("b")), 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_counts_as_transient() {
        let queue = Arc::new(WorkQueue::new());
        // Reconcile takes 10s but the budget is 1s
        let reconciler = Arc::new(ScriptedReconciler::new(Duration::from_secs(10)));
        queue.add(key("a"));

        let dispatcher = Dispatcher::new(
            queue.clone(),
            reconciler.clone(),
            EngineConfig {
                workers: 1,
                reconcile_timeout: Duration::from_secs(1),
            },
        );
        let handle = tokio::spawn(dispatcher.run());
        // First attempt times out at 1s, backs off 1s, second attempt starts
        // at ~2s and times out at ~3s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        queue.shutdown();
        handle.await.unwrap();

        assert!(reconciler.calls_for(&key("a")) >= 2);
    }
}
