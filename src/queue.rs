//! Bounded-concurrency, rate-limited request scheduler with retries.
//!
//! Tasks wait in a FIFO list and start only while both limits hold: fewer
//! than `max_concurrency` calls in flight and at least one token left in
//! the current one-second window. The token window refills wholesale on a
//! fixed timer rather than sliding, so a burst of starts right after a
//! refill is expected behavior.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::ai::{retry, Completion, CompletionError};
use crate::config::QueueConfig;
use crate::metrics::ProgressMetrics;

/// Jitter added to every computed retry delay, in milliseconds.
const RETRY_JITTER_MS: u64 = 100;

/// A system + user message pair for one completion call.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("queue was disposed")]
    Disposed,
}

/// Terminal result of one enqueued task. Failures surface here, never as
/// panics or dropped futures.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: u64,
    pub attempts: u32,
    pub result: Result<String, QueueError>,
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

type SettleCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

struct Task {
    task_id: u64,
    prompt: Prompt,
    attempts: u32,
    reply: oneshot::Sender<TaskOutcome>,
    on_settle: Option<SettleCallback>,
}

struct State {
    pending: VecDeque<Task>,
    active: usize,
    tokens: u32,
}

struct Inner<C> {
    client: Arc<C>,
    config: QueueConfig,
    metrics: ProgressMetrics,
    state: Mutex<State>,
    next_task_id: AtomicU64,
    disposed: AtomicBool,
}

/// The scheduler. One instance per pipeline stage; [`dispose`] it when the
/// stage is done.
///
/// [`dispose`]: RequestQueue::dispose
pub struct RequestQueue<C: Completion> {
    inner: Arc<Inner<C>>,
    refill: JoinHandle<()>,
}

impl<C: Completion> RequestQueue<C> {
    pub fn new(client: Arc<C>, config: QueueConfig, metrics: ProgressMetrics) -> Self {
        let inner = Arc::new(Inner {
            client,
            config,
            metrics,
            state: Mutex::new(State {
                pending: VecDeque::new(),
                active: 0,
                tokens: config.max_calls_per_sec,
            }),
            next_task_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        });

        let refill = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                ticker.tick().await; // first tick is immediate
                loop {
                    ticker.tick().await;
                    inner.lock_state().tokens = inner.config.max_calls_per_sec;
                    inner.drain();
                }
            })
        };

        Self { inner, refill }
    }

    pub fn metrics(&self) -> &ProgressMetrics {
        &self.inner.metrics
    }

    /// Enqueues one prompt and waits for its terminal outcome.
    pub async fn enqueue(&self, prompt: Prompt) -> TaskOutcome {
        self.enqueue_with(prompt, |_| {}).await
    }

    /// Like [`enqueue`](Self::enqueue), with a callback invoked exactly
    /// once when the task settles. A panic in the callback propagates into
    /// the worker task; keep callbacks infallible.
    pub async fn enqueue_with<F>(&self, prompt: Prompt, on_settle: F) -> TaskOutcome
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let (task_id, rx) = self.submit(prompt, Some(Box::new(on_settle)));
        rx.await.unwrap_or_else(|_| TaskOutcome {
            task_id,
            attempts: 0,
            result: Err(QueueError::Disposed),
        })
    }

    /// Enqueues every prompt and waits for all of them. Outcomes come back
    /// in input order regardless of completion order.
    pub async fn enqueue_all(&self, prompts: Vec<Prompt>) -> Vec<TaskOutcome> {
        self.enqueue_all_with(prompts, |_| {}).await
    }

    /// Like [`enqueue_all`](Self::enqueue_all), with a shared settle
    /// callback invoked once per task.
    pub async fn enqueue_all_with<F>(&self, prompts: Vec<Prompt>, on_settle: F) -> Vec<TaskOutcome>
    where
        F: Fn(&TaskOutcome) + Send + Sync + 'static,
    {
        let on_settle = Arc::new(on_settle);
        let receivers: Vec<_> = prompts
            .into_iter()
            .map(|prompt| {
                let cb = Arc::clone(&on_settle);
                self.submit(prompt, Some(Box::new(move |outcome: &TaskOutcome| cb(outcome))))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(receivers.len());
        for (task_id, rx) in receivers {
            outcomes.push(rx.await.unwrap_or_else(|_| TaskOutcome {
                task_id,
                attempts: 0,
                result: Err(QueueError::Disposed),
            }));
        }
        outcomes
    }

    /// Enqueues without handing back a future; the outcome is delivered
    /// only through the settle callback. Used by callers that multiplex
    /// completions over a channel instead of awaiting tasks one by one.
    pub fn enqueue_detached<F>(&self, prompt: Prompt, on_settle: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let _ = self.submit(prompt, Some(Box::new(on_settle)));
    }

    /// Stops the refill timer and finalizes the metrics. Idempotent; tasks
    /// enqueued afterwards settle immediately with
    /// [`QueueError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.refill.abort();
        self.inner.metrics.finalize();
    }

    fn submit(
        &self,
        prompt: Prompt,
        on_settle: Option<SettleCallback>,
    ) -> (u64, oneshot::Receiver<TaskOutcome>) {
        let task_id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if self.inner.disposed.load(Ordering::Acquire) {
            let outcome = TaskOutcome {
                task_id,
                attempts: 0,
                result: Err(QueueError::Disposed),
            };
            if let Some(cb) = on_settle {
                cb(&outcome);
            }
            let _ = tx.send(outcome);
            return (task_id, rx);
        }

        let task = Task {
            task_id,
            prompt,
            attempts: 0,
            reply: tx,
            on_settle,
        };
        self.inner.lock_state().pending.push_back(task);
        self.inner.metrics.add_tasks(1);
        self.inner.drain();
        (task_id, rx)
    }
}

impl<C: Completion> Drop for RequestQueue<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C: Completion> Inner<C> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // Worker tasks never panic while holding the lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts as many pending tasks as the concurrency and token limits
    /// allow.
    fn drain(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.lock_state();
                if state.active >= self.config.max_concurrency || state.tokens == 0 {
                    return;
                }
                let Some(task) = state.pending.pop_front() else {
                    return;
                };
                state.tokens -= 1;
                state.active += 1;
                task
            };
            Self::spawn_execute(Arc::clone(self), task);
        }
    }

    fn spawn_execute(inner: Arc<Self>, mut task: Task) {
        tokio::spawn(async move {
            task.attempts += 1;
            let result = inner
                .client
                .complete(&task.prompt.system, &task.prompt.user)
                .await;

            inner.lock_state().active -= 1;

            match result {
                Ok(response) => inner.settle(task, Ok(response)),
                Err(err) if task.attempts < inner.config.max_retries => {
                    let delay = retry::retry_delay(
                        inner.config.base_retry_delay(),
                        task.attempts,
                        err.retry_hint(),
                    ) + Duration::from_millis(
                        rand::thread_rng().gen_range(0..RETRY_JITTER_MS),
                    );
                    log::warn!(
                        "Task {} attempt {} failed, retrying in {:?}: {}",
                        task.task_id,
                        task.attempts,
                        delay,
                        err
                    );
                    let requeue = Arc::clone(&inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        requeue.lock_state().pending.push_back(task);
                        requeue.drain();
                    });
                }
                Err(err) => {
                    log::error!(
                        "Task {} failed after {} attempts: {}",
                        task.task_id,
                        task.attempts,
                        err
                    );
                    inner.settle(task, Err(QueueError::Completion(err)));
                }
            }

            inner.drain();
        });
    }

    fn settle(&self, task: Task, result: Result<String, QueueError>) {
        let outcome = TaskOutcome {
            task_id: task.task_id,
            attempts: task.attempts,
            result,
        };
        if let Some(cb) = task.on_settle {
            cb(&outcome);
        }
        self.metrics.mark_resolved(outcome.is_ok());
        let _ = task.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering::SeqCst};
    use tokio::time::Instant;

    struct MockClient {
        fail_first: u32,
        delay: Duration,
        calls: AtomicU32,
        concurrent: AtomicI64,
        peak: AtomicI64,
        starts: Mutex<Vec<Instant>>,
    }

    impl MockClient {
        fn new(fail_first: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                delay,
                calls: AtomicU32::new(0),
                concurrent: AtomicI64::new(0),
                peak: AtomicI64::new(0),
                starts: Mutex::new(Vec::new()),
            })
        }
    }

    impl Completion for MockClient {
        fn complete(
            &self,
            _system: &str,
            user: &str,
        ) -> impl std::future::Future<Output = Result<String, CompletionError>> + Send {
            let user = user.to_string();
            async move {
                let call = self.calls.fetch_add(1, SeqCst) + 1;
                let now = self.concurrent.fetch_add(1, SeqCst) + 1;
                self.peak.fetch_max(now, SeqCst);
                self.starts.lock().unwrap().push(Instant::now());
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.concurrent.fetch_sub(1, SeqCst);
                if call <= self.fail_first {
                    Err(CompletionError::Network("scripted failure".into()))
                } else {
                    Ok(format!("echo: {}", user))
                }
            }
        }
    }

    /// Responses slow down for earlier inputs so completion order inverts
    /// submission order.
    struct StaggeredClient;

    impl Completion for StaggeredClient {
        fn complete(
            &self,
            _system: &str,
            user: &str,
        ) -> impl std::future::Future<Output = Result<String, CompletionError>> + Send {
            let user = user.to_string();
            async move {
                let index: u64 = user.trim_start_matches('p').parse().unwrap();
                tokio::time::sleep(Duration::from_millis((10 - index) * 10)).await;
                Ok(format!("echo: {}", user))
            }
        }
    }

    fn config(concurrency: usize, per_sec: u32, retries: u32) -> QueueConfig {
        QueueConfig {
            max_concurrency: concurrency,
            max_calls_per_sec: per_sec,
            max_retries: retries,
            base_retry_delay_ms: 10,
        }
    }

    fn prompts(n: usize) -> Vec<Prompt> {
        (0..n).map(|i| Prompt::new("sys", format!("p{}", i))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_ceiling() {
        let client = MockClient::new(0, Duration::from_millis(100));
        let queue = RequestQueue::new(Arc::clone(&client), config(2, 100, 3), ProgressMetrics::new());

        let outcomes = queue.enqueue_all(prompts(6)).await;
        assert!(outcomes.iter().all(TaskOutcome::is_ok));
        assert!(client.peak.load(SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_per_second_window() {
        let client = MockClient::new(0, Duration::ZERO);
        let queue = RequestQueue::new(Arc::clone(&client), config(100, 3, 3), ProgressMetrics::new());

        let begin = Instant::now();
        let outcomes = queue.enqueue_all(prompts(7)).await;
        assert!(outcomes.iter().all(TaskOutcome::is_ok));

        let starts = client.starts.lock().unwrap();
        let mut per_window = [0usize; 3];
        for start in starts.iter() {
            let secs = (start.duration_since(begin)).as_secs() as usize;
            per_window[secs.min(2)] += 1;
        }
        assert_eq!(per_window, [3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_settle_with_error() {
        let client = MockClient::new(u32::MAX, Duration::ZERO);
        let metrics = ProgressMetrics::new();
        let queue = RequestQueue::new(Arc::clone(&client), config(10, 10, 3), metrics.clone());

        let outcome = queue.enqueue(Prompt::new("sys", "p0")).await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(metrics.errors(), 1);
        assert_eq!(metrics.completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let client = MockClient::new(2, Duration::ZERO);
        let queue = RequestQueue::new(Arc::clone(&client), config(10, 10, 3), ProgressMetrics::new());

        let outcome = queue.enqueue(Prompt::new("sys", "p0")).await;
        assert_eq!(outcome.result.as_deref().unwrap(), "echo: p0");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_at_least_the_backoff() {
        let client = MockClient::new(1, Duration::ZERO);
        let queue = RequestQueue::new(Arc::clone(&client), config(10, 10, 3), ProgressMetrics::new());

        let begin = Instant::now();
        let outcome = queue.enqueue(Prompt::new("sys", "p0")).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.attempts, 2);
        // Base delay 10 ms plus jitter in [0, 100) ms.
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_preserve_input_order() {
        let queue = RequestQueue::new(
            Arc::new(StaggeredClient),
            config(10, 100, 3),
            ProgressMetrics::new(),
        );

        let outcomes = queue.enqueue_all(prompts(6)).await;
        let responses: Vec<_> = outcomes
            .iter()
            .map(|o| o.result.as_deref().unwrap().to_string())
            .collect();
        assert_eq!(
            responses,
            vec!["echo: p0", "echo: p1", "echo: p2", "echo: p3", "echo: p4", "echo: p5"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settle_callback_fires_once_per_task() {
        let client = MockClient::new(1, Duration::ZERO);
        let queue = RequestQueue::new(Arc::clone(&client), config(10, 10, 3), ProgressMetrics::new());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let outcome = queue
            .enqueue_with(Prompt::new("sys", "p0"), move |_| {
                counter.fetch_add(1, SeqCst);
            })
            .await;

        assert!(outcome.is_ok());
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_blocks_new_work() {
        let client = MockClient::new(0, Duration::ZERO);
        let metrics = ProgressMetrics::new();
        let queue = RequestQueue::new(Arc::clone(&client), config(10, 10, 3), metrics.clone());

        let outcome = queue.enqueue(Prompt::new("sys", "p0")).await;
        assert!(outcome.is_ok());

        queue.dispose();
        queue.dispose();
        assert!(metrics.is_finalized());

        let rejected = queue.enqueue(Prompt::new("sys", "p1")).await;
        assert!(matches!(rejected.result, Err(QueueError::Disposed)));
        assert_eq!(client.calls.load(SeqCst), 1);
    }
}
