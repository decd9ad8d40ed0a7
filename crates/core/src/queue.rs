//! Single-flight FIFO dispatcher for calls against the upstream submission
//! endpoint.
//!
//! One worker task owns the dispatch loop. Callers hand it a job through an
//! unbounded channel and wait for the job's output on a oneshot. Before every
//! dispatch the worker enforces a per-window call cap and a minimum spacing
//! between consecutive calls, suspending itself on the tokio timer.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PER_WINDOW: u32 = 10;
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub min_interval: Duration,
    pub max_per_window: u32,
    pub window: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            max_per_window: DEFAULT_MAX_PER_WINDOW,
            window: RATE_WINDOW,
        }
    }
}

impl QueueLimits {
    fn normalized(self) -> Self {
        Self {
            max_per_window: self.max_per_window.max(1),
            window: if self.window.is_zero() {
                RATE_WINDOW
            } else {
                self.window
            },
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    /// Head job is parked on the rate window or the spacing timer.
    Throttled,
    Dispatching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Dispatch worker is gone; the job was never run.
    Closed,
    /// Job was taken by the worker but produced no output (it panicked or
    /// the worker shut down mid-flight).
    Dropped,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("request queue is shut down"),
            Self::Dropped => f.write_str("queued request was dropped before completing"),
        }
    }
}

impl std::error::Error for QueueError {}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Job {
    sequence: u64,
    run: Box<dyn FnOnce() -> JobFuture + Send>,
}

#[derive(Debug)]
struct RateWindow {
    request_count: u32,
    window_start: Instant,
    last_request: Option<Instant>,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_request: None,
        }
    }

    /// How long the head job must still wait; `None` means dispatch now.
    fn admission_delay(&mut self, now: Instant, limits: &QueueLimits) -> Option<Duration> {
        if now.duration_since(self.window_start) >= limits.window {
            self.request_count = 0;
            self.window_start = now;
        }

        if self.request_count >= limits.max_per_window {
            return Some((self.window_start + limits.window).saturating_duration_since(now));
        }

        let last = self.last_request?;
        let since_last = now.duration_since(last);
        if since_last < limits.min_interval {
            return Some(limits.min_interval - since_last);
        }
        None
    }

    fn record_dispatch(&mut self, now: Instant) {
        self.last_request = Some(now);
        self.request_count += 1;
    }

    fn count_at(&self, now: Instant, limits: &QueueLimits) -> u32 {
        if now.duration_since(self.window_start) >= limits.window {
            0
        } else {
            self.request_count
        }
    }
}

struct QueueShared {
    limits: QueueLimits,
    pending: AtomicUsize,
    window: Mutex<RateWindow>,
    state: Mutex<DispatchState>,
}

impl QueueShared {
    fn window(&self) -> MutexGuard<'_, RateWindow> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: DispatchState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn state(&self) -> DispatchState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct RateLimitedQueue {
    shared: Arc<QueueShared>,
    sender: mpsc::UnboundedSender<Job>,
    next_sequence: AtomicU64,
    shutdown: CancellationToken,
}

impl RateLimitedQueue {
    /// Spawns the dispatch worker; must be called inside a tokio runtime.
    pub fn new(limits: QueueLimits) -> Self {
        let limits = limits.normalized();
        let shared = Arc::new(QueueShared {
            limits,
            pending: AtomicUsize::new(0),
            window: Mutex::new(RateWindow::new(Instant::now())),
            state: Mutex::new(DispatchState::Idle),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            receiver,
            shutdown.clone(),
        ));

        info!(
            min_interval_ms = limits.min_interval.as_millis() as u64,
            max_per_window = limits.max_per_window,
            window_secs = limits.window.as_secs(),
            "Request queue started"
        );

        Self {
            shared,
            sender,
            next_sequence: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Queue `action` behind every earlier job and wait for its output.
    pub async fn enqueue<T, F, Fut>(&self, action: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            sequence,
            run: Box::new(move || -> JobFuture {
                Box::pin(async move {
                    let output = action().await;
                    // Receiver is gone when the caller stopped waiting.
                    let _ = result_tx.send(output);
                })
            }),
        };

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        debug!(sequence, queue_length = self.queue_length(), "Job enqueued");

        result_rx.await.map_err(|_| QueueError::Dropped)
    }

    /// Jobs waiting for dispatch; the in-flight job is not counted.
    pub fn queue_length(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn requests_this_window(&self) -> u32 {
        self.shared
            .window()
            .count_at(Instant::now(), &self.shared.limits)
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.shared.state()
    }

    pub fn limits(&self) -> QueueLimits {
        self.shared.limits
    }
}

impl Drop for RateLimitedQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch_loop(
    shared: Arc<QueueShared>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let admitted = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = wait_for_slot(&shared) => true,
        };
        if !admitted {
            shared.pending.fetch_sub(1, Ordering::SeqCst);
            break;
        }

        let requests_this_window = {
            let mut window = shared.window();
            window.record_dispatch(Instant::now());
            window.request_count
        };
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        shared.set_state(DispatchState::Dispatching);
        debug!(
            sequence = job.sequence,
            requests_this_window,
            max_per_window = shared.limits.max_per_window,
            queue_length = shared.pending.load(Ordering::SeqCst),
            "Dispatching queued job"
        );

        // Spawned so a panicking job cannot take the worker down with it.
        if let Err(err) = tokio::spawn((job.run)()).await {
            warn!(sequence = job.sequence, error = %err, "Queued job aborted");
        }
        shared.set_state(DispatchState::Idle);
    }

    let abandoned = shared.pending.swap(0, Ordering::SeqCst);
    shared.set_state(DispatchState::Idle);
    debug!(abandoned, "Request queue worker stopped");
}

async fn wait_for_slot(shared: &QueueShared) {
    loop {
        let delay = shared
            .window()
            .admission_delay(Instant::now(), &shared.limits);
        let Some(delay) = delay else {
            return;
        };
        shared.set_state(DispatchState::Throttled);
        debug!(
            wait_ms = delay.as_millis() as u64,
            max_per_window = shared.limits.max_per_window,
            "Holding queue head until the rate limiter admits it"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn fast_limits() -> QueueLimits {
        QueueLimits {
            min_interval: Duration::from_secs(2),
            max_per_window: 10,
            window: RATE_WINDOW,
        }
    }

    #[test]
    fn rate_window_resets_after_window_elapses() {
        let start = Instant::now();
        let limits = fast_limits();
        let mut window = RateWindow::new(start);
        window.request_count = limits.max_per_window;
        window.last_request = Some(start);

        let later = start + Duration::from_secs(61);
        assert_eq!(window.admission_delay(later, &limits), None);
        assert_eq!(window.request_count, 0);
        assert_eq!(window.window_start, later);
    }

    #[test]
    fn rate_window_reports_remaining_window_when_full() {
        let start = Instant::now();
        let limits = fast_limits();
        let mut window = RateWindow::new(start);
        window.request_count = limits.max_per_window;

        let now = start + Duration::from_secs(45);
        assert_eq!(
            window.admission_delay(now, &limits),
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn rate_window_enforces_min_interval() {
        let start = Instant::now();
        let limits = fast_limits();
        let mut window = RateWindow::new(start);
        window.record_dispatch(start);

        let now = start + Duration::from_millis(500);
        assert_eq!(
            window.admission_delay(now, &limits),
            Some(Duration::from_millis(1500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_returns_action_output() {
        let queue = RateLimitedQueue::new(fast_limits());
        let value = queue.enqueue(|| async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(queue.requests_this_window(), 1);
        assert_eq!(queue.queue_length(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_delivered_to_the_caller() {
        let queue = RateLimitedQueue::new(fast_limits());
        let outcome: Result<Result<(), String>, QueueError> = queue
            .enqueue(|| async { Err("upstream said no".to_string()) })
            .await;
        assert_eq!(outcome.unwrap().unwrap_err(), "upstream said no");
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_dispatch_in_fifo_order_with_min_spacing() {
        let queue = Arc::new(RateLimitedQueue::new(fast_limits()));
        let dispatches = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..5 {
            let queue = Arc::clone(&queue);
            let dispatches = Arc::clone(&dispatches);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move || async move {
                        dispatches.lock().unwrap().push((index, Instant::now()));
                    })
                    .await
                    .unwrap();
            }));
            // Let each caller reach the channel before the next one.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let dispatches = dispatches.lock().unwrap();
        let order: Vec<_> = dispatches.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in dispatches.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_window_cap_is_never_exceeded() {
        let limits = QueueLimits {
            min_interval: Duration::from_millis(100),
            max_per_window: 3,
            window: RATE_WINDOW,
        };
        let queue = Arc::new(RateLimitedQueue::new(limits));
        let started = Instant::now();
        let dispatches = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..7 {
            let queue = Arc::clone(&queue);
            let dispatches = Arc::clone(&dispatches);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move || async move {
                        dispatches.lock().unwrap().push(Instant::now());
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let dispatches = dispatches.lock().unwrap();
        assert_eq!(dispatches.len(), 7);
        let mut per_window = std::collections::BTreeMap::new();
        for at in dispatches.iter() {
            let window_index = at.duration_since(started).as_secs() / 60;
            *per_window.entry(window_index).or_insert(0) += 1;
        }
        assert!(per_window.values().all(|count| *count <= 3));
        assert_eq!(per_window.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_length_excludes_in_flight_job() {
        let queue = Arc::new(RateLimitedQueue::new(QueueLimits {
            min_interval: Duration::ZERO,
            ..fast_limits()
        }));
        let gate = Arc::new(tokio::sync::Notify::new());

        let blocked = {
            let queue = Arc::clone(&queue);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                queue
                    .enqueue(move || async move { gate.notified().await })
                    .await
            })
        };
        while queue.dispatch_state() != DispatchState::Dispatching {
            tokio::task::yield_now().await;
        }

        let waiting = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(|| async {}).await })
        };
        while queue.queue_length() != 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.queue_length(), 1);

        gate.notify_one();
        blocked.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
        assert_eq!(queue.queue_length(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_does_not_stop_the_worker() {
        let queue = RateLimitedQueue::new(fast_limits());
        let first: Result<(), QueueError> = queue
            .enqueue(|| async { panic!("job blew up") })
            .await;
        assert_eq!(first.unwrap_err(), QueueError::Dropped);

        let second = queue.enqueue(|| async { "still running" }).await;
        assert_eq!(second.unwrap(), "still running");
    }
}
