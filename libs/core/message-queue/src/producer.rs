//! Batched, retry-aware publishing to a single queue.
//!
//! Sends below priority 8 with no delay are buffered and flushed in one
//! pipelined append; each buffered send resolves through its own slot
//! channel when the flush lands. Direct sends that hit transient errors
//! enter a retry queue drained by a background tick with exponential
//! backoff.

use crate::config::ProducerConfig;
use crate::error::QueueError;
use crate::message::{Message, MessageOptions, SendResult};
use crate::queue::Queue;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Priority at and above which a send bypasses batching.
const BATCH_BYPASS_PRIORITY: u8 = 8;
/// Retry items drained per tick.
const RETRY_DRAIN_LIMIT: usize = 10;
/// Cap on the retry backoff.
const RETRY_BACKOFF_CAP_MS: u64 = 30_000;

/// Producer-side counters; `get_metrics` returns a copy.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerMetrics {
    /// Cumulative successful sends.
    pub messages_sent: u64,
    /// Running `(prev + sample) / 2` of send latency in ms.
    pub average_latency_ms: f64,
    pub batches_sent: u64,
    /// Running `(prev + sample) / 2` of flushed batch sizes.
    pub average_batch_size: f64,
    /// Decays by 0.95 per sample, +0.05 on failure.
    pub error_rate: f64,
    pub last_sent_at: Option<i64>,
}

struct PendingSend {
    message: Message,
    tx: oneshot::Sender<Result<SendResult, QueueError>>,
}

struct BatchBuffer {
    slots: Vec<PendingSend>,
    opened_at: Option<Instant>,
}

struct RetryItem {
    message: Message,
    attempt: u32,
    next_at: Instant,
    tx: oneshot::Sender<Result<SendResult, QueueError>>,
}

struct ProducerState {
    started: AtomicBool,
    batch: AsyncMutex<BatchBuffer>,
    retries: AsyncMutex<VecDeque<RetryItem>>,
    metrics: Mutex<ProducerMetrics>,
    tasks: Mutex<Vec<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// Validated, batched, retry-aware publisher bound to one queue.
pub struct Producer {
    queue: Arc<Queue>,
    config: ProducerConfig,
    state: Arc<ProducerState>,
}

impl Producer {
    pub fn new(queue: Arc<Queue>, config: Option<ProducerConfig>) -> Self {
        Self {
            queue,
            config: config.unwrap_or_default(),
            state: Arc::new(ProducerState {
                started: AtomicBool::new(false),
                batch: AsyncMutex::new(BatchBuffer {
                    slots: Vec::new(),
                    opened_at: None,
                }),
                retries: AsyncMutex::new(VecDeque::new()),
                metrics: Mutex::new(ProducerMetrics::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Idempotent: arms the flush timer and the retry tick.
    pub async fn start(&self) {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_flush_timer();
        self.spawn_retry_tick();
        info!(queue = %self.queue.name(), "producer started");
    }

    /// Flush the buffer, reject pending retries, and cancel both timers.
    ///
    /// Callers holding unresolved send completions observe either a success
    /// from the final flush or a terminal error.
    pub async fn stop(&self) {
        if !self.state.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<_> = self.state.tasks.lock().unwrap().drain(..).collect();
        for (tx, handle) in tasks {
            let _ = tx.send(true);
            let _ = handle.await;
        }

        flush_batch(&self.queue, &self.state.batch, &self.state.metrics).await;

        let mut retries = self.state.retries.lock().await;
        let rejected = retries.len();
        for item in retries.drain(..) {
            let _ = item
                .tx
                .send(Err(QueueError::ShuttingDown("producer stopped".to_string())));
        }
        if rejected > 0 {
            warn!(
                queue = %self.queue.name(),
                rejected,
                "rejected pending retries on stop"
            );
        }
        info!(queue = %self.queue.name(), "producer stopped");
    }

    /// Send one message, batching when safe.
    ///
    /// A message is buffered only when the producer is started, batching is
    /// enabled, the effective priority is below 8, and there is no delay.
    /// Everything else goes out directly, with transient errors feeding the
    /// retry queue.
    pub async fn send(
        &self,
        message: Message,
        options: Option<&MessageOptions>,
    ) -> Result<SendResult, QueueError> {
        let message = match options {
            Some(options) => options.apply(message),
            None => message,
        };
        message.validate()?;

        let batchable = self.is_started()
            && self.config.batch_size > 1
            && message.priority < BATCH_BYPASS_PRIORITY
            && message.delay_ms.unwrap_or(0) == 0;

        if !batchable {
            return self.send_direct_with_retry(message).await;
        }

        let (tx, rx) = oneshot::channel();
        let flush_now = {
            let mut batch = self.state.batch.lock().await;
            if batch.slots.is_empty() {
                batch.opened_at = Some(Instant::now());
            }
            batch.slots.push(PendingSend { message, tx });
            batch.slots.len() >= self.config.batch_size
        };

        if flush_now {
            flush_batch(&self.queue, &self.state.batch, &self.state.metrics).await;
        }

        rx.await
            .map_err(|_| QueueError::ShuttingDown("producer stopped before flush".to_string()))?
    }

    /// Send a whole batch through the queue's pipelined append.
    pub async fn send_batch(
        &self,
        messages: Vec<Message>,
        options: Option<&MessageOptions>,
    ) -> Result<Vec<SendResult>, QueueError> {
        let count = messages.len();
        let started = Instant::now();
        let results = self.queue.send_batch(messages, options).await?;

        let successes = results.iter().filter(|r| r.success).count();
        {
            let mut metrics = self.state.metrics.lock().unwrap();
            metrics.batches_sent += 1;
            metrics.average_batch_size = (metrics.average_batch_size + count as f64) / 2.0;
            metrics.messages_sent += successes as u64;
            metrics.average_latency_ms =
                (metrics.average_latency_ms + started.elapsed().as_millis() as f64) / 2.0;
            for result in &results {
                metrics.error_rate =
                    metrics.error_rate * 0.95 + if result.success { 0.0 } else { 0.05 };
            }
            metrics.last_sent_at = Some(Utc::now().timestamp_millis());
        }
        Ok(results)
    }

    /// Stage a message for delivery after `delay_ms`.
    pub async fn send_delayed(
        &self,
        message: Message,
        delay_ms: u64,
    ) -> Result<SendResult, QueueError> {
        let options = MessageOptions {
            delay_ms: Some(delay_ms),
            ..Default::default()
        };
        self.send(message, Some(&options)).await
    }

    /// Send with an explicit priority; 8 and 9 bypass batching.
    pub async fn send_priority(
        &self,
        message: Message,
        priority: u8,
    ) -> Result<SendResult, QueueError> {
        let options = MessageOptions {
            priority: Some(priority),
            ..Default::default()
        };
        self.send(message, Some(&options)).await
    }

    pub fn get_metrics(&self) -> ProducerMetrics {
        self.state.metrics.lock().unwrap().clone()
    }

    pub fn reset_metrics(&self) {
        *self.state.metrics.lock().unwrap() = ProducerMetrics::default();
    }

    async fn send_direct_with_retry(&self, message: Message) -> Result<SendResult, QueueError> {
        match direct_send(&self.queue, &self.state.metrics, message.clone()).await {
            Ok(result) => Ok(result),
            Err(e @ QueueError::Validation(_)) => Err(e),
            Err(e) if self.config.max_retries > 0 && self.is_started() => {
                debug!(
                    queue = %self.queue.name(),
                    message_id = %message.id,
                    error = %e,
                    "send failed, queueing for retry"
                );
                let (tx, rx) = oneshot::channel();
                self.state.retries.lock().await.push_back(RetryItem {
                    message,
                    attempt: 1,
                    next_at: Instant::now() + retry_backoff(1),
                    tx,
                });
                rx.await.map_err(|_| {
                    QueueError::ShuttingDown("producer stopped during retry".to_string())
                })?
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_flush_timer(&self) {
        let (tx, mut rx) = watch::channel(false);
        let queue = Arc::clone(&self.queue);
        let state = Arc::clone(&self.state);
        let timeout = Duration::from_millis(self.config.batch_timeout_ms.max(1));
        let tick = Duration::from_millis((self.config.batch_timeout_ms / 4).clamp(10, 250));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let expired = {
                            let batch = state.batch.lock().await;
                            !batch.slots.is_empty()
                                && batch
                                    .opened_at
                                    .map(|at| at.elapsed() >= timeout)
                                    .unwrap_or(false)
                        };
                        if expired {
                            flush_batch(&queue, &state.batch, &state.metrics).await;
                        }
                    }
                }
            }
        });

        self.state.tasks.lock().unwrap().push((tx, handle));
    }

    fn spawn_retry_tick(&self) {
        let (tx, mut rx) = watch::channel(false);
        let queue = Arc::clone(&self.queue);
        let state = Arc::clone(&self.state);
        let max_retries = self.config.max_retries;
        let tick = Duration::from_millis(self.config.retry_delay_ms.max(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        drain_retries(&queue, &state, max_retries).await;
                    }
                }
            }
        });

        self.state.tasks.lock().unwrap().push((tx, handle));
    }
}

/// Backoff before retry `attempt`: `min(1000 * 2^(attempt-1), 30s)`.
fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    Duration::from_millis((1000u64 << exponent).min(RETRY_BACKOFF_CAP_MS))
}

/// One append with metrics bookkeeping.
async fn direct_send(
    queue: &Queue,
    metrics: &Mutex<ProducerMetrics>,
    message: Message,
) -> Result<SendResult, QueueError> {
    let started = Instant::now();
    let outcome = queue.send(message, None).await;
    let latency_ms = started.elapsed().as_millis() as f64;

    let mut metrics = metrics.lock().unwrap();
    metrics.average_latency_ms = (metrics.average_latency_ms + latency_ms) / 2.0;
    metrics.error_rate = metrics.error_rate * 0.95
        + if outcome.is_ok() { 0.0 } else { 0.05 };
    if outcome.is_ok() {
        metrics.messages_sent += 1;
        metrics.last_sent_at = Some(Utc::now().timestamp_millis());
    }
    outcome
}

/// Hand the buffered slots to the queue in order and resolve each slot.
async fn flush_batch(
    queue: &Queue,
    batch: &AsyncMutex<BatchBuffer>,
    metrics: &Mutex<ProducerMetrics>,
) {
    let slots = {
        let mut batch = batch.lock().await;
        if batch.slots.is_empty() {
            return;
        }
        batch.opened_at = None;
        std::mem::take(&mut batch.slots)
    };

    let messages: Vec<Message> = slots.iter().map(|s| s.message.clone()).collect();
    let count = messages.len();
    let started = Instant::now();

    match queue.send_batch(messages, None).await {
        Ok(results) => {
            let successes = results.iter().filter(|r| r.success).count();
            {
                let mut metrics = metrics.lock().unwrap();
                metrics.batches_sent += 1;
                metrics.average_batch_size = (metrics.average_batch_size + count as f64) / 2.0;
                metrics.messages_sent += successes as u64;
                metrics.average_latency_ms = (metrics.average_latency_ms
                    + started.elapsed().as_millis() as f64)
                    / 2.0;
                for result in &results {
                    metrics.error_rate =
                        metrics.error_rate * 0.95 + if result.success { 0.0 } else { 0.05 };
                }
                metrics.last_sent_at = Some(Utc::now().timestamp_millis());
            }
            for (slot, result) in slots.into_iter().zip(results) {
                let outcome = if result.success {
                    Ok(result)
                } else {
                    Err(QueueError::SendFailed {
                        queue: queue.name().to_string(),
                        reason: result
                            .error
                            .unwrap_or_else(|| "batch slot failed".to_string()),
                    })
                };
                let _ = slot.tx.send(outcome);
            }
        }
        Err(e) => {
            warn!(queue = %queue.name(), error = %e, "batch flush failed");
            let reason = e.to_string();
            {
                let mut metrics = metrics.lock().unwrap();
                metrics.error_rate = metrics.error_rate * 0.95 + 0.05;
            }
            for slot in slots {
                let _ = slot.tx.send(Err(QueueError::SendFailed {
                    queue: queue.name().to_string(),
                    reason: reason.clone(),
                }));
            }
        }
    }
}

/// Drain up to ten due retry items, re-attempting each.
async fn drain_retries(queue: &Arc<Queue>, state: &Arc<ProducerState>, max_retries: u32) {
    let due = {
        let mut retries = state.retries.lock().await;
        let now = Instant::now();
        let mut due = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(item) = retries.pop_front() {
            if due.len() < RETRY_DRAIN_LIMIT && item.next_at <= now {
                due.push(item);
            } else {
                remaining.push_back(item);
            }
        }
        *retries = remaining;
        due
    };

    for item in due {
        if item.attempt >= max_retries {
            let _ = item.tx.send(Err(QueueError::MaxRetriesExceeded {
                attempts: item.attempt,
                reason: format!("send to '{}' kept failing", queue.name()),
            }));
            continue;
        }

        match direct_send(queue, &state.metrics, item.message.clone()).await {
            Ok(result) => {
                debug!(
                    queue = %queue.name(),
                    message_id = %item.message.id,
                    attempt = item.attempt,
                    "retried send succeeded"
                );
                let _ = item.tx.send(Ok(result));
            }
            Err(e @ QueueError::Validation(_)) => {
                let _ = item.tx.send(Err(e));
            }
            Err(e) => {
                let next_attempt = item.attempt + 1;
                debug!(
                    queue = %queue.name(),
                    message_id = %item.message.id,
                    attempt = item.attempt,
                    error = %e,
                    "retried send failed, rescheduling"
                );
                state.retries.lock().await.push_back(RetryItem {
                    message: item.message,
                    attempt: next_attempt,
                    next_at: Instant::now() + retry_backoff(next_attempt),
                    tx: item.tx,
                });
            }
        }
    }
}
