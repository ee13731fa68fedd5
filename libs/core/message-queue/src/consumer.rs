//! Consumer-group reader with handler dispatch, retries, and DLQ routing.
//!
//! A consumer reads its queue through a Redis consumer group, hands every
//! decoded message to the registered handler, and acknowledges, retries,
//! or dead-letters based on the outcome. Handlers come in two explicit
//! flavors: one message at a time or the whole fetched batch.
//!
//! Each consume pass first drains entries that were delivered to this
//! consumer but never acknowledged (`XREADGROUP ... 0`), then blocks for
//! new entries. BLOCK timeouts are normal, not errors.

use crate::config::{ConsumerConfig, ParseFailurePolicy, RetryPolicySpec};
use crate::connection::RedisConnection;
use crate::dlq::DeadLetterManager;
use crate::error::QueueError;
use crate::events::{ConsumerEvent, EventBus};
use crate::message::{MAX_PRIORITY, Message};
use crate::metrics::{self, MessageStatus};
use crate::queue::{Queue, main_stream_key, priority_stream_key};
use crate::retry::{RetryConfig, RetryPolicy, policy_from_name};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One fetched stream entry before decoding.
type RawEntry = (String, String, HashMap<String, redis::Value>);
/// One decoded entry: source stream, entry id, message.
type ParsedEntry = (String, String, Message);

/// Handle given to handlers for explicit ack/nack.
pub struct MessageContext {
    conn: RedisConnection,
    stream: String,
    group: String,
    entry_id: String,
    message_id: String,
    acked: Arc<AtomicBool>,
    events: EventBus<ConsumerEvent>,
}

impl Clone for MessageContext {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            entry_id: self.entry_id.clone(),
            message_id: self.message_id.clone(),
            acked: Arc::clone(&self.acked),
            events: self.events.clone(),
        }
    }
}

impl MessageContext {
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Acknowledge the entry, removing it from the group PEL. Idempotent.
    pub async fn ack(&self) -> Result<(), QueueError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.conn
            .xack(&self.stream, &self.group, &self.entry_id)
            .await?;
        self.events.emit(ConsumerEvent::MessageAcked {
            message_id: self.message_id.clone(),
        });
        Ok(())
    }

    /// Negative acknowledgement.
    ///
    /// `requeue = true` only marks and warns; re-delivery happens through
    /// the handler-error retry path, not here. `requeue = false` removes
    /// the entry from the PEL.
    pub async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            warn!(
                message_id = %self.message_id,
                "nack(requeue) is a no-op; failed handlers re-enqueue through the retry path"
            );
        } else if !self.acked.swap(true, Ordering::SeqCst) {
            self.conn
                .xack(&self.stream, &self.group, &self.entry_id)
                .await?;
        }
        self.events.emit(ConsumerEvent::MessageNacked {
            message_id: self.message_id.clone(),
            requeue,
        });
        Ok(())
    }
}

/// Handler for one message at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<(), QueueError>;
}

/// Handler invoked once per fetched batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(
        &self,
        batch: Vec<(Message, MessageContext)>,
    ) -> Result<(), QueueError>;
}

struct SingleFn<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for SingleFn<F>
where
    F: Fn(Message, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn handle(&self, message: Message, ctx: MessageContext) -> Result<(), QueueError> {
        (self.0)(message, ctx).await
    }
}

struct BatchFn<F>(F);

#[async_trait]
impl<F, Fut> BatchHandler for BatchFn<F>
where
    F: Fn(Vec<(Message, MessageContext)>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send,
{
    async fn handle_batch(
        &self,
        batch: Vec<(Message, MessageContext)>,
    ) -> Result<(), QueueError> {
        (self.0)(batch).await
    }
}

/// The handler registered with a consumer, tagged by dispatch style.
pub enum QueueHandler {
    Single(Arc<dyn MessageHandler>),
    Batch(Arc<dyn BatchHandler>),
}

impl QueueHandler {
    pub fn single<H: MessageHandler + 'static>(handler: H) -> Self {
        Self::Single(Arc::new(handler))
    }

    pub fn batch<H: BatchHandler + 'static>(handler: H) -> Self {
        Self::Batch(Arc::new(handler))
    }

    /// Wrap a plain async closure as a single-message handler.
    pub fn single_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Message, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        Self::Single(Arc::new(SingleFn(f)))
    }

    /// Wrap a plain async closure as a batch handler.
    pub fn batch_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<(Message, MessageContext)>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        Self::Batch(Arc::new(BatchFn(f)))
    }
}

/// Consumer-side counters; `get_metrics` returns a copy.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerMetrics {
    /// Cumulative successfully processed messages.
    pub messages_processed: u64,
    /// Running `(prev + sample) / 2` of handler latency in ms.
    pub average_processing_time_ms: f64,
    /// Decays by 0.95 per sample, +0.05 on failure.
    pub error_rate: f64,
    pub last_processed_at: Option<i64>,
}

struct ConsumerCore {
    queue: Arc<Queue>,
    conn: RedisConnection,
    handler: QueueHandler,
    options: ConsumerConfig,
    group: String,
    consumer_name: String,
    /// Streams read by this consumer, highest priority tier first.
    streams: Vec<String>,
    retry_policy: Arc<dyn RetryPolicy>,
    dlq: Option<DeadLetterManager>,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    metrics: Mutex<ConsumerMetrics>,
    events: EventBus<ConsumerEvent>,
}

/// Per-consumer-group reader bound to one queue.
pub struct Consumer {
    core: Arc<ConsumerCore>,
    started: AtomicBool,
    supervisor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Consumer {
    /// Build a consumer. Fails on an unknown named retry policy.
    pub fn new(
        queue: Arc<Queue>,
        handler: QueueHandler,
        conn: RedisConnection,
        options: ConsumerConfig,
    ) -> Result<Self, QueueError> {
        let retry_policy = Self::resolve_policy(&options)?;
        Self::with_policy(queue, handler, conn, options, retry_policy)
    }

    /// Build a consumer with an explicit retry policy object.
    pub fn with_policy(
        queue: Arc<Queue>,
        handler: QueueHandler,
        conn: RedisConnection,
        options: ConsumerConfig,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, QueueError> {
        let group = options
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("{}-consumers", queue.name()));
        let consumer_name = options
            .consumer_id
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        let streams = if queue.config().priority {
            (0..=MAX_PRIORITY)
                .rev()
                .map(|p| priority_stream_key(queue.name(), p))
                .collect()
        } else {
            vec![main_stream_key(queue.name())]
        };

        let dlq_name = options
            .dead_letter_queue
            .clone()
            .or_else(|| queue.config().dead_letter_queue.clone());
        let dlq = dlq_name
            .map(|name| DeadLetterManager::new(conn.clone(), name, queue.config().max_length));

        let concurrency = options.concurrency;
        Ok(Self {
            core: Arc::new(ConsumerCore {
                queue,
                conn,
                handler,
                options,
                group,
                consumer_name,
                streams,
                retry_policy,
                dlq,
                semaphore: Arc::new(Semaphore::new(concurrency)),
                in_flight: AtomicUsize::new(0),
                metrics: Mutex::new(ConsumerMetrics::default()),
                events: EventBus::new(),
            }),
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        })
    }

    fn resolve_policy(options: &ConsumerConfig) -> Result<Arc<dyn RetryPolicy>, QueueError> {
        match &options.retry_policy {
            None => Ok(RetryConfig::default()
                .with_max_attempts(options.max_retries)
                .build()),
            Some(RetryPolicySpec::Named(name)) => policy_from_name(
                name,
                RetryConfig::default().with_max_attempts(options.max_retries),
            )
            .ok_or_else(|| {
                QueueError::Configuration(format!("unknown retry policy '{name}'"))
            }),
            Some(RetryPolicySpec::Config(config)) => Ok(config.clone().build()),
        }
    }

    /// Group and consumer identity, stable for this consumer's lifetime.
    pub fn identity(&self) -> (&str, &str) {
        (&self.core.group, &self.core.consumer_name)
    }

    /// Subscribe to consumer events.
    pub fn events(&self) -> &EventBus<ConsumerEvent> {
        &self.core.events
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Idempotent: ensures the consumer group exists on every read stream
    /// and starts the consume loop.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.ensure_groups().await?;
        self.spawn_supervisor();
        info!(
            queue = %self.core.queue.name(),
            group = %self.core.group,
            consumer = %self.core.consumer_name,
            concurrency = self.core.options.concurrency,
            "consumer started"
        );
        self.core.events.emit(ConsumerEvent::Started);
        Ok(())
    }

    /// Tear down scheduling but keep the consumer started; in-flight
    /// handlers run to completion.
    pub async fn pause(&self) {
        self.cancel_supervisor().await;
        info!(consumer = %self.core.consumer_name, "consumer paused");
        self.core.events.emit(ConsumerEvent::Paused);
    }

    /// Restart scheduling after a pause.
    pub async fn resume(&self) {
        if !self.is_started() {
            return;
        }
        if self.supervisor.lock().unwrap().is_some() {
            return;
        }
        self.spawn_supervisor();
        info!(consumer = %self.core.consumer_name, "consumer resumed");
        self.core.events.emit(ConsumerEvent::Resumed);
    }

    /// Stop scheduling and wait for every in-flight task to settle.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel_supervisor().await;

        // every permit back means every in-flight task is done
        let permits = self.core.options.concurrency as u32;
        let _all = self.core.semaphore.acquire_many(permits).await;

        info!(consumer = %self.core.consumer_name, "consumer stopped");
        self.core.events.emit(ConsumerEvent::Stopped);
    }

    /// Acknowledge an entry on the primary stream by id.
    pub async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
        self.core.ack_entry(&self.core.streams[0], entry_id).await
    }

    /// Negative-acknowledge an entry on the primary stream.
    ///
    /// With `requeue = true` this only marks and warns; the handler-error
    /// retry path is the real re-enqueue mechanism. With `requeue = false`
    /// the entry is acknowledged and dropped.
    pub async fn nack(&self, entry_id: &str, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            warn!(
                entry_id,
                "nack(requeue) is a no-op; failed handlers re-enqueue through the retry path"
            );
        } else {
            self.core.ack_entry(&self.core.streams[0], entry_id).await?;
        }
        self.core.events.emit(ConsumerEvent::MessageNacked {
            message_id: entry_id.to_string(),
            requeue,
        });
        Ok(())
    }

    pub fn get_metrics(&self) -> ConsumerMetrics {
        self.core.metrics.lock().unwrap().clone()
    }

    pub fn reset_metrics(&self) {
        *self.core.metrics.lock().unwrap() = ConsumerMetrics::default();
    }

    fn spawn_supervisor(&self) {
        let (tx, mut rx) = watch::channel(false);
        let core = Arc::clone(&self.core);

        let handle = tokio::spawn(async move {
            loop {
                let semaphore = Arc::clone(&core.semaphore);
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    permit = semaphore.acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let core = Arc::clone(&core);
                        tokio::spawn(async move {
                            let _permit = permit;
                            let current =
                                core.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            metrics::set_in_flight(core.queue.name(), current as f64);

                            if let Err(e) = core.consume_messages().await {
                                core.handle_loop_error(e).await;
                            }

                            let current =
                                core.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                            metrics::set_in_flight(core.queue.name(), current as f64);
                        });
                    }
                }
            }
        });

        *self.supervisor.lock().unwrap() = Some((tx, handle));
    }

    async fn cancel_supervisor(&self) {
        let supervisor = self.supervisor.lock().unwrap().take();
        if let Some((tx, handle)) = supervisor {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }
}

impl ConsumerCore {
    async fn ensure_groups(&self) -> Result<(), QueueError> {
        for stream in &self.streams {
            Queue::ensure_group(&self.conn, stream, &self.group).await?;
        }
        Ok(())
    }

    /// Errors from the consume loop, classified the same way the worker
    /// loop does: recreate missing groups, back off on connection loss,
    /// ignore block timeouts.
    async fn handle_loop_error(&self, e: QueueError) {
        if e.is_block_timeout() {
            debug!("block timeout, no messages");
        } else if e.is_nogroup_error() {
            warn!(group = %self.group, "consumer group missing, recreating");
            if let Err(create_err) = self.ensure_groups().await {
                error!(error = %create_err, "failed to recreate consumer group");
            }
        } else if e.is_connection_error() {
            warn!(error = %e, "connection error in consume loop, backing off");
            tokio::time::sleep(Duration::from_secs(1)).await;
        } else {
            error!(error = %e, "error in consume loop");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// One consume pass: drain own unacked entries, then block for new ones.
    async fn consume_messages(&self) -> Result<(), QueueError> {
        let mut entries = self.read_entries("0", None).await?;
        if entries.is_empty() {
            entries = self
                .read_entries(">", Some(self.options.timeout_ms))
                .await?;
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.process_entries(entries).await;
        Ok(())
    }

    async fn read_entries(
        &self,
        id: &str,
        block_ms: Option<u64>,
    ) -> Result<Vec<RawEntry>, QueueError> {
        let result = self
            .conn
            .xreadgroup(
                &self.group,
                &self.consumer_name,
                &self.streams,
                id,
                self.options.batch_size,
                block_ms,
            )
            .await;

        match result {
            Ok(reply) => {
                let mut entries = Vec::new();
                for stream_key in reply.keys {
                    for entry in stream_key.ids {
                        entries.push((stream_key.key.clone(), entry.id, entry.map));
                    }
                }
                Ok(entries)
            }
            // BLOCK expiry surfaces as nil/timeout-shaped errors; treat as empty
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("timeout")
                    || err_str.contains("timed out")
                    || err_str.contains("nil")
                    || (err_str.contains("response") && err_str.contains("type"))
                {
                    Ok(vec![])
                } else {
                    Err(QueueError::Redis(e))
                }
            }
        }
    }

    fn context(&self, stream: &str, entry_id: &str, message_id: &str) -> MessageContext {
        MessageContext {
            conn: self.conn.clone(),
            stream: stream.to_string(),
            group: self.group.clone(),
            entry_id: entry_id.to_string(),
            message_id: message_id.to_string(),
            acked: Arc::new(AtomicBool::new(false)),
            events: self.events.clone(),
        }
    }

    async fn process_entries(&self, entries: Vec<RawEntry>) {
        let mut parsed: Vec<ParsedEntry> = Vec::with_capacity(entries.len());
        for (stream, entry_id, map) in entries {
            match Message::from_fields(&map) {
                Ok(message) => parsed.push((stream, entry_id, message)),
                Err(e) => self.handle_parse_failure(&stream, &entry_id, &map, &e).await,
            }
        }
        if parsed.is_empty() {
            return;
        }

        match &self.handler {
            QueueHandler::Batch(handler) => {
                self.dispatch_batch(Arc::clone(handler), parsed).await
            }
            QueueHandler::Single(handler) => {
                let handler = Arc::clone(handler);
                for entry in parsed {
                    self.dispatch_single(&handler, entry).await;
                }
            }
        }
    }

    /// Undecodable entries would wedge the PEL; ack them per policy,
    /// optionally preserving the raw entry on the dead-letter stream.
    async fn handle_parse_failure(
        &self,
        stream: &str,
        entry_id: &str,
        map: &HashMap<String, redis::Value>,
        e: &QueueError,
    ) {
        warn!(
            queue = %self.queue.name(),
            entry_id,
            error = %e,
            "failed to decode stream entry"
        );

        if self.options.parse_failure == ParseFailurePolicy::DeadLetter
            && let Some(dlq) = &self.dlq
        {
            let raw = serde_json::to_string(&raw_entry_fields(map)).unwrap_or_default();
            if let Err(dlq_err) = dlq
                .add_raw(entry_id, &raw, "parse_failure", self.queue.name())
                .await
            {
                error!(error = %dlq_err, "failed to dead-letter undecodable entry");
            }
        }

        self.ack_entry(stream, entry_id).await.ok();
        metrics::record_error(self.queue.name(), "deserialization");
        self.events.emit(ConsumerEvent::MessageError {
            message_id: None,
            error: e.to_string(),
        });
    }

    async fn dispatch_single(&self, handler: &Arc<dyn MessageHandler>, entry: ParsedEntry) {
        let (stream, entry_id, message) = entry;
        let ctx = self.context(&stream, &entry_id, &message.id);
        let started = Instant::now();

        debug!(
            queue = %self.queue.name(),
            message_id = %message.id,
            entry_id = %entry_id,
            "dispatching message"
        );

        match handler.handle(message.clone(), ctx.clone()).await {
            Ok(()) => {
                self.retry_policy.record_success();
                if self.options.auto_ack && !ctx.is_acked() {
                    if let Err(e) = ctx.ack().await {
                        error!(entry_id = %entry_id, error = %e, "failed to ack message");
                    }
                }
                self.record_success(started, 1);
            }
            Err(e) => {
                self.retry_policy.record_failure();
                self.record_failure(&message.id, &e);
                self.handle_failure(&stream, &entry_id, &message, &e).await;
            }
        }
    }

    async fn dispatch_batch(&self, handler: Arc<dyn BatchHandler>, entries: Vec<ParsedEntry>) {
        let batch: Vec<(Message, MessageContext)> = entries
            .iter()
            .map(|(stream, entry_id, message)| {
                (
                    message.clone(),
                    self.context(stream, entry_id, &message.id),
                )
            })
            .collect();
        let contexts: Vec<MessageContext> = batch.iter().map(|(_, ctx)| ctx.clone()).collect();
        let count = entries.len();
        let started = Instant::now();

        match handler.handle_batch(batch).await {
            Ok(()) => {
                self.retry_policy.record_success();
                if self.options.auto_ack {
                    for ctx in &contexts {
                        if !ctx.is_acked()
                            && let Err(e) = ctx.ack().await
                        {
                            error!(entry_id = %ctx.entry_id(), error = %e, "failed to ack message");
                        }
                    }
                }
                self.record_success(started, count);
            }
            Err(e) => {
                self.retry_policy.record_failure();
                warn!(
                    queue = %self.queue.name(),
                    count,
                    error = %e,
                    "batch handler failed, handling per message"
                );
                for (stream, entry_id, message) in &entries {
                    self.record_failure(&message.id, &e);
                    self.handle_failure(stream, entry_id, message, &e).await;
                }
            }
        }
    }

    /// Retry-or-dead-letter decision for one failed message.
    ///
    /// The message's own retry budget is consulted first, then the policy.
    /// A successful retry publishes the successor message and acks the
    /// original; exhaustion routes to the DLQ.
    async fn handle_failure(
        &self,
        stream: &str,
        entry_id: &str,
        message: &Message,
        err: &QueueError,
    ) {
        let attempt = message.retry_count + 1;

        if message.retry_count >= message.max_retries {
            self.dead_letter(stream, entry_id, message, err).await;
            return;
        }
        if !self.retry_policy.should_retry(attempt, Some(err)) {
            self.dead_letter(stream, entry_id, message, err).await;
            return;
        }

        let Some(delay) = self.retry_policy.calculate_delay(attempt, Some(err)) else {
            // policy refused mid-stream
            self.dead_letter(stream, entry_id, message, err).await;
            return;
        };

        info!(
            queue = %self.queue.name(),
            message_id = %message.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "scheduling message retry"
        );
        tokio::time::sleep(delay).await;

        let successor = message.into_retry(&err.to_string());
        match self.queue.send(successor, None).await {
            Ok(_) => {
                self.ack_entry(stream, entry_id).await.ok();
                metrics::record_retry(self.queue.name(), attempt);
                metrics::record_message_processed(self.queue.name(), MessageStatus::Retried);
                self.events.emit(ConsumerEvent::MessageRetried {
                    message_id: message.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            Err(send_err) => {
                // leave the entry pending; the next pass redelivers it
                error!(
                    message_id = %message.id,
                    error = %send_err,
                    "failed to re-enqueue retry"
                );
            }
        }
    }

    async fn dead_letter(
        &self,
        stream: &str,
        entry_id: &str,
        message: &Message,
        err: &QueueError,
    ) {
        let reason = "max_retries_exceeded";
        if let Some(dlq) = &self.dlq {
            let metadata = HashMap::from([("lastError".to_string(), err.to_string())]);
            if let Err(dlq_err) = dlq
                .add_message(message, reason, self.queue.name(), Some(&metadata))
                .await
            {
                error!(
                    message_id = %message.id,
                    error = %dlq_err,
                    "failed to dead-letter message"
                );
            }
        } else {
            warn!(
                queue = %self.queue.name(),
                message_id = %message.id,
                "retries exhausted and no dead-letter queue configured, dropping"
            );
        }

        self.ack_entry(stream, entry_id).await.ok();
        metrics::record_message_processed(self.queue.name(), MessageStatus::DeadLettered);
        self.events.emit(ConsumerEvent::MessageDeadLettered {
            message_id: message.id.clone(),
            reason: reason.to_string(),
        });
    }

    async fn ack_entry(&self, stream: &str, entry_id: &str) -> Result<(), QueueError> {
        self.conn.xack(stream, &self.group, entry_id).await?;
        debug!(entry_id, "acknowledged entry");
        Ok(())
    }

    fn record_success(&self, started: Instant, count: usize) {
        let elapsed_ms = started.elapsed().as_millis() as f64;
        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.messages_processed += count as u64;
            metrics.average_processing_time_ms =
                (metrics.average_processing_time_ms + elapsed_ms) / 2.0;
            for _ in 0..count {
                metrics.error_rate *= 0.95;
            }
            metrics.last_processed_at = Some(Utc::now().timestamp_millis());
        }
        for _ in 0..count {
            metrics::record_message_processed(self.queue.name(), MessageStatus::Success);
        }
        metrics::record_processing_duration(self.queue.name(), started.elapsed());
        self.events
            .emit(ConsumerEvent::MessagesProcessed { count });
    }

    fn record_failure(&self, message_id: &str, err: &QueueError) {
        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.error_rate = metrics.error_rate * 0.95 + 0.05;
        }
        metrics::record_message_processed(self.queue.name(), MessageStatus::Failed);
        metrics::record_error(self.queue.name(), err.kind());
        self.events.emit(ConsumerEvent::MessageError {
            message_id: Some(message_id.to_string()),
            error: err.to_string(),
        });
    }
}

/// Best-effort string view of raw entry fields for dead-lettering.
fn raw_entry_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
                redis::Value::SimpleString(s) => s.clone(),
                other => format!("{other:?}"),
            };
            (k.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    #[test]
    fn test_raw_entry_fields() {
        let map = HashMap::from([
            (
                "payload".to_string(),
                redis::Value::BulkString(b"{\"a\":1}".to_vec()),
            ),
            ("count".to_string(), redis::Value::Int(3)),
        ]);
        let fields = raw_entry_fields(&map);
        assert_eq!(fields.get("payload").unwrap(), "{\"a\":1}");
        assert!(fields.contains_key("count"));
    }

    #[test]
    fn test_consumer_stream_selection() {
        // plain queue reads the main stream only; priority queues read all
        // tiers, highest first
        let plain = QueueConfig::default();
        assert!(!plain.priority);

        let streams: Vec<String> = (0..=MAX_PRIORITY)
            .rev()
            .map(|p| priority_stream_key("q", p))
            .collect();
        assert_eq!(streams.first().unwrap(), "queue:q:priority:9");
        assert_eq!(streams.last().unwrap(), "queue:q:priority:0");
    }

    #[test]
    fn test_unknown_named_policy_is_rejected() {
        let options = ConsumerConfig::default()
            .with_retry_policy(RetryPolicySpec::Named("quadratic".to_string()));
        let err = match Consumer::resolve_policy(&options) {
            Err(e) => e,
            Ok(_) => panic!("expected resolve_policy to fail"),
        };
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn test_named_policy_resolution() {
        let options = ConsumerConfig::default()
            .with_retry_policy(RetryPolicySpec::Named("exponential".to_string()))
            .with_max_retries(4);
        let policy = Consumer::resolve_policy(&options).unwrap();
        // merged attempt cap from the consumer options
        assert!(policy.should_retry(3, None));
        assert!(!policy.should_retry(4, None));
    }
}
