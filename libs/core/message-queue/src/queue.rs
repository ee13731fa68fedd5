//! Per-name queue topology over Redis streams.
//!
//! A queue owns its stream keys, validates and appends messages, stages
//! delayed deliveries in a sorted set, and runs the sweeper task that
//! promotes due entries back onto the streams.
//!
//! Key layout for a queue `Q`:
//!
//! ```text
//! queue:Q                     main stream
//! queue:Q:priority:0..9       per-tier streams (priority mode)
//! queue:Q:delayed             delayed set, scored by executeAt
//! queue:Q:consumers           main consumer group
//! queue:Q:consumers:priority  shared group across the tier streams
//! ```

use crate::config::QueueConfig;
use crate::connection::RedisConnection;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::message::{MAX_PRIORITY, Message, MessageOptions, SendResult};
use crate::metrics::{self, MessageStatus};
use chrono::Utc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delayed entries promoted per sweep.
const SWEEP_BATCH: usize = 128;

pub(crate) fn main_stream_key(name: &str) -> String {
    format!("queue:{name}")
}

pub(crate) fn priority_stream_key(name: &str, priority: u8) -> String {
    format!("queue:{name}:priority:{priority}")
}

pub(crate) fn delayed_key(name: &str) -> String {
    format!("queue:{name}:delayed")
}

pub(crate) fn main_group_name(name: &str) -> String {
    format!("queue:{name}:consumers")
}

pub(crate) fn priority_group_name(name: &str) -> String {
    format!("queue:{name}:consumers:priority")
}

/// Target stream for a message of the given priority.
pub(crate) fn stream_for(name: &str, config: &QueueConfig, priority: u8) -> String {
    if config.priority {
        priority_stream_key(name, priority)
    } else {
        main_stream_key(name)
    }
}

/// Length and consumer-group summary.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub length: u64,
    pub consumer_groups: usize,
}

/// Snapshot used by the manager metrics loop.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub name: String,
    pub length: u64,
    pub delayed: u64,
    pub consumer_groups: usize,
    pub running: bool,
}

/// A named queue bound to one Redis connection.
pub struct Queue {
    name: String,
    config: QueueConfig,
    conn: RedisConnection,
    running: AtomicBool,
    events: EventBus<QueueEvent>,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig, conn: RedisConnection) -> Self {
        Self {
            name: name.into(),
            config,
            conn,
            running: AtomicBool::new(false),
            events: EventBus::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn connection(&self) -> &RedisConnection {
        &self.conn
    }

    /// Subscribe to queue lifecycle and send events.
    pub fn events(&self) -> &EventBus<QueueEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent: materializes the consumer groups and arms the delayed
    /// sweeper.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let group = main_group_name(&self.name);
        Self::ensure_group(&self.conn, &main_stream_key(&self.name), &group).await?;

        if self.config.priority {
            let shared = priority_group_name(&self.name);
            for priority in 0..=MAX_PRIORITY {
                Self::ensure_group(
                    &self.conn,
                    &priority_stream_key(&self.name, priority),
                    &shared,
                )
                .await?;
            }
        }

        self.spawn_sweeper();
        info!(queue = %self.name, priority = self.config.priority, "queue started");
        self.events.emit(QueueEvent::Started);
        Ok(())
    }

    /// Idempotent: cancels the sweeper. Stream keys stay in Redis.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some((tx, handle)) = sweeper {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        info!(queue = %self.name, "queue stopped");
        self.events.emit(QueueEvent::Stopped);
    }

    /// Create a consumer group, treating BUSYGROUP as success.
    pub(crate) async fn ensure_group(
        conn: &RedisConnection,
        stream: &str,
        group: &str,
    ) -> Result<(), QueueError> {
        match conn.xgroup_create_mkstream(stream, group).await {
            Ok(()) => {
                debug!(stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::OperationFailed(format!(
                "creating group '{group}' on '{stream}': {e}"
            ))),
        }
    }

    /// Validate, merge options, and append or stage the message.
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

        if message.delay_ms.unwrap_or(0) > 0 {
            return self.stage_delayed(message).await;
        }

        let stream = stream_for(&self.name, &self.config, message.priority);
        let fields = message.to_fields()?;
        let started = std::time::Instant::now();

        let redis_id = self
            .conn
            .xadd(&stream, Some(self.config.max_length), &fields)
            .await
            .map_err(|e| {
                metrics::record_message_sent(&self.name, MessageStatus::Failed);
                QueueError::SendFailed {
                    queue: self.name.clone(),
                    reason: e.to_string(),
                }
            })?;

        metrics::record_message_sent(&self.name, MessageStatus::Success);
        metrics::record_send_duration(&self.name, started.elapsed());
        debug!(
            queue = %self.name,
            message_id = %message.id,
            redis_message_id = %redis_id,
            stream = %stream,
            "appended message"
        );
        self.events.emit(QueueEvent::MessageSent {
            message_id: message.id.clone(),
            redis_message_id: Some(redis_id.clone()),
        });

        Ok(SendResult::appended(message.id, redis_id))
    }

    /// Stage a delayed message in the sorted set, scored by its due time.
    async fn stage_delayed(&self, message: Message) -> Result<SendResult, QueueError> {
        let delay_ms = message.delay_ms.unwrap_or(0);
        let execute_at = Utc::now().timestamp_millis() + delay_ms as i64;

        let mut staged = message.clone();
        staged.delay_ms = None;
        let member = serde_json::to_string(&staged)?;

        self.conn
            .zadd(&delayed_key(&self.name), execute_at, &member)
            .await
            .map_err(|e| QueueError::SendFailed {
                queue: self.name.clone(),
                reason: e.to_string(),
            })?;

        metrics::record_message_sent(&self.name, MessageStatus::Delayed);
        debug!(
            queue = %self.name,
            message_id = %message.id,
            delay_ms,
            execute_at,
            "staged delayed message"
        );
        self.events.emit(QueueEvent::MessageSent {
            message_id: message.id.clone(),
            redis_message_id: None,
        });

        Ok(SendResult::staged(message.id, execute_at))
    }

    /// Append a batch with one pipelined XADD per non-delayed slot.
    ///
    /// Delayed slots are skipped with a warning; every input slot gets a
    /// result, failures carried per slot.
    pub async fn send_batch(
        &self,
        messages: Vec<Message>,
        options: Option<&MessageOptions>,
    ) -> Result<Vec<SendResult>, QueueError> {
        let merged: Vec<Message> = messages
            .into_iter()
            .map(|m| match options {
                Some(options) => options.apply(m),
                None => m,
            })
            .collect();

        let timestamp = Utc::now().timestamp_millis();
        let mut results: Vec<Option<SendResult>> = (0..merged.len()).map(|_| None).collect();
        let mut entries = Vec::new();
        let mut slot_of_entry = Vec::new();

        for (slot, message) in merged.iter().enumerate() {
            if let Err(e) = message.validate() {
                results[slot] = Some(Self::slot_failed(message, timestamp, e.to_string()));
                continue;
            }
            if message.delay_ms.unwrap_or(0) > 0 {
                warn!(
                    queue = %self.name,
                    message_id = %message.id,
                    "delayed message skipped in batch send"
                );
                results[slot] = Some(Self::slot_failed(
                    message,
                    timestamp,
                    "delayed messages are not supported in batches".to_string(),
                ));
                continue;
            }
            entries.push((
                stream_for(&self.name, &self.config, message.priority),
                Some(self.config.max_length),
                message.to_fields()?,
            ));
            slot_of_entry.push(slot);
        }

        if !entries.is_empty() {
            match self.conn.xadd_pipelined(&entries).await {
                Ok(ids) => {
                    for (entry, redis_id) in ids.into_iter().enumerate() {
                        let slot = slot_of_entry[entry];
                        metrics::record_message_sent(&self.name, MessageStatus::Success);
                        results[slot] = Some(SendResult {
                            message_id: merged[slot].id.clone(),
                            redis_message_id: Some(redis_id),
                            timestamp,
                            success: true,
                            delayed: false,
                            execute_at: None,
                            error: None,
                        });
                    }
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "batch append failed");
                    for &slot in &slot_of_entry {
                        metrics::record_message_sent(&self.name, MessageStatus::Failed);
                        results[slot] =
                            Some(Self::slot_failed(&merged[slot], timestamp, e.to_string()));
                    }
                }
            }
        }

        self.events.emit(QueueEvent::BatchSent {
            count: slot_of_entry.len(),
        });

        Ok(results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| SendResult {
                    message_id: String::new(),
                    redis_message_id: None,
                    timestamp,
                    success: false,
                    delayed: false,
                    execute_at: None,
                    error: Some("missing batch slot result".to_string()),
                })
            })
            .collect())
    }

    fn slot_failed(message: &Message, timestamp: i64, error: String) -> SendResult {
        SendResult {
            message_id: message.id.clone(),
            redis_message_id: None,
            timestamp,
            success: false,
            delayed: false,
            execute_at: None,
            error: Some(error),
        }
    }

    /// All stream keys this queue can write to.
    fn all_stream_keys(&self) -> Vec<String> {
        let mut keys = vec![main_stream_key(&self.name)];
        keys.extend((0..=MAX_PRIORITY).map(|p| priority_stream_key(&self.name, p)));
        keys
    }

    /// Delete the main and priority streams; returns the prior entry count.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let keys = self.all_stream_keys();
        let mut total = 0u64;
        for key in &keys {
            total += self.conn.xlen(key).await.unwrap_or(0);
        }
        self.conn.del(&keys).await?;
        info!(queue = %self.name, purged = total, "purged queue");
        Ok(total)
    }

    /// Sum of XLEN across the main and priority streams.
    pub async fn get_length(&self) -> Result<u64, QueueError> {
        let mut total = 0u64;
        for key in self.all_stream_keys() {
            total += self.conn.xlen(&key).await?;
        }
        Ok(total)
    }

    /// Length plus consumer-group count; tolerates a missing stream.
    pub async fn get_info(&self) -> Result<QueueInfo, QueueError> {
        let length = self.get_length().await?;
        let consumer_groups = self.group_count().await?;
        Ok(QueueInfo {
            name: self.name.clone(),
            length,
            consumer_groups,
        })
    }

    async fn group_count(&self) -> Result<usize, QueueError> {
        let key = if self.config.priority {
            priority_stream_key(&self.name, 0)
        } else {
            main_stream_key(&self.name)
        };
        match self.conn.xinfo_stream(&key).await {
            Ok(info) => Ok(info.groups),
            Err(e) if e.to_string().contains("no such key") => Ok(0),
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Full stats snapshot for the metrics loop.
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let length = self.get_length().await?;
        let delayed = self.conn.zcard(&delayed_key(&self.name)).await.unwrap_or(0);
        let consumer_groups = self.group_count().await.unwrap_or(0);
        Ok(QueueStats {
            name: self.name.clone(),
            length,
            delayed,
            consumer_groups,
            running: self.is_running(),
        })
    }

    /// Page through the main stream, decoding entries back into messages.
    pub async fn query_messages(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, QueueError> {
        let reply = self
            .conn
            .xrange(
                &main_stream_key(&self.name),
                "-",
                "+",
                Some(offset + limit),
            )
            .await?;

        let mut messages = Vec::new();
        for entry in reply.ids.into_iter().skip(offset) {
            match Message::from_fields(&entry.map) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        entry_id = %entry.id,
                        error = %e,
                        "skipping undecodable entry"
                    );
                }
            }
        }
        Ok(messages)
    }

    /// Arm the delayed-set sweeper task.
    fn spawn_sweeper(&self) {
        let (tx, mut rx) = watch::channel(false);
        let conn = self.conn.clone();
        let name = self.name.clone();
        let config = self.config.clone();
        let interval = Duration::from_millis(config.sweep_interval_ms.max(100));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match Self::sweep_due(&conn, &name, &config).await {
                            Ok(0) => {}
                            Ok(moved) => debug!(queue = %name, moved, "promoted delayed messages"),
                            Err(e) => debug!(queue = %name, error = %e, "delayed sweep failed"),
                        }
                    }
                }
            }
        });

        *self.sweeper.lock().unwrap() = Some((tx, handle));
    }

    /// Promote due delayed entries back onto their target streams.
    ///
    /// Entries whose append fails stay in the set for the next sweep;
    /// undecodable entries are dropped.
    async fn sweep_due(
        conn: &RedisConnection,
        name: &str,
        config: &QueueConfig,
    ) -> Result<usize, QueueError> {
        let key = delayed_key(name);
        let now = Utc::now().timestamp_millis();
        let due = conn.zrangebyscore(&key, now, SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for member in &due {
            match serde_json::from_str::<Message>(member) {
                Ok(message) => {
                    let stream = stream_for(name, config, message.priority);
                    let fields = message.to_fields()?;
                    if let Err(e) = conn.xadd(&stream, Some(config.max_length), &fields).await {
                        warn!(queue = %name, error = %e, "failed to promote delayed message");
                        continue;
                    }
                    moved += 1;
                }
                Err(e) => {
                    warn!(queue = %name, error = %e, "dropping undecodable delayed entry");
                }
            }
            conn.zrem(&key, member).await.ok();
        }
        Ok(moved)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Some((tx, handle)) = self.sweeper.lock().unwrap().take() {
            let _ = tx.send(true);
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(main_stream_key("orders"), "queue:orders");
        assert_eq!(priority_stream_key("orders", 9), "queue:orders:priority:9");
        assert_eq!(delayed_key("orders"), "queue:orders:delayed");
        assert_eq!(main_group_name("orders"), "queue:orders:consumers");
        assert_eq!(
            priority_group_name("orders"),
            "queue:orders:consumers:priority"
        );
    }

    #[test]
    fn test_stream_routing_by_priority() {
        let plain = QueueConfig::default();
        assert_eq!(stream_for("q", &plain, 8), "queue:q");

        let tiered = QueueConfig::default().with_priority(true);
        assert_eq!(stream_for("q", &tiered, 8), "queue:q:priority:8");
        assert_eq!(stream_for("q", &tiered, 0), "queue:q:priority:0");
    }
}
