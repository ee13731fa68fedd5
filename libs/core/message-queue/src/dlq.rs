//! Dead-letter queue management.
//!
//! Every queue configured with a `dead_letter_queue` routes exhausted
//! messages onto the sibling stream `queue:{dlq}:dlq`. Entries keep the
//! normal message encoding plus failure metadata, so they stay inspectable
//! with plain XRANGE and can be re-enqueued onto any queue.

use crate::config::HeaderMap;
use crate::connection::RedisConnection;
use crate::error::QueueError;
use crate::message::{DeadLetterMessage, Message};
use crate::queue::main_stream_key;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stream key of a dead-letter queue.
pub(crate) fn dlq_stream_key(name: &str) -> String {
    format!("queue:{name}:dlq")
}

/// Aggregate view of a dead-letter stream.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub stream: String,
    pub length: u64,
    /// Entry counts keyed by the queue the message failed on.
    pub by_origin_queue: HashMap<String, u64>,
    /// Entry counts keyed by failure reason.
    pub by_reason: HashMap<String, u64>,
    pub oldest_failed_at: Option<i64>,
    pub newest_failed_at: Option<i64>,
}

/// Per-id outcome of a batch reprocess.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessReport {
    /// DLQ entry id paired with the id of the fresh message.
    pub succeeded: Vec<(String, String)>,
    /// DLQ entry id paired with the failure.
    pub failed: Vec<(String, String)>,
}

/// Manages one dead-letter stream.
pub struct DeadLetterManager {
    conn: RedisConnection,
    name: String,
    stream: String,
    max_length: i64,
}

impl DeadLetterManager {
    pub fn new(conn: RedisConnection, name: impl Into<String>, max_length: i64) -> Self {
        let name = name.into();
        let stream = dlq_stream_key(&name);
        Self {
            conn,
            name,
            stream,
            max_length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wrap a failed message and append it to the dead-letter stream.
    pub async fn add_message(
        &self,
        message: &Message,
        reason: &str,
        original_queue: &str,
        metadata: Option<&HeaderMap>,
    ) -> Result<String, QueueError> {
        let mut dead = DeadLetterMessage {
            message: message.clone(),
            original_queue: original_queue.to_string(),
            failure_reason: reason.to_string(),
            failed_at: Utc::now().timestamp_millis(),
            attempts: message.retry_count + 1,
            reprocessed_from: None,
        };
        if let Some(metadata) = metadata {
            dead.message.headers.extend(metadata.clone());
        }

        let fields = dead.to_fields()?;
        let dlq_id = self
            .conn
            .xadd(&self.stream, Some(self.max_length), &fields)
            .await?;

        info!(
            message_id = %message.id,
            dlq_id = %dlq_id,
            reason = %reason,
            original_queue = %original_queue,
            attempts = dead.attempts,
            "dead-lettered message"
        );
        Ok(dlq_id)
    }

    /// Append an entry that could not be decoded as a message.
    pub async fn add_raw(
        &self,
        original_entry_id: &str,
        raw: &str,
        reason: &str,
        original_queue: &str,
    ) -> Result<String, QueueError> {
        let placeholder = Message::new(serde_json::json!({ "raw": raw }))
            .with_header("originalEntryId", original_entry_id);
        self.add_message(&placeholder, reason, original_queue, None)
            .await
    }

    /// Full-scan statistics: counts by origin queue and failure reason.
    pub async fn get_stats(&self) -> Result<DeadLetterStats, QueueError> {
        let length = self.conn.xlen(&self.stream).await.unwrap_or(0);
        let reply = self.conn.xrange(&self.stream, "-", "+", None).await?;

        let mut by_origin_queue: HashMap<String, u64> = HashMap::new();
        let mut by_reason: HashMap<String, u64> = HashMap::new();
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;

        for entry in &reply.ids {
            let Ok(dead) = DeadLetterMessage::from_fields(&entry.map) else {
                continue;
            };
            *by_origin_queue.entry(dead.original_queue).or_insert(0) += 1;
            *by_reason.entry(dead.failure_reason).or_insert(0) += 1;
            oldest = Some(oldest.map_or(dead.failed_at, |o: i64| o.min(dead.failed_at)));
            newest = Some(newest.map_or(dead.failed_at, |n: i64| n.max(dead.failed_at)));
        }

        Ok(DeadLetterStats {
            stream: self.stream.clone(),
            length,
            by_origin_queue,
            by_reason,
            oldest_failed_at: oldest,
            newest_failed_at: newest,
        })
    }

    /// Paged scan of dead-letter entries; returns `(entry id, message)`.
    pub async fn query_messages(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(String, DeadLetterMessage)>, QueueError> {
        let reply = self
            .conn
            .xrange(&self.stream, "-", "+", Some(offset + limit))
            .await?;

        let mut entries = Vec::new();
        for entry in reply.ids.into_iter().skip(offset) {
            match DeadLetterMessage::from_fields(&entry.map) {
                Ok(dead) => entries.push((entry.id, dead)),
                Err(e) => {
                    warn!(
                        dlq = %self.stream,
                        entry_id = %entry.id,
                        error = %e,
                        "skipping undecodable dead-letter entry"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Re-enqueue one dead-lettered message onto a queue.
    ///
    /// Builds a fresh message (new id, zeroed retry count, the DLQ entry id
    /// recorded in `reprocessedFrom`), appends it to the target queue's main
    /// stream, and deletes the DLQ entry.
    pub async fn reprocess_message(
        &self,
        dlq_id: &str,
        target_queue: Option<&str>,
    ) -> Result<String, QueueError> {
        let reply = self.conn.xrange(&self.stream, dlq_id, dlq_id, None).await?;
        let entry = reply.ids.first().ok_or_else(|| {
            QueueError::OperationFailed(format!("dead-letter entry '{dlq_id}' not found"))
        })?;
        let dead = DeadLetterMessage::from_fields(&entry.map)?;

        let target = match target_queue {
            Some(target) => target.to_string(),
            None if !dead.original_queue.is_empty() => dead.original_queue.clone(),
            None => {
                return Err(QueueError::OperationFailed(format!(
                    "dead-letter entry '{dlq_id}' has no origin queue and no target was given"
                )));
            }
        };

        let mut fresh = dead.message.clone();
        fresh.id = Uuid::new_v4().to_string();
        fresh.retry_count = 0;
        fresh.timestamp = Utc::now().timestamp_millis();
        fresh
            .headers
            .insert("reprocessedFrom".to_string(), dlq_id.to_string());

        let fields = fresh.to_fields()?;
        self.conn
            .xadd(&main_stream_key(&target), Some(self.max_length), &fields)
            .await?;
        self.conn.xdel(&self.stream, dlq_id).await?;

        info!(
            dlq_id = %dlq_id,
            new_message_id = %fresh.id,
            target_queue = %target,
            "reprocessed dead-lettered message"
        );
        Ok(fresh.id)
    }

    /// Reprocess many entries with bounded parallelism.
    pub async fn reprocess_batch(
        &self,
        dlq_ids: &[String],
        batch_size: usize,
    ) -> Result<ReprocessReport, QueueError> {
        let batch_size = batch_size.max(1);
        let mut report = ReprocessReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for chunk in dlq_ids.chunks(batch_size) {
            let outcomes = join_all(
                chunk
                    .iter()
                    .map(|id| async move { (id.clone(), self.reprocess_message(id, None).await) }),
            )
            .await;

            for (id, outcome) in outcomes {
                match outcome {
                    Ok(new_id) => report.succeeded.push((id, new_id)),
                    Err(e) => report.failed.push((id, e.to_string())),
                }
            }
        }

        info!(
            dlq = %self.stream,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch reprocess finished"
        );
        Ok(report)
    }

    /// Delete one entry; false when unknown.
    pub async fn delete(&self, dlq_id: &str) -> Result<bool, QueueError> {
        let deleted = self.conn.xdel(&self.stream, dlq_id).await?;
        debug!(dlq_id = %dlq_id, "deleted dead-letter entry");
        Ok(deleted > 0)
    }

    /// Delete entries that failed more than `max_age_ms` ago.
    pub async fn cleanup(&self, max_age_ms: i64) -> Result<u64, QueueError> {
        let cutoff = Utc::now().timestamp_millis() - max_age_ms;
        let reply = self.conn.xrange(&self.stream, "-", "+", None).await?;

        let mut removed = 0;
        for entry in &reply.ids {
            let failed_at = DeadLetterMessage::from_fields(&entry.map)
                .map(|d| d.failed_at)
                .unwrap_or_else(|_| entry_timestamp(&entry.id));
            if failed_at < cutoff {
                removed += self.conn.xdel(&self.stream, &entry.id).await.unwrap_or(0) as u64;
            }
        }

        if removed > 0 {
            info!(dlq = %self.stream, removed, "cleaned up aged dead-letter entries");
        }
        Ok(removed)
    }

    /// Unconditionally delete the dead-letter stream.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let length = self.conn.xlen(&self.stream).await.unwrap_or(0);
        self.conn.del(&[self.stream.clone()]).await?;
        if length > 0 {
            info!(dlq = %self.stream, purged = length, "purged dead-letter queue");
        }
        Ok(length)
    }
}

impl Clone for DeadLetterManager {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            name: self.name.clone(),
            stream: self.stream.clone(),
            max_length: self.max_length,
        }
    }
}

/// Milliseconds portion of a stream entry id (`<ms>-<seq>`).
fn entry_timestamp(entry_id: &str) -> i64 {
    entry_id
        .split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(0)
}
