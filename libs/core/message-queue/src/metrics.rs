//! Prometheus-compatible metrics for queue observability.
//!
//! ## Available metrics
//!
//! - `mq_messages_sent_total` - Counter of sends by status
//! - `mq_messages_processed_total` - Counter of processed messages by status
//! - `mq_send_duration_seconds` - Histogram of send latency
//! - `mq_processing_duration_seconds` - Histogram of handler latency
//! - `mq_queue_depth` - Gauge of stream length per queue
//! - `mq_errors_total` - Counter of errors by kind
//! - `mq_retries_total` - Counter of retry attempts
//! - `mq_dlq_size` - Gauge of dead-letter stream length
//! - `mq_in_flight_messages` - Gauge of concurrently processing messages

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const MESSAGES_SENT: &str = "mq_messages_sent_total";
    pub const MESSAGES_PROCESSED: &str = "mq_messages_processed_total";
    pub const SEND_DURATION: &str = "mq_send_duration_seconds";
    pub const PROCESSING_DURATION: &str = "mq_processing_duration_seconds";
    pub const QUEUE_DEPTH: &str = "mq_queue_depth";
    pub const ERRORS: &str = "mq_errors_total";
    pub const RETRIES: &str = "mq_retries_total";
    pub const DLQ_SIZE: &str = "mq_dlq_size";
    pub const IN_FLIGHT: &str = "mq_in_flight_messages";
}

/// Send/processing outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum MessageStatus {
    Success,
    Failed,
    Delayed,
    Batched,
    Retried,
    DeadLettered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Batched => "batched",
            Self::Retried => "retried",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at application startup; the returned handle renders the
/// Prometheus text format.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle, `None` before `init_metrics`.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_message_sent(queue: &str, status: MessageStatus) {
    counter!(
        names::MESSAGES_SENT,
        "queue" => queue.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

pub fn record_message_processed(queue: &str, status: MessageStatus) {
    counter!(
        names::MESSAGES_PROCESSED,
        "queue" => queue.to_string(),
        "status" => status.as_str().to_string()
    )
    .increment(1);
}

pub fn record_send_duration(queue: &str, duration: Duration) {
    histogram!(
        names::SEND_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_processing_duration(queue: &str, duration: Duration) {
    histogram!(
        names::PROCESSING_DURATION,
        "queue" => queue.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "queue" => queue.to_string()
    )
    .set(depth);
}

pub fn record_error(queue: &str, kind: &str) {
    counter!(
        names::ERRORS,
        "queue" => queue.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_retry(queue: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "queue" => queue.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

pub fn set_dlq_size(queue: &str, size: f64) {
    gauge!(
        names::DLQ_SIZE,
        "queue" => queue.to_string()
    )
    .set(size);
}

pub fn set_in_flight(queue: &str, count: f64) {
    gauge!(
        names::IN_FLIGHT,
        "queue" => queue.to_string()
    )
    .set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(MessageStatus::Success.as_str(), "success");
        assert_eq!(MessageStatus::Failed.as_str(), "failed");
        assert_eq!(MessageStatus::Delayed.as_str(), "delayed");
        assert_eq!(MessageStatus::DeadLettered.as_str(), "dead_lettered");
    }
}
