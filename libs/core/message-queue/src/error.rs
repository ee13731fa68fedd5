//! Error types for queue operations.
//!
//! This module provides:
//! - `QueueError` - The main error type for all queue operations
//! - `ErrorSeverity` - Classification used by observers and alerting
//! - Transport predicates (`is_block_timeout`, `is_connection_error`, ...)
//!   used by the consumer loop and the retry engine

use thiserror::Error;

/// Errors that can occur in the queue library.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Invalid or missing top-level configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Queue name rejected by validation.
    #[error("invalid queue name '{0}': must match [a-zA-Z0-9_-], 1..=100 chars")]
    InvalidQueueName(String),

    /// A queue with the same name is already registered.
    #[error("queue '{0}' already exists")]
    QueueAlreadyExists(String),

    /// The named queue is not registered.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// The named connection is not registered with the connection manager.
    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    /// Message failed validation before send.
    #[error("message validation failed: {0}")]
    Validation(String),

    /// Append to a stream failed.
    #[error("send failed on queue '{queue}': {reason}")]
    SendFailed { queue: String, reason: String },

    /// A queue operation other than send failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The producer retry queue gave up on a send.
    #[error("max retries exceeded after {attempts} attempts: {reason}")]
    MaxRetriesExceeded { attempts: u32, reason: String },

    /// The target stream refused the append because it is at capacity.
    #[error("queue '{0}' is full")]
    QueueFull(String),

    /// The Redis user lacks permission for a command.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stream entry could not be decoded back into a message.
    #[error("message decoding failed: {0}")]
    Deserialization(String),

    /// Error surfaced by a consumer handler.
    #[error("handler error: {0}")]
    Handler(String),

    /// The component is stopping and rejected the operation.
    #[error("shutting down: {0}")]
    ShuttingDown(String),
}

impl QueueError {
    /// Stable kind name for this error.
    ///
    /// Retry policies match these names against their retryable /
    /// non-retryable sets, so the strings are part of the public contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidQueueName(_) => "invalid_queue_name",
            Self::QueueAlreadyExists(_) => "queue_already_exists",
            Self::QueueNotFound(_) => "queue_not_found",
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::Validation(_) => "validation",
            Self::SendFailed { .. } => "send_failed",
            Self::OperationFailed(_) => "operation_failed",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::QueueFull(_) => "queue_full",
            Self::Permission(_) => "permission",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Deserialization(_) => "deserialization",
            Self::Handler(_) => "handler",
            Self::ShuttingDown(_) => "shutting_down",
            Self::Redis(e) => {
                if e.to_string().to_lowercase().contains("oom")
                    || e.to_string().to_lowercase().contains("out of memory")
                {
                    "out_of_memory"
                } else {
                    match e.kind() {
                        redis::ErrorKind::AuthenticationFailed => "authentication",
                        redis::ErrorKind::Server(redis::ServerErrorKind::BusyLoading) => {
                            "node_unavailable"
                        }
                        redis::ErrorKind::Io => "connection",
                        _ => {
                            let err_str = e.to_string().to_lowercase();
                            if err_str.contains("noperm") {
                                "permission"
                            } else if err_str.contains("cluster") {
                                "cluster"
                            } else if err_str.contains("timeout") || err_str.contains("timed out") {
                                "timeout"
                            } else {
                                "command"
                            }
                        }
                    }
                }
            }
        }
    }

    /// Check if this is a BLOCK timeout (normal behavior, not an error).
    ///
    /// When using XREADGROUP with BLOCK, a timeout means no messages arrived
    /// within the block period. This is expected behavior, not an error.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }

    /// Check if this is a connection-level error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if self.is_block_timeout() {
                    return false;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            Self::SendFailed { reason, .. } | Self::OperationFailed(reason) => {
                let lower = reason.to_lowercase();
                lower.contains("connection") && !lower.contains("block")
            }
            _ => false,
        }
    }

    /// Check if this is a consumer group missing error (NOGROUP).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::OperationFailed(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Check if this is any timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timeout") || err_str.contains("timed out")
            }
            _ => false,
        }
    }

    /// Single predicate for "worth another attempt".
    ///
    /// True for connection loss, unavailable nodes, timeouts, transient send
    /// failures, and the usual OS-level network codes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::SendFailed { reason, .. } => {
                let lower = reason.to_lowercase();
                !lower.contains("validation") && !lower.contains("invalid")
            }
            Self::Redis(e) => {
                let err_str = e.to_string();
                let lower = err_str.to_lowercase();
                self.is_connection_error()
                    || self.is_timeout()
                    || lower.contains("try again")
                    || lower.contains("loading")
                    || err_str.contains("ECONNRESET")
                    || err_str.contains("ECONNREFUSED")
                    || err_str.contains("ETIMEDOUT")
            }
            _ => false,
        }
    }

    /// Severity bucket for observers.
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            "out_of_memory" | "cluster" | "queue_full" => ErrorSeverity::Critical,
            "connection" | "node_unavailable" | "max_retries_exceeded" => ErrorSeverity::High,
            "send_failed" | "timeout" | "handler" => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }
}

/// Severity taxonomy for emitted errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Cluster-wide failure, out of memory, queue full.
    Critical,
    /// Connection lost, node unavailable, retries exhausted.
    High,
    /// Message send/receive failure, timeout.
    Medium,
    /// Everything else.
    Low,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}
