//! Message Queue - Redis Streams Message Queue Library
//!
//! A reusable library for publishing and processing messages over Redis
//! Streams with:
//! - Named queues with consumer-group fan-out
//! - Priority routing across per-tier streams (0-9)
//! - Delayed delivery through a sorted set with a sweeper task
//! - Producer-side batching with per-slot completions and a retry queue
//! - Pluggable retry policies (fixed, linear, exponential, circuit breaker)
//! - Dead letter queue per queue with reprocess/cleanup admin operations
//! - Coordinated lifecycle, health-check, and metrics loops
//! - Single-node and cluster Redis support
//!
//! # Architecture
//!
//! ```text
//! Producer ──> Queue.send ──> Redis stream (queue:Q[...:priority:P])
//!                                  │ (consumer group)
//!                                  v
//!                              Consumer ──> handler
//!                                  │ ack | retry ──> Queue.send
//!                                  v (exhausted)
//!                              DLQ stream (queue:D:dlq)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use message_queue::{
//!     ConsumerConfig, Message, Producer, QueueHandler, QueueManager,
//!     QueueManagerConfig, RedisConfig,
//! };
//!
//! let config = QueueManagerConfig::new(RedisConfig::single_node("127.0.0.1", 6379));
//! let manager = QueueManager::new(config)?;
//! manager.connect().await?;
//! manager.start().await?;
//!
//! let queue = manager.create_queue("task-queue", None).await?;
//!
//! // publish
//! let producer = Producer::new(queue.clone(), None);
//! producer.start().await;
//! producer.send(Message::new(serde_json::json!({"kind": "email"})), None).await?;
//!
//! // consume
//! let handler = QueueHandler::single_fn(|message, ctx| async move {
//!     tracing::info!(id = %message.id, "processing");
//!     ctx.ack().await
//! });
//! let consumer = Consumer::new(queue, handler, manager.connections().default_connection().await?, ConsumerConfig::default())?;
//! consumer.start().await?;
//! ```

mod config;
mod connection;
mod consumer;
pub mod dlq;
mod error;
mod events;
pub mod health;
mod manager;
mod message;
pub mod metrics;
mod producer;
mod queue;
pub mod retry;

// Re-export all public types
pub use config::{
    ClusterConfig, ClusterNode, ConsumerConfig, HeaderMap, HealthCheckConfig, MetricsConfig,
    MonitoringConfig, ParseFailurePolicy, ProducerConfig, QueueConfig, QueueConfigOverrides,
    QueueManagerConfig, RedisConfig, RetryPolicySpec, SingleNodeConfig,
};
pub use connection::{
    ConnectionInfo, ConnectionKind, ConnectionManager, ConnectionStatus, RedisConnection,
};
pub use consumer::{
    BatchHandler, Consumer, ConsumerMetrics, MessageContext, MessageHandler, QueueHandler,
};
pub use dlq::{DeadLetterManager, DeadLetterStats, ReprocessReport};
pub use error::{ErrorSeverity, QueueError};
pub use events::{ConnectionEvent, ConsumerEvent, EventBus, ManagerEvent, QueueEvent};
pub use health::{dlq_admin_router, full_admin_router, health_router};
pub use manager::{CheckResult, HealthReport, HealthStatus, ManagerMetrics, QueueManager};
pub use message::{DeadLetterMessage, Message, MessageOptions, SendResult};
pub use producer::{Producer, ProducerMetrics};
pub use queue::{Queue, QueueInfo, QueueStats};
pub use retry::{
    CircuitBreakerPolicy, CircuitState, CompositeBackoff, CustomBackoff, ExponentialBackoff,
    FixedDelay, LinearBackoff, RetryConfig, RetryExecutor, RetryPolicy, RetryStrategyKind,
    development_policy, policy_from_name, production_policy,
};

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
