//! Configuration for the queue manager and its components.
//!
//! Every struct carries sensible defaults and `with_*` builders so
//! callers only spell out what they change.

use crate::error::QueueError;
use std::collections::HashMap;

/// Address of a single Redis node.
#[derive(Debug, Clone)]
pub struct SingleNodeConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl SingleNodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// One node of a Redis cluster.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub host: String,
    pub port: u16,
}

impl ClusterNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Redis cluster topology.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<ClusterNode>,
    pub password: Option<String>,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self {
            nodes,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Redis connection settings: exactly one of `single` or `cluster`.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub single: Option<SingleNodeConfig>,
    pub cluster: Option<ClusterConfig>,
    /// Advisory pool size, surfaced in metrics only.
    pub pool_size: usize,
    /// Attempts when establishing the initial connection.
    pub retry_attempts: u32,
    /// Delay between reconnect attempts in milliseconds.
    pub retry_delay_ms: u64,
}

impl RedisConfig {
    pub fn single_node(host: impl Into<String>, port: u16) -> Self {
        Self {
            single: Some(SingleNodeConfig::new(host, port)),
            cluster: None,
            ..Self::empty()
        }
    }

    pub fn cluster(nodes: Vec<ClusterNode>) -> Self {
        Self {
            single: None,
            cluster: Some(ClusterConfig::new(nodes)),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            single: None,
            cluster: None,
            pool_size: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Exactly one of single-node or cluster must be configured.
    pub fn validate(&self) -> Result<(), QueueError> {
        match (&self.single, &self.cluster) {
            (None, None) => Err(QueueError::Configuration(
                "either redis.single or redis.cluster is required".to_string(),
            )),
            (Some(_), Some(_)) => Err(QueueError::Configuration(
                "redis.single and redis.cluster are mutually exclusive".to_string(),
            )),
            _ => {
                if let Some(cluster) = &self.cluster
                    && cluster.nodes.is_empty()
                {
                    return Err(QueueError::Configuration(
                        "redis.cluster.nodes must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Per-queue topology settings.
///
/// With `priority` enabled the queue keeps nine sibling streams, one per
/// tier, under a shared consumer group. Higher tiers are preferred, not
/// guaranteed, ahead of lower ones when consumers are busy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Approximate stream length cap, enforced with `MAXLEN ~` on append.
    pub max_length: i64,
    /// Enable the nine per-tier priority streams.
    pub priority: bool,
    /// Default retry budget for messages that do not set their own.
    pub retry_attempts: u32,
    /// Name of the sibling queue whose `:dlq` stream receives exhausted
    /// messages.
    pub dead_letter_queue: Option<String>,
    /// How often the delayed-set sweeper promotes due messages.
    pub sweep_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            priority: false,
            retry_attempts: 3,
            dead_letter_queue: None,
            sweep_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    /// Merge per-queue overrides over this config (overrides win).
    pub fn merged_with(&self, overrides: &QueueConfigOverrides) -> Self {
        Self {
            max_length: overrides.max_length.unwrap_or(self.max_length),
            priority: overrides.priority.unwrap_or(self.priority),
            retry_attempts: overrides.retry_attempts.unwrap_or(self.retry_attempts),
            dead_letter_queue: overrides
                .dead_letter_queue
                .clone()
                .or_else(|| self.dead_letter_queue.clone()),
            sweep_interval_ms: overrides.sweep_interval_ms.unwrap_or(self.sweep_interval_ms),
        }
    }
}

/// Optional per-queue overrides passed to `create_queue`.
#[derive(Debug, Clone, Default)]
pub struct QueueConfigOverrides {
    pub max_length: Option<i64>,
    pub priority: Option<bool>,
    pub retry_attempts: Option<u32>,
    pub dead_letter_queue: Option<String>,
    pub sweep_interval_ms: Option<u64>,
}

impl QueueConfigOverrides {
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }
}

/// Producer-side batching and retry settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Buffer size that triggers a flush; 1 disables batching.
    pub batch_size: usize,
    /// Flush the buffer this long after it was opened, full or not.
    pub batch_timeout_ms: u64,
    /// Retry budget for direct sends that hit transient errors.
    pub max_retries: u32,
    /// Interval of the retry drain tick.
    pub retry_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl ProducerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.batch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }
}

/// What the consumer does with stream entries it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseFailurePolicy {
    /// Acknowledge and drop the entry so the group PEL does not wedge.
    #[default]
    AckAndDrop,
    /// Route the raw entry to the dead-letter stream before acknowledging.
    DeadLetter,
}

/// How a consumer picks its retry policy.
#[derive(Debug, Clone)]
pub enum RetryPolicySpec {
    /// One of the registered strategy names: `fixed`, `linear`,
    /// `exponential`, `circuit-breaker`. The consumer's `max_retries`
    /// is merged in as the attempt cap.
    Named(String),
    /// A full retry configuration; used as-is, including its attempt cap.
    Config(crate::retry::RetryConfig),
}

/// Consumer-side options.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Entries fetched per read.
    pub batch_size: usize,
    /// XREADGROUP BLOCK deadline in milliseconds.
    pub timeout_ms: u64,
    /// Acknowledge successful handler invocations automatically.
    pub auto_ack: bool,
    /// Fallback retry budget when no retry policy is configured.
    pub max_retries: u32,
    /// Concurrent consume tasks.
    pub concurrency: usize,
    /// Consumer group; defaults to `{queue}-consumers`.
    pub consumer_group: Option<String>,
    /// Stable consumer name; generated when absent.
    pub consumer_id: Option<String>,
    /// Override of the queue's dead-letter target.
    pub dead_letter_queue: Option<String>,
    /// Retry policy selection.
    pub retry_policy: Option<RetryPolicySpec>,
    /// Policy for undecodable entries.
    pub parse_failure: ParseFailurePolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            timeout_ms: 5000,
            auto_ack: false,
            max_retries: 3,
            concurrency: 1,
            consumer_group: None,
            consumer_id: None,
            dead_letter_queue: None,
            retry_policy: None,
            parse_failure: ParseFailurePolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = Some(id.into());
        self
    }

    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    pub fn with_retry_policy(mut self, spec: RetryPolicySpec) -> Self {
        self.retry_policy = Some(spec);
        self
    }

    pub fn with_parse_failure(mut self, policy: ParseFailurePolicy) -> Self {
        self.parse_failure = policy;
        self
    }
}

/// Periodic health-check loop settings.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

/// Metrics emission switch.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Metrics emission cadence.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { interval_ms: 10_000 }
    }
}

/// Top-level configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub redis: RedisConfig,
    /// Base queue config merged into every `create_queue` call.
    pub default_queue: QueueConfig,
    pub health_check: HealthCheckConfig,
    pub metrics: MetricsConfig,
    pub monitoring: MonitoringConfig,
}

impl QueueManagerConfig {
    pub fn new(redis: RedisConfig) -> Self {
        Self {
            redis,
            default_queue: QueueConfig::default(),
            health_check: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    pub fn with_default_queue(mut self, config: QueueConfig) -> Self {
        self.default_queue = config;
        self
    }

    pub fn with_health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = config;
        self
    }

    pub fn with_metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    pub fn with_monitoring(mut self, config: MonitoringConfig) -> Self {
        self.monitoring = config;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        self.redis.validate()
    }
}

/// Metadata merged into dead-letter headers; alias for readability.
pub type HeaderMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_requires_one_endpoint() {
        let config = RedisConfig {
            single: None,
            cluster: None,
            pool_size: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        };
        assert!(matches!(
            config.validate(),
            Err(QueueError::Configuration(_))
        ));

        let config = RedisConfig::single_node("127.0.0.1", 6379);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_config_rejects_both_endpoints() {
        let mut config = RedisConfig::single_node("127.0.0.1", 6379);
        config.cluster = Some(ClusterConfig::new(vec![ClusterNode::new("10.0.0.1", 7000)]));
        assert!(matches!(
            config.validate(),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_cluster_config_rejects_empty_nodes() {
        let config = RedisConfig::cluster(vec![]);
        assert!(matches!(
            config.validate(),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_node_url() {
        let node = SingleNodeConfig::new("redis.internal", 6380);
        assert_eq!(node.url(), "redis://redis.internal:6380");

        let node = node.with_password("hunter2");
        assert_eq!(node.url(), "redis://:hunter2@redis.internal:6380");
    }

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_length, 10_000);
        assert!(!config.priority);
        assert_eq!(config.retry_attempts, 3);
        assert!(config.dead_letter_queue.is_none());
    }

    #[test]
    fn test_queue_config_merge_overrides_win() {
        let base = QueueConfig::default()
            .with_max_length(5000)
            .with_dead_letter_queue("base-dlq");
        let overrides = QueueConfigOverrides::default()
            .with_max_length(200)
            .with_priority(true);

        let merged = base.merged_with(&overrides);
        assert_eq!(merged.max_length, 200);
        assert!(merged.priority);
        // untouched fields fall through from the base
        assert_eq!(merged.dead_letter_queue.as_deref(), Some("base-dlq"));
        assert_eq!(merged.retry_attempts, 3);
    }

    #[test]
    fn test_producer_config_defaults() {
        let config = ProducerConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_timeout_ms, 1000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1000);
    }

    #[test]
    fn test_consumer_config_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.timeout_ms, 5000);
        assert!(!config.auto_ack);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.parse_failure, ParseFailurePolicy::AckAndDrop);
    }

    #[test]
    fn test_consumer_config_floors() {
        let config = ConsumerConfig::default()
            .with_concurrency(0)
            .with_batch_size(0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_manager_config_validation_delegates() {
        let config = QueueManagerConfig::new(RedisConfig::single_node("localhost", 6379));
        assert!(config.validate().is_ok());
    }
}
