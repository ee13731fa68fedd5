//! Queue manager: lifecycle root of the library.
//!
//! Owns the connection manager and the registry of named queues, drives
//! the periodic health-check and metrics loops, and fans queue events out
//! on its own bus. Cloning a `QueueManager` shares the same instance.

use crate::config::{QueueConfigOverrides, QueueManagerConfig};
use crate::connection::{ConnectionInfo, ConnectionManager};
use crate::error::QueueError;
use crate::events::{EventBus, ManagerEvent, QueueEvent};
use crate::queue::{Queue, QueueStats};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest accepted queue name.
const MAX_QUEUE_NAME_LEN: usize = 100;

/// Aggregate health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// One named check with its timing.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub healthy: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a full health check.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub timestamp: i64,
}

/// Snapshot returned by `get_metrics`.
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    pub queues: HashMap<String, QueueStats>,
    pub connections: Vec<ConnectionInfo>,
    /// Advisory pool size from the Redis config.
    pub pool_size: usize,
    pub uptime_ms: u64,
    pub timestamp: i64,
}

struct ManagerInner {
    config: QueueManagerConfig,
    connections: ConnectionManager,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    events: EventBus<ManagerEvent>,
    started: AtomicBool,
    created_at: Instant,
    loops: Mutex<Vec<(watch::Sender<bool>, JoinHandle<()>)>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Creates and supervises queues over one Redis connection.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    /// Validate the config and build the manager. Fails fast on a config
    /// without exactly one Redis endpoint.
    pub fn new(config: QueueManagerConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let connections = ConnectionManager::new(config.redis.clone())?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                connections,
                queues: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                started: AtomicBool::new(false),
                created_at: Instant::now(),
                loops: Mutex::new(Vec::new()),
                forwarders: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Subscribe to manager events.
    pub fn events(&self) -> &EventBus<ManagerEvent> {
        &self.inner.events
    }

    /// The underlying connection manager.
    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub async fn connect(&self) -> Result<(), QueueError> {
        self.inner.connections.connect().await?;
        self.inner.events.emit(ManagerEvent::Connected);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.inner.connections.disconnect().await;
        self.inner.events.emit(ManagerEvent::Disconnected);
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connections.is_connected().await
    }

    /// Reject names that are empty, too long, or carry anything outside
    /// `[a-zA-Z0-9_-]`.
    fn validate_queue_name(name: &str) -> Result<(), QueueError> {
        if name.is_empty()
            || name.len() > MAX_QUEUE_NAME_LEN
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(QueueError::InvalidQueueName(name.to_string()));
        }
        Ok(())
    }

    /// Create and register a queue, merging the default queue config with
    /// the given overrides. Starts the queue when the manager is running.
    pub async fn create_queue(
        &self,
        name: &str,
        overrides: Option<QueueConfigOverrides>,
    ) -> Result<Arc<Queue>, QueueError> {
        Self::validate_queue_name(name)?;

        {
            let queues = self.inner.queues.read().await;
            if queues.contains_key(name) {
                return Err(QueueError::QueueAlreadyExists(name.to_string()));
            }
        }

        let config = match overrides {
            Some(overrides) => self.inner.config.default_queue.merged_with(&overrides),
            None => self.inner.config.default_queue.clone(),
        };
        let conn = self.inner.connections.default_connection().await?;
        let queue = Arc::new(Queue::new(name, config, conn));

        self.spawn_event_forwarder(&queue);

        {
            let mut queues = self.inner.queues.write().await;
            if queues.contains_key(name) {
                return Err(QueueError::QueueAlreadyExists(name.to_string()));
            }
            queues.insert(name.to_string(), Arc::clone(&queue));
        }

        if self.inner.started.load(Ordering::SeqCst) {
            queue.start().await?;
        }

        info!(queue = name, "queue created");
        self.inner.events.emit(ManagerEvent::QueueCreated {
            name: name.to_string(),
        });
        Ok(queue)
    }

    pub async fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.inner.queues.read().await.get(name).cloned()
    }

    pub async fn list_queues(&self) -> Vec<String> {
        self.inner.queues.read().await.keys().cloned().collect()
    }

    /// Stop, purge, and unregister a queue. False when unknown.
    pub async fn delete_queue(&self, name: &str) -> Result<bool, QueueError> {
        let queue = { self.inner.queues.write().await.remove(name) };
        let Some(queue) = queue else {
            return Ok(false);
        };

        queue.stop().await;
        queue.purge().await?;

        info!(queue = name, "queue deleted");
        self.inner.events.emit(ManagerEvent::QueueDeleted {
            name: name.to_string(),
        });
        Ok(true)
    }

    /// Idempotent: starts every queue plus the health and metrics loops.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queues: Vec<Arc<Queue>> =
            self.inner.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.start().await?;
        }

        if self.inner.config.health_check.enabled {
            self.spawn_health_loop();
        }
        if self.inner.config.metrics.enabled {
            self.spawn_metrics_loop();
        }

        info!("queue manager started");
        self.inner.events.emit(ManagerEvent::Started);
        Ok(())
    }

    /// Idempotent: cancels the loops first, then stops every queue.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let loops: Vec<_> = self.inner.loops.lock().unwrap().drain(..).collect();
        for (tx, handle) in loops {
            let _ = tx.send(true);
            let _ = handle.await;
        }

        let queues: Vec<Arc<Queue>> =
            self.inner.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.stop().await;
        }

        info!("queue manager stopped");
        self.inner.events.emit(ManagerEvent::Stopped);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Run a Redis ping plus per-queue checks and aggregate the verdict.
    ///
    /// Never fails: anything unexpected collapses into a failing synthetic
    /// `system-health` check.
    pub async fn health_check(&self) -> HealthReport {
        self.inner.health_check().await
    }

    /// Per-queue stats plus connection-pool info; returns a copy.
    pub async fn get_metrics(&self) -> ManagerMetrics {
        self.inner.collect_metrics().await
    }

    /// Re-emit a queue's send events on the manager bus.
    fn spawn_event_forwarder(&self, queue: &Arc<Queue>) {
        let mut rx = queue.events().subscribe();
        let events = self.inner.events.clone();
        let queue_name = queue.name().to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(QueueEvent::MessageSent { message_id, .. }) => {
                        events.emit(ManagerEvent::MessageSent {
                            queue: queue_name.clone(),
                            message_id,
                        });
                    }
                    Ok(QueueEvent::Error { message }) => {
                        events.emit(ManagerEvent::Error { message });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.forwarders.lock().unwrap().push(handle);
    }

    fn spawn_health_loop(&self) {
        let (tx, mut rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_millis(self.inner.config.health_check.interval_ms.max(100));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = inner.health_check().await;
                        if report.status != HealthStatus::Healthy {
                            warn!(status = report.status.as_str(), "health check not healthy");
                        }
                        inner.events.emit(ManagerEvent::HealthCheck {
                            status: report.status,
                        });
                    }
                }
            }
        });
        self.inner.loops.lock().unwrap().push((tx, handle));
    }

    fn spawn_metrics_loop(&self) {
        let (tx, mut rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_millis(self.inner.config.monitoring.interval_ms.max(100));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let metrics = inner.collect_metrics().await;
                        for (name, stats) in &metrics.queues {
                            crate::metrics::set_queue_depth(name, stats.length as f64);
                        }
                        debug!(queues = metrics.queues.len(), "metrics collected");
                        inner.events.emit(ManagerEvent::MetricsUpdated);
                    }
                }
            }
        });
        self.inner.loops.lock().unwrap().push((tx, handle));
    }
}

impl ManagerInner {
    async fn health_check(&self) -> HealthReport {
        let mut checks = Vec::new();

        let outcome: Result<(), QueueError> = async {
            let started = Instant::now();
            let redis_ok = self.connections.health_check().await;
            checks.push(CheckResult {
                name: "redis-ping".to_string(),
                healthy: redis_ok,
                duration_ms: started.elapsed().as_millis() as u64,
                error: (!redis_ok).then(|| "ping failed".to_string()),
            });

            let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
            for queue in queues {
                let started = Instant::now();
                let running = queue.is_running();
                let info = queue.get_info().await;
                let healthy = running && info.is_ok();
                let error = if !running {
                    Some("not running".to_string())
                } else {
                    info.err().map(|e| e.to_string())
                };
                checks.push(CheckResult {
                    name: format!("queue:{}", queue.name()),
                    healthy,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error,
                });
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            checks.push(CheckResult {
                name: "system-health".to_string(),
                healthy: false,
                duration_ms: 0,
                error: Some(e.to_string()),
            });
        }

        let redis_healthy = checks
            .first()
            .map(|c| c.name == "redis-ping" && c.healthy)
            .unwrap_or(false);
        let all_healthy = checks.iter().all(|c| c.healthy);

        let status = if all_healthy {
            HealthStatus::Healthy
        } else if redis_healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            checks,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    async fn collect_metrics(&self) -> ManagerMetrics {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        let mut stats = HashMap::new();
        for queue in queues {
            match queue.get_stats().await {
                Ok(queue_stats) => {
                    stats.insert(queue.name().to_string(), queue_stats);
                }
                Err(e) => {
                    debug!(queue = queue.name(), error = %e, "failed to collect queue stats");
                }
            }
        }

        ManagerMetrics {
            queues: stats,
            connections: self.connections.connection_info().await,
            pool_size: self.connections.pool_size(),
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for (tx, handle) in self.loops.lock().unwrap().drain(..) {
            let _ = tx.send(true);
            handle.abort();
        }
        for handle in self.forwarders.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    fn manager() -> QueueManager {
        QueueManager::new(QueueManagerConfig::new(RedisConfig::single_node(
            "127.0.0.1",
            6379,
        )))
        .unwrap()
    }

    #[test]
    fn test_new_rejects_missing_redis() {
        let config = QueueManagerConfig::new(RedisConfig {
            single: None,
            cluster: None,
            pool_size: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        });
        assert!(matches!(
            QueueManager::new(config),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(QueueManager::validate_queue_name("task-queue_1").is_ok());
        assert!(QueueManager::validate_queue_name("").is_err());
        assert!(QueueManager::validate_queue_name("has space").is_err());
        assert!(QueueManager::validate_queue_name("dotted.name").is_err());
        assert!(QueueManager::validate_queue_name("slash/name").is_err());
        assert!(QueueManager::validate_queue_name("at@name").is_err());
        assert!(QueueManager::validate_queue_name(&"q".repeat(100)).is_ok());
        assert!(QueueManager::validate_queue_name(&"q".repeat(101)).is_err());
    }

    #[tokio::test]
    async fn test_create_queue_requires_connection() {
        let manager = manager();
        let result = manager.create_queue("orders", None).await;
        assert!(matches!(result, Err(QueueError::ConnectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_connection() {
        let manager = manager();
        let result = manager.create_queue("bad name", None).await;
        assert!(matches!(result, Err(QueueError::InvalidQueueName(_))));
    }

    #[tokio::test]
    async fn test_delete_unknown_queue_returns_false() {
        let manager = manager();
        assert!(!manager.delete_queue("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_queues_empty() {
        let manager = manager();
        assert!(manager.list_queues().await.is_empty());
    }
}
