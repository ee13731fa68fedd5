//! Redis connection management.
//!
//! `RedisConnection` gives the rest of the library one interface over a
//! single-node connection (auto-reconnecting `redis::aio::ConnectionManager`)
//! and a cluster connection, for the subset of commands the queue uses.
//! `ConnectionManager` owns the named connections, supervises reconnects,
//! and answers health checks.

use crate::config::RedisConfig;
use crate::error::QueueError;
use crate::events::{ConnectionEvent, EventBus};
use chrono::Utc;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamInfoStreamReply, StreamRangeReply, StreamReadReply};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ceiling on waiting for a connection to become ready.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for a health-check PING.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A live Redis connection, single node or cluster.
pub enum RedisConnection {
    Single(redis::aio::ConnectionManager),
    Cluster(ClusterConnection),
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => write!(f, "RedisConnection::Single"),
            Self::Cluster(_) => write!(f, "RedisConnection::Cluster"),
        }
    }
}

impl Clone for RedisConnection {
    fn clone(&self) -> Self {
        match self {
            Self::Single(conn) => Self::Single(conn.clone()),
            Self::Cluster(conn) => Self::Cluster(conn.clone()),
        }
    }
}

macro_rules! run_cmd {
    ($self:expr, $cmd:expr, $ty:ty) => {
        match $self {
            RedisConnection::Single(conn) => {
                let mut conn = conn.clone();
                $cmd.query_async::<$ty>(&mut conn).await
            }
            RedisConnection::Cluster(conn) => {
                let mut conn = conn.clone();
                $cmd.query_async::<$ty>(&mut conn).await
            }
        }
    };
}

impl RedisConnection {
    /// PING, returning the raw reply.
    pub async fn ping(&self) -> Result<String, redis::RedisError> {
        run_cmd!(self, redis::cmd("PING"), String)
    }

    /// XADD with optional `MAXLEN ~` trimming; returns the entry id.
    pub async fn xadd(
        &self,
        stream: &str,
        max_length: Option<i64>,
        fields: &[(&str, String)],
    ) -> Result<String, redis::RedisError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_length {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (key, value) in fields {
            cmd.arg(*key).arg(value);
        }
        run_cmd!(self, cmd, String)
    }

    /// Pipelined XADDs; one entry id per input, in order.
    pub async fn xadd_pipelined(
        &self,
        entries: &[(String, Option<i64>, Vec<(&str, String)>)],
    ) -> Result<Vec<String>, redis::RedisError> {
        let mut pipe = redis::pipe();
        for (stream, max_length, fields) in entries {
            let cmd = pipe.cmd("XADD").arg(stream);
            if let Some(max_len) = max_length {
                cmd.arg("MAXLEN").arg("~").arg(*max_len);
            }
            cmd.arg("*");
            for (key, value) in fields {
                cmd.arg(*key).arg(value);
            }
        }
        match self {
            Self::Single(conn) => {
                let mut conn = conn.clone();
                pipe.query_async(&mut conn).await
            }
            Self::Cluster(conn) => {
                let mut conn = conn.clone();
                pipe.query_async(&mut conn).await
            }
        }
    }

    /// XREADGROUP over one or more streams.
    pub async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> Result<StreamReadReply, redis::RedisError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("STREAMS");
        for stream in streams {
            cmd.arg(stream);
        }
        for _ in streams {
            cmd.arg(id);
        }
        run_cmd!(self, cmd, StreamReadReply)
    }

    pub async fn xack(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<i64, redis::RedisError> {
        run_cmd!(
            self,
            redis::cmd("XACK").arg(stream).arg(group).arg(id),
            i64
        )
    }

    pub async fn xdel(&self, stream: &str, id: &str) -> Result<i64, redis::RedisError> {
        run_cmd!(self, redis::cmd("XDEL").arg(stream).arg(id), i64)
    }

    /// XRANGE with an optional COUNT.
    pub async fn xrange(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<StreamRangeReply, redis::RedisError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg(start).arg(end);
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        run_cmd!(self, cmd, StreamRangeReply)
    }

    pub async fn xlen(&self, stream: &str) -> Result<u64, redis::RedisError> {
        run_cmd!(self, redis::cmd("XLEN").arg(stream), u64)
    }

    /// XGROUP CREATE with MKSTREAM; the caller decides what BUSYGROUP means.
    pub async fn xgroup_create_mkstream(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), redis::RedisError> {
        run_cmd!(
            self,
            redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg("$")
                .arg("MKSTREAM"),
            ()
        )
    }

    pub async fn xinfo_stream(
        &self,
        stream: &str,
    ) -> Result<StreamInfoStreamReply, redis::RedisError> {
        run_cmd!(
            self,
            redis::cmd("XINFO").arg("STREAM").arg(stream),
            StreamInfoStreamReply
        )
    }

    pub async fn zadd(
        &self,
        key: &str,
        score: i64,
        member: &str,
    ) -> Result<(), redis::RedisError> {
        run_cmd!(
            self,
            redis::cmd("ZADD").arg(key).arg(score).arg(member),
            ()
        )
    }

    /// Members with score up to `max`, oldest first, bounded by `count`.
    pub async fn zrangebyscore(
        &self,
        key: &str,
        max: i64,
        count: usize,
    ) -> Result<Vec<String>, redis::RedisError> {
        run_cmd!(
            self,
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .arg("LIMIT")
                .arg(0)
                .arg(count),
            Vec<String>
        )
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<i64, redis::RedisError> {
        run_cmd!(self, redis::cmd("ZREM").arg(key).arg(member), i64)
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, redis::RedisError> {
        run_cmd!(self, redis::cmd("ZCARD").arg(key), u64)
    }

    pub async fn del(&self, keys: &[String]) -> Result<i64, redis::RedisError> {
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        run_cmd!(self, cmd, i64)
    }
}

/// Kind of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Single,
    Cluster,
}

/// Lifecycle status of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// Metadata tracked per managed connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    pub endpoint: String,
    pub created_at: i64,
    pub last_used: i64,
    pub error_count: u32,
}

struct ConnectionEntry {
    handle: RedisConnection,
    info: ConnectionInfo,
}

/// Owns the primary Redis connection plus named secondaries.
pub struct ConnectionManager {
    config: RedisConfig,
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    events: Arc<EventBus<ConnectionEvent>>,
    reconnect: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ConnectionManager {
    pub const DEFAULT_NAME: &'static str = "default";

    pub fn new(config: RedisConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
            reconnect: Mutex::new(None),
        })
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.events
    }

    fn endpoint_summary(config: &RedisConfig) -> (ConnectionKind, String) {
        if let Some(single) = &config.single {
            (
                ConnectionKind::Single,
                format!("{}:{}", single.host, single.port),
            )
        } else {
            let cluster = config.cluster.as_ref().expect("validated config");
            (
                ConnectionKind::Cluster,
                cluster
                    .nodes
                    .iter()
                    .map(|n| format!("{}:{}", n.host, n.port))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        }
    }

    /// Open one connection per the config, bounded by the ready timeout.
    async fn establish(config: &RedisConfig) -> Result<RedisConnection, QueueError> {
        let connect = async {
            if let Some(single) = &config.single {
                let client = redis::Client::open(single.url())?;
                let conn = redis::aio::ConnectionManager::new(client).await?;
                Ok(RedisConnection::Single(conn))
            } else {
                let cluster = config.cluster.as_ref().expect("validated config");
                let urls: Vec<String> = cluster.nodes.iter().map(|n| n.url()).collect();
                let mut builder = ClusterClientBuilder::new(urls);
                if let Some(password) = cluster.password.clone() {
                    builder = builder.password(password);
                }
                let client = builder.build()?;
                let conn = client.get_async_connection().await?;
                Ok(RedisConnection::Cluster(conn))
            }
        };

        tokio::time::timeout(READY_TIMEOUT, connect)
            .await
            .map_err(|_| QueueError::Timeout("connection not ready within 10s".to_string()))?
    }

    /// Establish the primary connection, retrying per the config.
    pub async fn connect(&self) -> Result<(), QueueError> {
        if self.is_connected().await {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 1..=self.config.retry_attempts.max(1) {
            match Self::establish(&self.config).await {
                Ok(handle) => {
                    self.register(Self::DEFAULT_NAME, handle, &self.config).await;
                    info!(attempt, "connected to Redis");
                    self.events.emit(ConnectionEvent::Connected {
                        name: Self::DEFAULT_NAME.to_string(),
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Redis connection attempt failed");
                    self.events.emit(ConnectionEvent::Error {
                        name: Self::DEFAULT_NAME.to_string(),
                        message: e.to_string(),
                    });
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| QueueError::Configuration("no connection endpoint".to_string())))
    }

    async fn register(&self, name: &str, handle: RedisConnection, config: &RedisConfig) {
        let (kind, endpoint) = Self::endpoint_summary(config);
        let now = Utc::now().timestamp_millis();
        let entry = ConnectionEntry {
            handle,
            info: ConnectionInfo {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                kind,
                status: ConnectionStatus::Connected,
                endpoint,
                created_at: now,
                last_used: now,
                error_count: 0,
            },
        };
        self.connections.write().await.insert(name.to_string(), entry);
    }

    /// Close every owned connection and cancel any armed reconnect.
    pub async fn disconnect(&self) {
        self.cancel_reconnect();
        self.connections.write().await.clear();
        self.events.emit(ConnectionEvent::Disconnected {
            name: Self::DEFAULT_NAME.to_string(),
        });
        info!("disconnected from Redis");
    }

    pub async fn is_connected(&self) -> bool {
        self.connections
            .read()
            .await
            .get(Self::DEFAULT_NAME)
            .map(|e| e.info.status == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    /// Clone a live handle by name.
    pub async fn get_connection(&self, name: &str) -> Result<RedisConnection, QueueError> {
        let mut connections = self.connections.write().await;
        let entry = connections
            .get_mut(name)
            .ok_or_else(|| QueueError::ConnectionNotFound(name.to_string()))?;
        entry.info.last_used = Utc::now().timestamp_millis();
        Ok(entry.handle.clone())
    }

    /// Convenience for the primary connection.
    pub async fn default_connection(&self) -> Result<RedisConnection, QueueError> {
        self.get_connection(Self::DEFAULT_NAME).await
    }

    /// Open a named secondary connection, with an optional config override.
    pub async fn create_connection(
        &self,
        name: &str,
        override_config: Option<RedisConfig>,
    ) -> Result<RedisConnection, QueueError> {
        let config = override_config.unwrap_or_else(|| self.config.clone());
        config.validate()?;
        let handle = Self::establish(&config).await?;
        self.register(name, handle.clone(), &config).await;
        self.events.emit(ConnectionEvent::Connected {
            name: name.to_string(),
        });
        Ok(handle)
    }

    /// Drop a named connection; false when unknown.
    pub async fn remove_connection(&self, name: &str) -> bool {
        let removed = self.connections.write().await.remove(name).is_some();
        if removed {
            self.events.emit(ConnectionEvent::Disconnected {
                name: name.to_string(),
            });
        }
        removed
    }

    /// PING the primary connection with a 5 s deadline.
    ///
    /// A failed ping marks the connection errored and arms the reconnect
    /// task.
    pub async fn health_check(&self) -> bool {
        let handle = match self.default_connection().await {
            Ok(handle) => handle,
            Err(_) => return false,
        };

        let healthy = matches!(
            tokio::time::timeout(PING_TIMEOUT, handle.ping()).await,
            Ok(Ok(reply)) if reply == "PONG"
        );

        if healthy {
            self.set_status(Self::DEFAULT_NAME, ConnectionStatus::Connected, false)
                .await;
        } else {
            warn!("Redis health check failed");
            self.set_status(Self::DEFAULT_NAME, ConnectionStatus::Error, true)
                .await;
            self.events.emit(ConnectionEvent::Disconnected {
                name: Self::DEFAULT_NAME.to_string(),
            });
            self.schedule_reconnect();
        }
        healthy
    }

    async fn set_status(&self, name: &str, status: ConnectionStatus, count_error: bool) {
        if let Some(entry) = self.connections.write().await.get_mut(name) {
            entry.info.status = status;
            if count_error {
                entry.info.error_count += 1;
            }
        }
    }

    /// Snapshot of all connection metadata.
    pub async fn connection_info(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Advisory pool size from the config.
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// Arm the reconnect task. At most one task is armed at a time; it
    /// reschedules itself until a connection is re-established.
    fn schedule_reconnect(&self) {
        let mut guard = self.reconnect.lock().unwrap();
        if let Some((_, handle)) = guard.as_ref()
            && !handle.is_finished()
        {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let config = self.config.clone();
        let connections = Arc::clone(&self.connections);
        let events = Arc::clone(&self.events);
        let retry_delay = Duration::from_millis(config.retry_delay_ms.clamp(1000, 5000));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(retry_delay) => {}
                }

                match Self::establish(&config).await {
                    Ok(handle) => {
                        let (kind, endpoint) = Self::endpoint_summary(&config);
                        let now = Utc::now().timestamp_millis();
                        connections.write().await.insert(
                            Self::DEFAULT_NAME.to_string(),
                            ConnectionEntry {
                                handle,
                                info: ConnectionInfo {
                                    id: Uuid::new_v4().to_string(),
                                    name: Self::DEFAULT_NAME.to_string(),
                                    kind,
                                    status: ConnectionStatus::Connected,
                                    endpoint,
                                    created_at: now,
                                    last_used: now,
                                    error_count: 0,
                                },
                            },
                        );
                        info!("Redis reconnected");
                        events.emit(ConnectionEvent::Connected {
                            name: Self::DEFAULT_NAME.to_string(),
                        });
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "reconnect attempt failed, rescheduling");
                        events.emit(ConnectionEvent::Error {
                            name: Self::DEFAULT_NAME.to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        });

        *guard = Some((tx, handle));
    }

    fn cancel_reconnect(&self) {
        if let Some((tx, handle)) = self.reconnect.lock().unwrap().take() {
            let _ = tx.send(true);
            handle.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some((tx, handle)) = self.reconnect.lock().unwrap().take() {
            let _ = tx.send(true);
            handle.abort();
        }
    }
}
