//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing.

use redis::Client;
use redis::aio::MultiplexedConnection;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is
/// dropped. Queue components connect through `host_port()`; raw assertions
/// against streams and sorted sets go through `connection()`.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    host_port: u16,
}

impl TestRedis {
    /// Start a Redis container and connect to it.
    ///
    /// Uses the Redis 8 Alpine image.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let client = Client::open(format!("redis://127.0.0.1:{host_port}"))
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            host_port,
        }
    }

    /// Host port the container maps 6379 to; pair with `127.0.0.1`.
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Connection URL for manual client creation.
    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.host_port)
    }

    /// Get a cloned raw connection for assertions against Redis state.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Wipe the whole keyspace between test phases.
    pub async fn flush_all(&self) {
        let mut conn = self.connection();
        let _: () = redis::cmd("FLUSHALL")
            .query_async(&mut conn)
            .await
            .expect("FLUSHALL failed");
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_streams_round_trip() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let id: String = redis::cmd("XADD")
            .arg("t:stream")
            .arg("*")
            .arg("field")
            .arg("value")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(id.contains('-'));

        let len: usize = redis::cmd("XLEN")
            .arg("t:stream")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn test_flush_all() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let _: () = redis::cmd("SET")
            .arg("k")
            .arg("v")
            .query_async(&mut conn)
            .await
            .unwrap();
        redis.flush_all().await;

        let exists: bool = redis::cmd("EXISTS")
            .arg("k")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(!exists);
    }
}
