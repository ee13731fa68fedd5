//! Shared test utilities for queue testing
//!
//! This crate provides reusable test infrastructure:
//! - `TestRedis`: Redis container with automatic cleanup
//! - `unique_name`: collision-free queue/stream names per test
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let queue_name = test_utils::unique_name("orders");
//!     // build a RedisConfig against redis.host_port() ...
//! }
//! ```

mod redis;

pub use redis::TestRedis;

use uuid::Uuid;

/// Generate a unique, valid queue name for a test.
///
/// Queue names only accept `[a-zA-Z0-9_-]`, so the uuid is embedded in its
/// simple form.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_differ() {
        assert_ne!(unique_name("q"), unique_name("q"));
    }

    #[test]
    fn test_unique_name_charset() {
        let name = unique_name("task");
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }
}
