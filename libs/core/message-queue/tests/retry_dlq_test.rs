//! Handler retries and dead-lettering against a containerized Redis.

use message_queue::{
    ConsumerConfig, DeadLetterManager, Message, QueueConfigOverrides, QueueError, QueueHandler,
    QueueManager, QueueManagerConfig, RedisConfig, RetryConfig, RetryPolicySpec,
    RetryStrategyKind,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::TestRedis;

async fn setup(redis: &TestRedis) -> eyre::Result<QueueManager> {
    let config =
        QueueManagerConfig::new(RedisConfig::single_node("127.0.0.1", redis.host_port()));
    let manager = QueueManager::new(config)?;
    manager.connect().await?;
    manager.start().await?;
    Ok(manager)
}

/// Exponential policy with short delays so tests stay fast.
fn fast_retry_policy() -> RetryPolicySpec {
    RetryPolicySpec::Config(
        RetryConfig::default()
            .with_strategy(RetryStrategyKind::Exponential)
            .with_max_attempts(3)
            .with_base_delay_ms(100)
            .with_jitter(false),
    )
}

#[tokio::test]
async fn handler_failures_retry_then_succeed() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager.create_queue("retry-queue", None).await?;

    let invocations = Arc::new(AtomicUsize::new(0));
    let final_retry_count = Arc::new(AtomicU32::new(u32::MAX));

    let calls = Arc::clone(&invocations);
    let observed = Arc::clone(&final_retry_count);
    let handler = QueueHandler::single_fn(move |message: Message, _ctx| {
        let calls = Arc::clone(&calls);
        let observed = Arc::clone(&observed);
        async move {
            // fail twice, succeed on the third delivery
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(QueueError::Handler("temporary downstream failure".into()))
            } else {
                observed.store(message.retry_count, Ordering::SeqCst);
                Ok(())
            }
        }
    });

    let consumer = message_queue::Consumer::new(
        Arc::clone(&queue),
        handler,
        manager.connections().default_connection().await?,
        ConsumerConfig::default()
            .with_auto_ack(true)
            .with_timeout_ms(500)
            .with_retry_policy(fast_retry_policy()),
    )?;
    consumer.start().await?;

    queue.send(Message::new(json!({"job": "flaky"})), None).await?;

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    // the successful delivery was the twice-retried successor
    assert_eq!(final_retry_count.load(Ordering::SeqCst), 2);
    assert_eq!(consumer.get_metrics().messages_processed, 1);

    consumer.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_land_in_dlq() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "task-queue",
            Some(
                QueueConfigOverrides::default()
                    .with_dead_letter_queue("task-queue-dlq"),
            ),
        )
        .await?;

    let invocations = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&invocations);
    let handler = QueueHandler::single_fn(move |_message, _ctx| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(QueueError::Handler("always failing".into()))
        }
    });

    let consumer = message_queue::Consumer::new(
        Arc::clone(&queue),
        handler,
        manager.connections().default_connection().await?,
        ConsumerConfig::default()
            .with_timeout_ms(500)
            .with_retry_policy(fast_retry_policy()),
    )?;
    consumer.start().await?;

    queue.send(Message::new(json!({"job": "doomed"})), None).await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    consumer.stop().await;

    // three attempts total, then dead-lettered
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let dlq = DeadLetterManager::new(
        manager.connections().default_connection().await?,
        "task-queue-dlq",
        10_000,
    );
    let stats = dlq.get_stats().await?;
    assert_eq!(stats.length, 1);
    assert_eq!(stats.by_origin_queue.get("task-queue"), Some(&1));
    assert_eq!(stats.by_reason.get("max_retries_exceeded"), Some(&1));

    let entries = dlq.query_messages(10, 0).await?;
    assert_eq!(entries.len(), 1);
    let (_, dead) = &entries[0];
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.failure_reason, "max_retries_exceeded");
    assert_eq!(dead.original_queue, "task-queue");

    // nothing left pending for the group: every delivery was acked
    let (group, _) = consumer.identity();
    let mut conn = redis.connection();
    let pending: redis::Value = redis::cmd("XPENDING")
        .arg("queue:task-queue")
        .arg(group)
        .query_async(&mut conn)
        .await?;
    if let redis::Value::Array(items) = pending {
        assert_eq!(items[0], redis::Value::Int(0));
    } else {
        panic!("unexpected XPENDING reply: {pending:?}");
    }

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn dlq_reprocess_restores_message() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "orders",
            Some(QueueConfigOverrides::default().with_dead_letter_queue("orders-dlq")),
        )
        .await?;

    let dlq = DeadLetterManager::new(
        manager.connections().default_connection().await?,
        "orders-dlq",
        10_000,
    );

    // dead-letter a message by hand
    let mut failed = Message::new(json!({"order": 7}));
    failed.retry_count = 2;
    let dlq_id = dlq
        .add_message(&failed, "max_retries_exceeded", "orders", None)
        .await?;

    let new_id = dlq.reprocess_message(&dlq_id, None).await?;

    // gone from the DLQ
    assert_eq!(dlq.get_stats().await?.length, 0);

    // a fresh message with retry_count 0 and provenance header on the queue
    let messages = queue.query_messages(10, 0).await?;
    let restored = messages
        .iter()
        .find(|m| m.id == new_id)
        .expect("reprocessed message on target queue");
    assert_eq!(restored.retry_count, 0);
    assert_eq!(restored.payload, json!({"order": 7}));
    assert_eq!(
        restored.headers.get("reprocessedFrom").map(String::as_str),
        Some(dlq_id.as_str())
    );

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn dlq_cleanup_and_purge() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    manager.create_queue("cleanup-src", None).await?;

    let dlq = DeadLetterManager::new(
        manager.connections().default_connection().await?,
        "cleanup-dlq",
        10_000,
    );

    dlq.add_message(&Message::new(json!({"a": 1})), "boom", "cleanup-src", None)
        .await?;
    dlq.add_message(&Message::new(json!({"a": 2})), "boom", "cleanup-src", None)
        .await?;
    assert_eq!(dlq.get_stats().await?.length, 2);

    // nothing is older than an hour
    assert_eq!(dlq.cleanup(3_600_000).await?, 0);

    // everything is older than "0 ms ago"
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dlq.cleanup(0).await?, 2);
    assert_eq!(dlq.get_stats().await?.length, 0);

    dlq.add_message(&Message::new(json!({"a": 3})), "boom", "cleanup-src", None)
        .await?;
    assert_eq!(dlq.purge().await?, 1);
    assert_eq!(dlq.get_stats().await?.length, 0);

    manager.stop().await;
    Ok(())
}
