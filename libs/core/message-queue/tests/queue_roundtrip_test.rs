//! End-to-end publish/consume tests against a containerized Redis.

use message_queue::{
    ConsumerConfig, Message, MessageOptions, Producer, ProducerConfig, QueueConfigOverrides,
    QueueHandler, QueueManager, QueueManagerConfig, RedisConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
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

#[tokio::test]
async fn simple_round_trip() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "task-queue",
            Some(
                QueueConfigOverrides::default()
                    .with_max_length(10_000)
                    .with_retry_attempts(3),
            ),
        )
        .await?;

    // consumer first so its group covers the send
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let handler = QueueHandler::single_fn(move |_message, ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.ack().await
        }
    });
    let consumer = message_queue::Consumer::new(
        Arc::clone(&queue),
        handler,
        manager.connections().default_connection().await?,
        ConsumerConfig::default()
            .with_concurrency(2)
            .with_timeout_ms(500),
    )?;
    consumer.start().await?;

    let producer = Producer::new(Arc::clone(&queue), None);
    producer.start().await;
    let result = producer
        .send(
            Message::new(json!({"type": "email", "to": "u@x"})),
            None,
        )
        .await?;
    assert!(result.success);

    // give the batch flush and the consumer a moment
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(processed.load(Ordering::SeqCst), 1);
    let metrics = consumer.get_metrics();
    assert_eq!(metrics.messages_processed, 1);
    assert!(metrics.last_processed_at.is_some());

    // the entry was acknowledged: nothing pending for the group
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

    producer.stop().await;
    consumer.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn batched_publish_preserves_order() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager.create_queue("batch-queue", None).await?;

    let producer = Producer::new(Arc::clone(&queue), Some(ProducerConfig::default()));
    producer.start().await;

    let before = queue.get_length().await?;
    let options = MessageOptions {
        priority: Some(3),
        ..Default::default()
    };
    let results = producer
        .send_batch(
            vec![
                Message::new(json!({"n": 1})),
                Message::new(json!({"n": 2})),
                Message::new(json!({"n": 3})),
            ],
            Some(&options),
        )
        .await?;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.success));

    // one timestamp for the whole batch
    assert_eq!(results[0].timestamp, results[1].timestamp);
    assert_eq!(results[1].timestamp, results[2].timestamp);

    // entry ids are monotonically increasing
    let ids: Vec<&String> = results
        .iter()
        .map(|r| r.redis_message_id.as_ref().unwrap())
        .collect();
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);

    assert_eq!(queue.get_length().await?, before + 3);

    let metrics = producer.get_metrics();
    assert_eq!(metrics.batches_sent, 1);
    assert_eq!(metrics.messages_sent, 3);

    producer.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn stored_messages_keep_their_fields() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager.create_queue("fidelity-queue", None).await?;

    let sent = Message::new(json!({"payload": {"deep": [1, 2, 3]}}))
        .with_priority(7)
        .with_header("tenant", "acme")
        .with_source("integration-test")
        .with_trace_id("trace-42");
    let result = queue.send(sent.clone(), None).await?;
    assert!(result.success);

    let stored = queue.query_messages(10, 0).await?;
    assert_eq!(stored.len(), 1);
    let stored = &stored[0];
    assert_eq!(stored.id, sent.id);
    assert_eq!(stored.payload, sent.payload);
    assert_eq!(stored.priority, 7);
    assert_eq!(stored.headers.get("tenant").map(String::as_str), Some("acme"));
    assert_eq!(stored.source, "integration-test");
    assert_eq!(stored.trace_id.as_deref(), Some("trace-42"));
    assert_eq!(stored.retry_count, 0);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn purge_empties_all_streams() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "purge-queue",
            Some(QueueConfigOverrides::default().with_priority(true)),
        )
        .await?;

    for p in [0u8, 5, 9] {
        let options = MessageOptions {
            priority: Some(p),
            ..Default::default()
        };
        queue.send(Message::new(json!({"p": p})), Some(&options)).await?;
    }
    assert_eq!(queue.get_length().await?, 3);

    let purged = queue.purge().await?;
    assert_eq!(purged, 3);
    assert_eq!(queue.get_length().await?, 0);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn lifecycle_is_idempotent() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;

    // second start is a no-op
    manager.start().await?;

    let queue = manager.create_queue("idem-queue", None).await?;
    queue.start().await?;
    queue.start().await?;
    assert!(queue.is_running());

    queue.stop().await;
    queue.stop().await;
    assert!(!queue.is_running());

    manager.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_queue_is_rejected() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;

    manager.create_queue("dup-queue", None).await?;
    let second = manager.create_queue("dup-queue", None).await;
    assert!(matches!(
        second,
        Err(message_queue::QueueError::QueueAlreadyExists(_))
    ));

    assert!(manager.delete_queue("dup-queue").await?);
    assert!(manager.list_queues().await.is_empty());

    manager.stop().await;
    Ok(())
}
