//! Priority routing and delayed delivery against a containerized Redis.

use chrono::Utc;
use message_queue::{
    Message, Producer, QueueConfigOverrides, QueueManager, QueueManagerConfig, RedisConfig,
};
use serde_json::json;
use std::sync::Arc;
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
async fn high_priority_bypasses_batching() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "task-queue",
            Some(QueueConfigOverrides::default().with_priority(true)),
        )
        .await?;

    // batch_size 100 means ordinary sends would sit in the buffer
    let producer = Producer::new(Arc::clone(&queue), None);
    producer.start().await;

    let result = tokio::time::timeout(
        Duration::from_millis(500),
        producer.send_priority(Message::new(json!({"alert": true})), 9),
    )
    .await
    .expect("priority send must not wait for a batch flush")?;

    assert!(result.success);
    assert!(result.redis_message_id.is_some());

    // landed directly on the priority-9 stream
    let mut conn = redis.connection();
    let len: usize = redis::cmd("XLEN")
        .arg("queue:task-queue:priority:9")
        .query_async(&mut conn)
        .await?;
    assert_eq!(len, 1);

    producer.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn delayed_send_stages_in_sorted_set() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager.create_queue("reminder-queue", None).await?;

    let producer = Producer::new(Arc::clone(&queue), None);
    producer.start().await;

    let before = Utc::now().timestamp_millis();
    let result = producer
        .send_delayed(Message::new(json!({"kind": "reminder"})), 60_000)
        .await?;

    assert!(result.success);
    assert!(result.delayed);
    let execute_at = result.execute_at.expect("delayed result carries executeAt");
    assert!(execute_at >= before + 60_000);
    assert!(execute_at <= Utc::now().timestamp_millis() + 61_000);

    // staged in the delayed set, not on the stream
    let mut conn = redis.connection();
    let staged: usize = redis::cmd("ZCARD")
        .arg("queue:reminder-queue:delayed")
        .query_async(&mut conn)
        .await?;
    assert_eq!(staged, 1);
    assert_eq!(queue.get_length().await?, 0);

    // the member's score is the due time
    let scores: Vec<(String, i64)> = redis::cmd("ZRANGE")
        .arg("queue:reminder-queue:delayed")
        .arg(0)
        .arg(-1)
        .arg("WITHSCORES")
        .query_async(&mut conn)
        .await?;
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].1, execute_at);

    producer.stop().await;
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn sweeper_promotes_due_messages() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "sweep-queue",
            Some(QueueConfigOverrides::default()),
        )
        .await?;

    let message = Message::new(json!({"kind": "due-soon"})).with_priority(6);
    let message_id = message.id.clone();
    let result = queue
        .send(message.with_delay_ms(300), None)
        .await?;
    assert!(result.delayed);

    // sweep interval is 1s; give it a couple of rounds
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let mut conn = redis.connection();
    let staged: usize = redis::cmd("ZCARD")
        .arg("queue:sweep-queue:delayed")
        .query_async(&mut conn)
        .await?;
    assert_eq!(staged, 0, "due entry should have left the delayed set");

    let promoted = queue.query_messages(10, 0).await?;
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].id, message_id);
    assert_eq!(promoted[0].priority, 6);

    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn get_length_sums_priority_tiers() -> eyre::Result<()> {
    let redis = TestRedis::new().await;
    let manager = setup(&redis).await?;
    let queue = manager
        .create_queue(
            "tiered-queue",
            Some(QueueConfigOverrides::default().with_priority(true)),
        )
        .await?;

    for p in [0u8, 4, 9] {
        queue
            .send(Message::new(json!({"p": p})).with_priority(p), None)
            .await?;
    }

    assert_eq!(queue.get_length().await?, 3);

    let stats = queue.get_stats().await?;
    assert_eq!(stats.length, 3);
    assert!(stats.running);

    manager.stop().await;
    Ok(())
}
