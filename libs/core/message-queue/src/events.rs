//! Typed lifecycle events per component.
//!
//! Each component owns an `EventBus` over a tokio broadcast channel.
//! `subscribe` hands back a receiver; dropping it is the unsubscribe.
//! Emission never blocks and never fails when nobody is listening.

use crate::manager::HealthStatus;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default buffered events per subscriber before lag kicks in.
const DEFAULT_CAPACITY: usize = 256;

/// Broadcast fan-out for component events. Clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver an event to current subscribers. Lagging or absent
    /// subscribers are not an error.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream` for `while let Some(..)` loops.
    pub fn stream(&self) -> BroadcastStream<E> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by the queue manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Connected,
    Disconnected,
    Started,
    Stopped,
    QueueCreated { name: String },
    QueueDeleted { name: String },
    Error { message: String },
    HealthCheck { status: HealthStatus },
    MetricsUpdated,
    MessageSent { queue: String, message_id: String },
    MessageReceived { queue: String, message_id: String },
}

/// Events emitted by a queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Started,
    Stopped,
    MessageSent {
        message_id: String,
        redis_message_id: Option<String>,
    },
    BatchSent {
        count: usize,
    },
    Error {
        message: String,
    },
}

/// Events emitted by a consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Started,
    Stopped,
    Paused,
    Resumed,
    MessageAcked {
        message_id: String,
    },
    MessageNacked {
        message_id: String,
        requeue: bool,
    },
    MessageError {
        message_id: Option<String>,
        error: String,
    },
    MessagesProcessed {
        count: usize,
    },
    MessageRetried {
        message_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    MessageDeadLettered {
        message_id: String,
        reason: String,
    },
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { name: String },
    Disconnected { name: String },
    Error { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus: EventBus<QueueEvent> = EventBus::new();
        bus.emit(QueueEvent::Started);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus: EventBus<ConsumerEvent> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ConsumerEvent::MessageAcked {
            message_id: "m-1".to_string(),
        });

        match rx.recv().await.unwrap() {
            ConsumerEvent::MessageAcked { message_id } => assert_eq!(message_id, "m-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_unsubscribes() {
        let bus: EventBus<QueueEvent> = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
