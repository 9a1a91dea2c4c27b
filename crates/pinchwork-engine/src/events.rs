//! In-memory event fan-out
//!
//! Each subscribed agent gets a bounded broadcast channel. Delivery is
//! best-effort: with no subscriber the event is dropped, and a slow
//! consumer overflows its buffer, loses the oldest events, and sees a lag
//! marker telling it to resync by polling.

use pinchwork_types::{AgentId, EventLag, MarketEvent, MarketEventEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Per-agent event fan-out. Cheap to clone; clones share the channels.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<AgentId, broadcast::Sender<MarketEventEnvelope>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to an agent's event stream.
    pub async fn subscribe(&self, agent_id: &AgentId) -> EventStream {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(agent_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        EventStream {
            receiver: sender.subscribe(),
        }
    }

    /// Publish an event to one agent; dropped when nobody listens.
    pub async fn publish(&self, agent_id: &AgentId, event: MarketEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(agent_id) {
            let _ = sender.send(MarketEventEnvelope::new(event));
        }
    }

    /// Publish an event to several agents.
    pub async fn publish_many(&self, agent_ids: &[AgentId], event: MarketEvent) {
        let channels = self.channels.read().await;
        for agent_id in agent_ids {
            if let Some(sender) = channels.get(agent_id) {
                let _ = sender.send(MarketEventEnvelope::new(event.clone()));
            }
        }
    }
}

/// One agent's view of the event stream.
pub struct EventStream {
    receiver: broadcast::Receiver<MarketEventEnvelope>,
}

impl EventStream {
    /// Receive the next event. `Some(Err(lag))` reports dropped events;
    /// the stream remains usable afterwards. `None` means the bus is gone.
    pub async fn recv(&mut self) -> Option<Result<MarketEventEnvelope, EventLag>> {
        match self.receiver.recv().await {
            Ok(envelope) => Some(Ok(envelope)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Err(EventLag { missed })),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking poll used by tests.
    pub fn try_recv(&mut self) -> Option<Result<MarketEventEnvelope, EventLag>> {
        match self.receiver.try_recv() {
            Ok(envelope) => Some(Ok(envelope)),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(Err(EventLag { missed })),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinchwork_types::TaskId;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let agent = AgentId::generate();
        let mut stream = bus.subscribe(&agent).await;

        let task_id = TaskId::generate();
        bus.publish(&agent, MarketEvent::TaskCancelled { task_id: task_id.clone() })
            .await;

        let envelope = stream.recv().await.unwrap().unwrap();
        assert_eq!(envelope.task_id(), &task_id);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let bus = EventBus::new(8);
        let agent = AgentId::generate();
        // No subscriber; must not error or block.
        bus.publish(&agent, MarketEvent::TaskCancelled { task_id: TaskId::generate() })
            .await;
    }

    #[tokio::test]
    async fn test_slow_consumer_sees_lag_marker() {
        let bus = EventBus::new(2);
        let agent = AgentId::generate();
        let mut stream = bus.subscribe(&agent).await;

        for _ in 0..5 {
            bus.publish(&agent, MarketEvent::TaskCancelled { task_id: TaskId::generate() })
                .await;
        }

        let first = stream.try_recv().unwrap();
        assert!(matches!(first, Err(EventLag { missed: 3 })));
        // The stream keeps delivering the retained tail.
        assert!(stream.try_recv().unwrap().is_ok());
        assert!(stream.try_recv().unwrap().is_ok());
    }
}
