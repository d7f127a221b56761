use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{StoryId, StoryStatus};

/// Lifecycle events published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConveyorEvent {
    #[serde(rename = "agent.created")]
    AgentCreated {
        agent_id: Uuid,
        agent_type: String,
        provider: String,
        model: String,
    },
    #[serde(rename = "agent.invoked")]
    AgentInvoked {
        agent_id: Uuid,
        agent_type: String,
        duration_ms: u64,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
        success: bool,
    },
    #[serde(rename = "agent.destroyed")]
    AgentDestroyed { agent_id: Uuid, agent_type: String },
    #[serde(rename = "story.started")]
    StoryStarted { story_id: StoryId },
    #[serde(rename = "story.status_changed")]
    StoryStatusChanged { story_id: StoryId, status: StoryStatus },
    #[serde(rename = "story.failed")]
    StoryFailed { story_id: StoryId, reason: String },
    #[serde(rename = "stories.ready")]
    StoriesReady { story_ids: Vec<StoryId> },
    #[serde(rename = "escalation.created")]
    EscalationCreated {
        escalation_id: Uuid,
        story_id: Option<StoryId>,
        description: String,
    },
    #[serde(rename = "pr.created")]
    PrCreated {
        story_id: StoryId,
        number: u64,
        url: String,
    },
    #[serde(rename = "pr.merged")]
    PrMerged { story_id: StoryId, number: u64 },
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a receiver that
/// sees every event published afterwards. Cloning shares the subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<ConveyorEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<ConveyorEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.senders();
        senders.push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning disconnected ones.
    pub fn publish(&self, event: ConveyorEvent) {
        let mut senders = self.senders();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<ConveyorEvent>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_events_and_dropped_ones_are_pruned() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        drop(rx2);

        bus.publish(ConveyorEvent::StoryStarted {
            story_id: "1-1".into(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(
            rx1.try_recv().unwrap(),
            ConveyorEvent::StoryStarted {
                story_id: "1-1".into()
            }
        );
    }

    #[test]
    fn events_serialize_with_dotted_type_tag() {
        let event = ConveyorEvent::PrMerged {
            story_id: "2-1".into(),
            number: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pr.merged");
        assert_eq!(json["number"], 7);
    }

    #[test]
    fn bus_keeps_publishing_after_a_panic_while_locked() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let inner = bus.inner.clone();
        let held = std::thread::spawn(move || {
            let _guard = inner.lock().unwrap();
            panic!("panicked while holding the subscriber list");
        })
        .join();
        assert!(held.is_err());

        bus.publish(ConveyorEvent::StoryStarted {
            story_id: "1-2".into(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }
}
