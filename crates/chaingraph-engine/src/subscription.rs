//! Event subscription protocol: a resumable, filterable view
//! over an execution's or a flow's event stream.
//!
//! A subscription is always initial-state replay followed by a live tail,
//! never two separate APIs. Replay and live
//! delivery can race — a subscriber can attach after the replay snapshot was
//! taken but before it observes the live queue's backlog — so every
//! subscription tracks the highest index it has yielded and silently skips
//! anything at or below that, rather than risking a gap.

use std::collections::{HashSet, VecDeque};

use crate::events::{Event, FlowEvent};
use crate::queue::EventQueue;
use std::sync::Arc;

/// A live, resumable subscription to one execution's event stream.
pub struct EventSubscription {
    replay: VecDeque<Event>,
    queue: Option<Arc<EventQueue<Event>>>,
    filter: Option<HashSet<String>>,
    last_index: u64,
}

impl EventSubscription {
    /// `queue` is `None` for a terminal execution served purely from the
    /// store: the subscription ends once `replay` drains.
    pub fn new(
        replay: VecDeque<Event>,
        queue: Option<Arc<EventQueue<Event>>>,
        filter: Option<HashSet<String>>,
        start_index: u64,
    ) -> Self {
        Self {
            replay,
            queue,
            filter,
            last_index: start_index,
        }
    }

    /// Next event in the combined replay+live sequence, or `None` once the
    /// stream has ended (execution terminal and fully drained).
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let event = match self.replay.pop_front() {
                Some(event) => event,
                None => match &self.queue {
                    Some(queue) => queue.recv().await?,
                    None => return None,
                },
            };
            if event.index <= self.last_index {
                continue;
            }
            self.last_index = event.index;
            if self.passes_filter(event.type_name()) {
                return Some(event);
            }
        }
    }

    fn passes_filter(&self, type_name: &str) -> bool {
        self.filter.as_ref().is_none_or(|types| types.contains(type_name))
    }
}

/// The flow-level counterpart of [`EventSubscription`]: indexed so it
/// is resumable the same way, but scoped to one `flowId` rather than one
/// execution.
#[derive(Debug, Clone)]
pub struct IndexedFlowEvent {
    pub index: u64,
    pub event: FlowEvent,
}

impl IndexedFlowEvent {
    pub fn type_name(&self) -> &'static str {
        match &self.event {
            FlowEvent::FlowInitStart { .. } => "FLOW_INIT_START",
            FlowEvent::NodeAdded { .. } => "NODE_ADDED",
            FlowEvent::EdgeAdded { .. } => "EDGE_ADDED",
            FlowEvent::NodeUiPositionChanged { .. } => "NODE_UI_POSITION_CHANGED",
            FlowEvent::MetadataUpdated { .. } => "METADATA_UPDATED",
            FlowEvent::FlowInitEnd { .. } => "FLOW_INIT_END",
        }
    }
}

pub struct FlowEventSubscription {
    replay: VecDeque<IndexedFlowEvent>,
    queue: Arc<EventQueue<IndexedFlowEvent>>,
    filter: Option<HashSet<String>>,
    last_index: u64,
}

impl FlowEventSubscription {
    pub fn new(
        replay: VecDeque<IndexedFlowEvent>,
        queue: Arc<EventQueue<IndexedFlowEvent>>,
        filter: Option<HashSet<String>>,
        start_index: u64,
    ) -> Self {
        Self {
            replay,
            queue,
            filter,
            last_index: start_index,
        }
    }

    pub async fn next(&mut self) -> Option<IndexedFlowEvent> {
        loop {
            let event = match self.replay.pop_front() {
                Some(event) => event,
                None => self.queue.recv().await?,
            };
            if event.index <= self.last_index {
                continue;
            }
            self.last_index = event.index;
            if self.filter.as_ref().is_none_or(|types| types.contains(event.type_name())) {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use chrono::Utc;

    fn event(index: u64, data: EventData) -> Event {
        Event {
            index,
            execution_id: "exec-1".to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    #[tokio::test]
    async fn replay_then_live_in_order_with_no_duplicates() {
        let queue = Arc::new(EventQueue::new(10));
        let replay: VecDeque<Event> = vec![event(1, EventData::FlowStarted { flow_id: "f".into() })].into();
        // A live event with an index already covered by replay must be
        // skipped rather than re-delivered.
        queue.publish(event(1, EventData::FlowStarted { flow_id: "f".into() }));
        queue.publish(event(2, EventData::NodeStarted { node_id: "a".into() }));

        let mut sub = EventSubscription::new(replay, Some(queue), None, 0);
        let first = sub.next().await.unwrap();
        assert_eq!(first.index, 1);
        let second = sub.next().await.unwrap();
        assert_eq!(second.index, 2);
    }

    #[tokio::test]
    async fn event_type_filter_skips_without_breaking_sequence() {
        let queue = Arc::new(EventQueue::new(10));
        queue.publish(event(1, EventData::NodeStarted { node_id: "a".into() }));
        queue.publish(event(2, EventData::NodeCompleted { node_id: "a".into(), outputs: serde_json::json!({}) }));

        let mut filter = HashSet::new();
        filter.insert("NODE_COMPLETED".to_string());
        let mut sub = EventSubscription::new(VecDeque::new(), Some(queue), Some(filter), 0);
        let event = sub.next().await.unwrap();
        assert_eq!(event.index, 2);
        assert_eq!(event.type_name(), "NODE_COMPLETED");
    }

    #[tokio::test]
    async fn store_only_subscription_ends_after_replay_drains() {
        let replay: VecDeque<Event> = vec![event(1, EventData::FlowCompleted)].into();
        let mut sub = EventSubscription::new(replay, None, None, 0);
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }
}
