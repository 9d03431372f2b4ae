//! Execution event log.
//!
//! Every state change the scheduler makes is recorded as an [`Event`] with
//! a strictly increasing `index`. Events are the one channel the engine
//! uses to talk to the outside world: the [`crate::store::ExecutionStore`]
//! persists them and every live subscriber (`crate::engine::ExecutionEngine::subscribe_to_events`)
//! is fed from the same ordered sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EdgeId, ExecutionId, FlowId, NodeId};

/// One entry in an execution's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic within one execution; `(execution_id, index)` is unique.
    pub index: u64,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    /// The event-type name used for `eventTypes` subscription filtering
    /// and for the `(execution_id, event_type)` store index.
    pub fn type_name(&self) -> &'static str {
        self.data.type_name()
    }
}

/// Type-specific payload for one [`Event`]. Variant names are
/// SCREAMING_SNAKE_CASE identifiers such as `NODE_STARTED`, matching the
/// wire format and the store's `event_type` column, and consistent with
/// the subscription protocol's `eventTypes` filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    FlowStarted { flow_id: FlowId },
    FlowCompleted,
    FlowFailed { message: String, node_id: Option<NodeId> },
    FlowCancelled,
    FlowPaused,
    FlowResumed,

    NodeStarted { node_id: NodeId },
    NodeCompleted { node_id: NodeId, outputs: serde_json::Value },
    NodeFailed { node_id: NodeId, cause: String },
    NodeSkipped { node_id: NodeId },
    NodeTimedOut { node_id: NodeId },

    EdgeTransferStarted {
        edge_id: EdgeId,
        source_node_id: NodeId,
        target_node_id: NodeId,
    },
    EdgeTransferCompleted {
        edge_id: EdgeId,
        source_node_id: NodeId,
        target_node_id: NodeId,
    },

    DebugBreakpointHit { node_id: NodeId },
    DebugStepTaken { node_id: NodeId },

    /// A node emitted a named event via its [`crate::context::ExecutionContext`].
    /// `child_execution_id` is set iff the flow bound `name` to a child flow.
    UserEvent {
        node_id: NodeId,
        name: String,
        payload: serde_json::Value,
        child_execution_id: Option<ExecutionId>,
    },
}

impl EventData {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventData::FlowStarted { .. } => "FLOW_STARTED",
            EventData::FlowCompleted => "FLOW_COMPLETED",
            EventData::FlowFailed { .. } => "FLOW_FAILED",
            EventData::FlowCancelled => "FLOW_CANCELLED",
            EventData::FlowPaused => "FLOW_PAUSED",
            EventData::FlowResumed => "FLOW_RESUMED",
            EventData::NodeStarted { .. } => "NODE_STARTED",
            EventData::NodeCompleted { .. } => "NODE_COMPLETED",
            EventData::NodeFailed { .. } => "NODE_FAILED",
            EventData::NodeSkipped { .. } => "NODE_SKIPPED",
            EventData::NodeTimedOut { .. } => "NODE_TIMED_OUT",
            EventData::EdgeTransferStarted { .. } => "EDGE_TRANSFER_STARTED",
            EventData::EdgeTransferCompleted { .. } => "EDGE_TRANSFER_COMPLETED",
            EventData::DebugBreakpointHit { .. } => "DEBUG_BREAKPOINT_HIT",
            EventData::DebugStepTaken { .. } => "DEBUG_STEP_TAKEN",
            EventData::UserEvent { .. } => "USER_EVENT",
        }
    }

    /// True for the three statuses a subscriber's stream always ends on.
    pub fn is_flow_terminal(&self) -> bool {
        matches!(
            self,
            EventData::FlowCompleted | EventData::FlowFailed { .. } | EventData::FlowCancelled
        )
    }
}

/// Flow-mutation events synthesised for the flow-level subscription.
/// Unlike execution [`Event`]s these describe the authoring graph
/// itself, not a run of it, so they carry no `index`/`execution_id` pair —
/// the flow-event subscription assigns its own sequence per `flowId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEvent {
    FlowInitStart { flow_id: FlowId },
    NodeAdded { flow_id: FlowId, node_id: NodeId },
    EdgeAdded { flow_id: FlowId, edge_id: EdgeId },
    NodeUiPositionChanged { flow_id: FlowId, node_id: NodeId, x: f64, y: f64 },
    MetadataUpdated { flow_id: FlowId },
    FlowInitEnd { flow_id: FlowId },
}

impl FlowEvent {
    /// The flow this mutation belongs to, used to route it to the right
    /// flow-event hub without requiring the caller to pass it separately.
    pub fn flow_id(&self) -> &str {
        match self {
            FlowEvent::FlowInitStart { flow_id }
            | FlowEvent::NodeAdded { flow_id, .. }
            | FlowEvent::EdgeAdded { flow_id, .. }
            | FlowEvent::NodeUiPositionChanged { flow_id, .. }
            | FlowEvent::MetadataUpdated { flow_id }
            | FlowEvent::FlowInitEnd { flow_id } => flow_id,
        }
    }
}
