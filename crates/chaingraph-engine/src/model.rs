//! Core data model: Flow, Node, Port and Edge.
//!
//! These are plain, serializable value types. A `Flow` is authored and
//! stored externally; the engine only ever reads one through a
//! [`crate::graph::FlowGraphSnapshot`] taken at execution-creation time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::PortConfig;

pub type FlowId = String;
pub type NodeId = String;
pub type PortId = String;
pub type EdgeId = String;
pub type ExecutionId = String;

/// Direction of a port. A `Passthrough` port behaves as an input when an
/// edge targets it and otherwise exposes its stored value as an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
    Passthrough,
}

/// Whether a port carries flow-control (`System`) or a value (`Data`).
/// System ports are the `start`/`then`/`error`/`complete` family used for
/// branching and sequencing; only edges between two system ports are
/// subject to the no-cycle invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    System,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    /// Unique among sibling ports at the same nesting level.
    pub key: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub config: PortConfig,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
}

impl Port {
    pub fn data_input(id: impl Into<String>, key: impl Into<String>, config: PortConfig) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            direction: PortDirection::Input,
            kind: PortKind::Data,
            config,
            default_value: None,
        }
    }

    pub fn data_output(id: impl Into<String>, key: impl Into<String>, config: PortConfig) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            direction: PortDirection::Output,
            kind: PortKind::Data,
            config,
            default_value: None,
        }
    }

    pub fn system(id: impl Into<String>, key: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            direction,
            kind: PortKind::System,
            config: PortConfig::Boolean,
            default_value: None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.config, PortConfig::Stream { .. })
    }
}

/// A node instance within a flow. `execute` is an external collaborator:
/// this struct only carries the opaque configuration and port
/// topology; behavior is looked up by `node_type` in a
/// [`crate::registry::NodeRegistry`] at execution time, against an
/// explicitly declared node schema rather than runtime reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub ports: Vec<Port>,
    /// Bumped on any mutation; used for edit concurrency control, never
    /// consulted by the scheduler.
    #[serde(default)]
    pub version: u64,
}

impl Node {
    pub fn port(&self, port_id: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.id == port_id)
    }

    pub fn system_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.kind == PortKind::System)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_node_id: NodeId,
    pub source_port_id: PortId,
    pub target_node_id: NodeId,
    pub target_port_id: PortId,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub version: u64,
}

/// A directed graph of nodes authored by the user. Flows are
/// value-immutable during a single execution: the engine only ever
/// reads a snapshot taken at `create()` time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: FlowId,
    pub metadata: FlowMetadata,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Named events this flow binds to child-flow ids, consulted when a
    /// node emits a user event.
    #[serde(default)]
    pub event_child_flows: HashMap<String, FlowId>,
}

impl Flow {
    pub fn new(flow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            metadata: FlowMetadata {
                name: name.into(),
                ..Default::default()
            },
            nodes: Vec::new(),
            edges: Vec::new(),
            event_child_flows: HashMap::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Status machine for an [`crate::engine::ExecutionEngine`] execution
/// instance. `Completed`, `Failed` and `Cancelled` are terminal and
/// immutable once set; `Skipped` is reserved for the execution-tree view
/// of a child execution whose parent never selected the binding event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Skipped
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Per-execution overrides accepted by `create()`. Any field left
/// `None` falls back to the process-wide [`crate::config::EngineConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
    #[serde(default)]
    pub flow_timeout_ms: Option<u64>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub breakpoints: Vec<NodeId>,
    /// Owner identity, stored on the execution row for `listRootsFor`.
    #[serde(default)]
    pub owner: Option<String>,
    /// Set by the engine itself when spawning a child execution;
    /// not normally supplied by a caller of `create()`.
    #[serde(default)]
    pub parent_execution_id: Option<ExecutionId>,
    /// External-event payload carried into a child execution.
    #[serde(default)]
    pub external_event: Option<serde_json::Value>,
}

/// Offending-node error detail carried by a failed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    pub node_id: Option<NodeId>,
}

/// Timing and status snapshot returned by `getState()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub flow_id: FlowId,
    pub status: ExecutionStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<ExecutionError>,
    pub execution_depth: u32,
    pub parent_execution_id: Option<ExecutionId>,
}
