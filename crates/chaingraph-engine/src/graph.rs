//! Flow Graph Snapshot: an immutable-at-run view of a [`Flow`],
//! taken at execution-creation time.
//!
//! Edits to the source flow after a snapshot is taken never affect a
//! running execution: the snapshot owns its own clone of the
//! flow rather than borrowing from whatever store produced it.

use std::collections::HashMap;

use crate::model::{Edge, EdgeId, Flow, Node, NodeId, PortId};
use crate::validation::is_system_edge;

/// A value snapshot of one [`Flow`], indexed for the per-port and
/// per-node edge lookups the scheduler needs on every readiness check.
#[derive(Debug, Clone)]
pub struct FlowGraphSnapshot {
    flow: Flow,
    incoming: HashMap<NodeId, Vec<EdgeId>>,
    outgoing: HashMap<NodeId, Vec<EdgeId>>,
    edges_by_id: HashMap<EdgeId, Edge>,
}

impl FlowGraphSnapshot {
    pub fn new(flow: Flow) -> Self {
        let mut incoming: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<EdgeId>> = HashMap::new();
        let mut edges_by_id = HashMap::new();

        for edge in &flow.edges {
            incoming.entry(edge.target_node_id.clone()).or_default().push(edge.id.clone());
            outgoing.entry(edge.source_node_id.clone()).or_default().push(edge.id.clone());
            edges_by_id.insert(edge.id.clone(), edge.clone());
        }

        Self {
            flow,
            incoming,
            outgoing,
            edges_by_id,
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.flow.nodes.iter().map(|n| &n.id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.flow.node(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges_by_id.get(id)
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.incoming
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edges_by_id.get(id))
            .collect()
    }

    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edges_by_id.get(id))
            .collect()
    }

    pub fn edges_from_port(&self, node_id: &str, port_id: &str) -> Vec<&Edge> {
        self.outgoing_edges(node_id)
            .into_iter()
            .filter(|e| e.source_port_id == port_id)
            .collect()
    }

    pub fn edges_to_port(&self, node_id: &str, port_id: &str) -> Vec<&Edge> {
        self.incoming_edges(node_id)
            .into_iter()
            .filter(|e| e.target_port_id == port_id)
            .collect()
    }

    /// True iff both endpoints of `edge` are system (flow-control) ports.
    pub fn is_system_edge(&self, edge: &Edge) -> bool {
        is_system_edge(&self.flow, edge)
    }

    /// Nodes with no incoming system edge: ready to run at flow start.
    pub fn roots(&self) -> Vec<NodeId> {
        self.flow
            .nodes
            .iter()
            .filter(|n| {
                !self
                    .incoming_edges(&n.id)
                    .iter()
                    .any(|e| self.is_system_edge(e))
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Named-event bindings to child flow ids.
    pub fn child_flow_for_event(&self, event_name: &str) -> Option<&str> {
        self.flow.event_child_flows.get(event_name).map(|s| s.as_str())
    }

    /// Every data-port id this node exposes as an output (used when
    /// collecting a completed node's produced values).
    pub fn output_port_ids(&self, node_id: &str) -> Vec<PortId> {
        self.node(node_id)
            .map(|n| {
                n.ports
                    .iter()
                    .filter(|p| matches!(p.direction, crate::model::PortDirection::Output | crate::model::PortDirection::Passthrough))
                    .map(|p| p.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;
    use crate::model::PortDirection;
    use crate::value::PortConfig;

    fn linear_flow() -> Flow {
        FlowBuilder::new("f1", "Linear")
            .add_node("a", "noop", "A")
            .add_system_port("a", "then", PortDirection::Output)
            .add_data_port("a", "out", PortDirection::Output, PortConfig::Number)
            .add_node("b", "noop", "B")
            .add_system_port("b", "start", PortDirection::Input)
            .add_data_port("b", "in", PortDirection::Input, PortConfig::Number)
            .add_system_edge("a", "then", "b", "start")
            .add_data_edge("a", "out", "b", "in")
            .build()
    }

    #[test]
    fn roots_has_no_incoming_system_edge() {
        let snapshot = FlowGraphSnapshot::new(linear_flow());
        assert_eq!(snapshot.roots(), vec!["a".to_string()]);
    }

    #[test]
    fn incoming_and_outgoing_edges_lookup() {
        let snapshot = FlowGraphSnapshot::new(linear_flow());
        assert_eq!(snapshot.outgoing_edges("a").len(), 2);
        assert_eq!(snapshot.incoming_edges("b").len(), 2);
        assert!(snapshot.incoming_edges("a").is_empty());
    }

    #[test]
    fn edges_from_port_filters_by_port_id() {
        let snapshot = FlowGraphSnapshot::new(linear_flow());
        let from_then = snapshot.edges_from_port("a", "a.then");
        assert_eq!(from_then.len(), 1);
        assert!(snapshot.is_system_edge(from_then[0]));

        let from_out = snapshot.edges_from_port("a", "out");
        assert_eq!(from_out.len(), 1);
        assert!(!snapshot.is_system_edge(from_out[0]));
    }

    #[test]
    fn snapshot_is_a_value_independent_of_further_flow_edits() {
        let flow = linear_flow();
        let snapshot = FlowGraphSnapshot::new(flow.clone());
        let mut mutated = flow;
        mutated.edges.clear();
        // The snapshot keeps its own copy; mutating the source `Flow` value
        // (which the caller owns independently) cannot reach it.
        assert_eq!(snapshot.flow().edges.len(), 2);
        assert_eq!(mutated.edges.len(), 0);
    }
}
